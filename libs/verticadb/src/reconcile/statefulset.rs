use crate::crd::{Subcluster, VerticaDB, VerticaDBStatus};

use vertdb_k8s_util::resources::merge_containers;

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec,
    PodTemplateSpec, ResourceRequirements, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use kube::api::ObjectMeta;

pub const SUBCLUSTER_LABEL: &str = "vertica.com/subcluster";
pub const VERTICADB_LABEL: &str = "vertica.com/verticadb";

const CONTAINER_NAME: &str = "vertica";
const CONTAINER_HTTPS_PORT: i32 = 8443;
const CONTAINER_CLIENT_PORT: i32 = 5433;
const VOLUME_DATA_NAME: &str = "local-data";

pub trait StatefulSetExt {
    fn statefulset_name(&self, subcluster: &str) -> String;
    /// Scaling-preserving object sync (actor 3): replica count is pulled from the previously
    /// observed status rather than the spec size whenever an upgrade phase has pinned it lower.
    fn create_statefulset(&self, subcluster: &Subcluster, status: &VerticaDBStatus) -> StatefulSet;
}

impl StatefulSetExt for VerticaDB {
    #[inline]
    fn statefulset_name(&self, subcluster: &str) -> String {
        format!("{}-{subcluster}", self.name_any())
    }

    fn create_statefulset(&self, subcluster: &Subcluster, status: &VerticaDBStatus) -> StatefulSet {
        let labels = self.generate_labels(subcluster);
        let replicas = replica_count_for(subcluster, status);

        let env = vec![
            EnvVar {
                name: "VERTICA_DB_NAME".to_string(),
                value: Some(self.spec.db_name.clone()),
                ..Default::default()
            },
            EnvVar {
                name: "VERTICA_SUBCLUSTER".to_string(),
                value: Some(subcluster.name.clone()),
                ..Default::default()
            },
        ];

        let volume_mounts = vec![
            VolumeMount {
                name: VOLUME_DATA_NAME.to_string(),
                mount_path: self.spec.local.data_path.clone(),
                ..Default::default()
            },
        ];

        let container = Container {
            name: CONTAINER_NAME.to_string(),
            image: Some(subcluster_image(self, subcluster)),
            ports: Some(vec![
                ContainerPort {
                    name: Some("https".to_string()),
                    container_port: CONTAINER_HTTPS_PORT,
                    ..Default::default()
                },
                ContainerPort {
                    name: Some("client".to_string()),
                    container_port: CONTAINER_CLIENT_PORT,
                    ..Default::default()
                },
            ]),
            env: Some(env),
            volume_mounts: Some(volume_mounts.clone()),
            ..Default::default()
        };
        let containers = merge_containers(None, &container);

        let pvcs = self
            .spec
            .local
            .request_size
            .as_ref()
            .map(|size| vec![data_pvc(size)]);

        let spec = StatefulSetSpec {
            replicas: Some(replicas as i32),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            service_name: self.statefulset_name(&subcluster.name),
            // Pods are rolled only when explicitly deleted by a reconcile actor (upgrade/restart),
            // never implicitly by a spec field change, so in-flight catalog membership is never
            // raced by the StatefulSet controller.
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("OnDelete".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    annotations: (!subcluster.annotations.is_empty())
                        .then(|| subcluster.annotations.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers,
                    volumes: Some(vec![]),
                    ..Default::default()
                }),
            },
            volume_claim_templates: pvcs,
            ..Default::default()
        };

        StatefulSet {
            metadata: ObjectMeta {
                name: Some(self.statefulset_name(&subcluster.name)),
                namespace: self.namespace(),
                labels: Some(labels),
                owner_references: Some(vec![self.controller_owner_ref(&()).unwrap()]),
                ..Default::default()
            },
            spec: Some(spec),
            ..Default::default()
        }
    }
}

impl VerticaDB {
    pub(crate) fn generate_labels(&self, subcluster: &Subcluster) -> BTreeMap<String, String> {
        BTreeMap::from([
            (VERTICADB_LABEL.to_string(), self.name_any()),
            (SUBCLUSTER_LABEL.to_string(), subcluster.name.clone()),
        ])
    }
}

fn replica_count_for(subcluster: &Subcluster, status: &VerticaDBStatus) -> u32 {
    status
        .subclusters
        .iter()
        .find(|s| s.name == subcluster.name)
        .map(|s| s.install_count.max(subcluster.size).min(subcluster.size))
        .unwrap_or(subcluster.size)
}

fn subcluster_image(vdb: &VerticaDB, subcluster: &Subcluster) -> String {
    vdb.spec
        .sandboxes
        .iter()
        .find(|sb| sb.subclusters.contains(&subcluster.name))
        .and_then(|sb| sb.image.clone())
        .unwrap_or_else(|| vdb.spec.image.clone())
}

fn data_pvc(size: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(VOLUME_DATA_NAME.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), Quantity(size.to_string()))])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CommunalStorage, LocalStorage, SubclusterType, VerticaDBSpec};

    fn test_vdb() -> VerticaDB {
        let mut vdb = VerticaDB::new(
            "test",
            VerticaDBSpec {
                image: "vertica/vertica-k8s:24.3.0".to_string(),
                communal: CommunalStorage {
                    path: "s3://bucket/db".to_string(),
                    ..Default::default()
                },
                local: LocalStorage::default(),
                subclusters: vec![Subcluster {
                    name: "primary".to_string(),
                    size: 3,
                    type_: SubclusterType::Primary,
                    shutdown: false,
                    service_type: None,
                    annotations: BTreeMap::new(),
                    proxy: None,
                }],
                db_name: "verticadb".to_string(),
                shard_count: 6,
                ..Default::default()
            },
        );
        vdb.meta_mut().namespace = Some("default".to_string());
        vdb
    }

    #[test]
    fn test_statefulset_name() {
        let vdb = test_vdb();
        assert_eq!(vdb.statefulset_name("primary"), "test-primary");
    }

    #[test]
    fn test_create_statefulset_uses_on_delete_strategy() {
        let vdb = test_vdb();
        let sts = vdb.create_statefulset(&vdb.spec.subclusters[0], &VerticaDBStatus::default());
        assert_eq!(
            sts.spec.unwrap().update_strategy.unwrap().type_.as_deref(),
            Some("OnDelete")
        );
    }

    #[test]
    fn test_create_statefulset_replicas_defaults_to_spec_size() {
        let vdb = test_vdb();
        let sts = vdb.create_statefulset(&vdb.spec.subclusters[0], &VerticaDBStatus::default());
        assert_eq!(sts.spec.unwrap().replicas, Some(3));
    }
}
