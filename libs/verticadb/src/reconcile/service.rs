use crate::crd::{Subcluster, VerticaDB};

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use kube::ResourceExt;
use kube::api::ObjectMeta;

use super::statefulset::StatefulSetExt;

pub trait ServiceExt {
    fn service_name(&self, subcluster: &str) -> String;
    fn create_service(&self, subcluster: &Subcluster) -> Service;
}

impl ServiceExt for VerticaDB {
    #[inline]
    fn service_name(&self, subcluster: &str) -> String {
        self.statefulset_name(subcluster)
    }

    fn create_service(&self, subcluster: &Subcluster) -> Service {
        let labels = self.generate_labels(subcluster);

        Service {
            metadata: ObjectMeta {
                name: Some(self.service_name(&subcluster.name)),
                namespace: self.namespace(),
                labels: Some(labels.clone()),
                owner_references: Some(vec![self.controller_owner_ref(&()).unwrap()]),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: subcluster.service_type.clone().or(Some("ClusterIP".to_string())),
                selector: Some(labels),
                ports: Some(vec![
                    ServicePort {
                        name: Some("https".to_string()),
                        port: 8443,
                        ..Default::default()
                    },
                    ServicePort {
                        name: Some("client".to_string()),
                        port: 5433,
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
