use crate::crd::{PodDetail, SubclusterStatus, VerticaDB};

use super::podfacts::PodFacts;

/// Rolls the collected pod facts up into the per-subcluster status the CRD renders (actor 16,
/// "trailing safety net"): install/added/up-node counts and per-pod detail.
pub fn collect_subcluster_status(vdb: &VerticaDB, facts: &PodFacts) -> Vec<SubclusterStatus> {
    vdb.spec
        .subclusters
        .iter()
        .map(|sc| {
            let pods: Vec<_> = facts
                .by_pod
                .values()
                .filter(|f| f.subcluster == sc.name)
                .collect();

            let detail: Vec<PodDetail> = pods
                .iter()
                .map(|f| PodDetail {
                    pod_name: f.pod_name.clone(),
                    installed: f.installed.is_true(),
                    added_to_db: f.db_exists.is_true(),
                    vnode_name: f.vnode_name.clone(),
                })
                .collect();

            SubclusterStatus {
                name: sc.name.clone(),
                oid: None,
                install_count: detail.iter().filter(|d| d.installed).count() as u32,
                added_to_db_count: detail.iter().filter(|d| d.added_to_db).count() as u32,
                up_node_count: pods.iter().filter(|f| f.is_running).count() as u32,
                shutdown: sc.shutdown,
                detail,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Subcluster, SubclusterType, VerticaDBSpec};
    use crate::reconcile::podfacts::{PodFact, TriState};

    fn vdb_with_subclusters(names: &[&str]) -> VerticaDB {
        VerticaDB::new(
            "test",
            VerticaDBSpec {
                subclusters: names
                    .iter()
                    .map(|name| Subcluster {
                        name: name.to_string(),
                        size: 1,
                        type_: SubclusterType::Primary,
                        shutdown: false,
                        service_type: None,
                        annotations: Default::default(),
                        proxy: None,
                    })
                    .collect(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_counts_installed_and_up_nodes_per_subcluster() {
        let vdb = vdb_with_subclusters(&["primary"]);
        let mut facts = PodFacts::default();
        facts.by_pod.insert(
            "pod-0".to_string(),
            PodFact {
                pod_name: "pod-0".to_string(),
                subcluster: "primary".to_string(),
                is_running: true,
                installed: TriState::True(()),
                db_exists: TriState::True(()),
                ..Default::default()
            },
        );
        facts.by_pod.insert(
            "pod-1".to_string(),
            PodFact {
                pod_name: "pod-1".to_string(),
                subcluster: "primary".to_string(),
                is_running: false,
                installed: TriState::True(()),
                db_exists: TriState::False,
                ..Default::default()
            },
        );

        let status = collect_subcluster_status(&vdb, &facts);
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].install_count, 2);
        assert_eq!(status[0].added_to_db_count, 1);
        assert_eq!(status[0].up_node_count, 1);
    }

    #[test]
    fn test_empty_subcluster_yields_zeroed_status() {
        let vdb = vdb_with_subclusters(&["secondary"]);
        let facts = PodFacts::default();
        let status = collect_subcluster_status(&vdb, &facts);
        assert_eq!(status[0].install_count, 0);
        assert_eq!(status[0].up_node_count, 0);
        assert!(status[0].detail.is_empty());
    }
}
