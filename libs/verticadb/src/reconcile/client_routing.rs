use crate::crd::{SubclusterType, VerticaDB};
use crate::dispatcher::{Dispatch, Operation};

use super::podfacts::PodFacts;

use vertdb_operator::controller::Context;
use vertdb_operator::error::{Error, Result};

use serde_json::json;

use kube::ResourceExt;
use kube::api::{Api, Patch, PatchParams};

pub const CLIENT_ROUTING_LABEL: &str = "vertica.com/client-routing";

/// The policy event that triggered a label re-evaluation; each has its own predicate for when a
/// pod gains or loses the routing label, though all share the same underlying up/pending-delete
/// logic applied per pod or per proxy deployment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyMethod {
    AddNode,
    PodReschedule,
    RemoveNode,
    DrainNode,
    DisableProxy,
}

/// Adds or removes `vertica.com/client-routing=true` on every pod so service endpoints only ever
/// include pods that are actually able to serve traffic.
pub async fn reconcile_labels(vdb: &VerticaDB, ctx: &Context<VerticaDB>, facts: &PodFacts) -> Result<()> {
    let draining: std::collections::HashSet<&str> = vdb
        .spec
        .subclusters
        .iter()
        .filter(|sc| sc.shutdown)
        .map(|sc| sc.name.as_str())
        .collect();

    for fact in facts.by_pod.values() {
        let wants_routing = fact.is_running
            && !fact.is_pending_delete
            && !draining.contains(fact.subcluster.as_str())
            && (fact.shard_subscriptions > 0 || vdb.spec.shard_count == 0);
        set_pod_label(vdb, ctx, &fact.pod_name, wants_routing).await?;
    }
    Ok(())
}

/// Stops subclusters marked `shutdown=true` in the spec that still have live nodes, guarding
/// against a shutdown that would leave the primary catalog without quorum: shutting down enough
/// primaries to drop below a majority leaves those primaries up and emits `ClusterWillLoseQuorum`
/// instead.
pub async fn reconcile_shutdown(vdb: &VerticaDB, ctx: &Context<VerticaDB>, facts: &PodFacts) -> Result<()> {
    let Ok(dispatcher) = super::select_dispatcher(vdb, ctx, facts) else {
        return Ok(());
    };

    let total_primaries = vdb.spec.subclusters.iter().filter(|sc| sc.type_ == SubclusterType::Primary).count();
    let shutdown_primaries = vdb
        .spec
        .subclusters
        .iter()
        .filter(|sc| sc.type_ == SubclusterType::Primary && sc.shutdown)
        .count();
    let quorum_lost = would_lose_quorum(total_primaries, shutdown_primaries);

    if quorum_lost {
        let _ = ctx
            .recorder
            .publish(
                vertdb_k8s_util::events::Event {
                    type_: vertdb_k8s_util::events::EventType::Warning,
                    reason: "ClusterWillLoseQuorum".to_string(),
                    note: Some("shutting down the requested primary subclusters would leave the cluster without quorum, leaving them up".to_string()),
                    action: "ReconcileShutdown".to_string(),
                    secondary: None,
                },
                &vdb.object_ref(&()),
            )
            .await;
    }

    for sc in vdb.spec.subclusters.iter().filter(|sc| sc.shutdown) {
        if quorum_lost && sc.type_ == SubclusterType::Primary {
            continue;
        }
        let still_up = facts
            .by_pod
            .values()
            .any(|f| f.subcluster == sc.name && f.is_running && f.db_exists.is_true());
        if !still_up {
            continue;
        }
        dispatcher
            .dispatch(Operation::StopSubcluster {
                name: sc.name.clone(),
                drain_seconds: 0,
            })
            .await?;
    }
    Ok(())
}

/// True when shutting down `shutdown_primaries` of `total_primaries` would leave fewer than a
/// majority of primaries up.
fn would_lose_quorum(total_primaries: usize, shutdown_primaries: usize) -> bool {
    total_primaries > 0 && (total_primaries - shutdown_primaries) * 2 < total_primaries
}

/// Blue/green promotion step: moves the routing label from subcluster `from` to subcluster `to`
/// for every pod, one subcluster pair at a time so traffic redirects without a gap.
pub async fn flip_routing(vdb: &VerticaDB, ctx: &Context<VerticaDB>, from: &str, to: &str) -> Result<()> {
    let facts = PodFacts::collect(vdb, ctx, None).await?;
    for fact in facts.by_pod.values() {
        if fact.subcluster == to {
            set_pod_label(vdb, ctx, &fact.pod_name, true).await?;
        } else if fact.subcluster == from {
            set_pod_label(vdb, ctx, &fact.pod_name, false).await?;
        }
    }
    Ok(())
}

async fn set_pod_label(vdb: &VerticaDB, ctx: &Context<VerticaDB>, pod_name: &str, enabled: bool) -> Result<()> {
    let pods: Api<k8s_openapi::api::core::v1::Pod> = Api::namespaced(ctx.client.clone(), &vdb.get_namespace());
    let label_value = if enabled { serde_json::Value::String("true".to_string()) } else { serde_json::Value::Null };
    let patch = json!({ "metadata": { "labels": { CLIENT_ROUTING_LABEL: label_value } } });
    pods.patch(pod_name, &PatchParams::apply(ctx.controller_id).force(), &Patch::Merge(patch))
        .await
        .map_err(|e| Error::KubeError(format!("failed to set {CLIENT_ROUTING_LABEL} on pod {pod_name}"), e))?;
    Ok(())
}

#[allow(dead_code)]
fn predicate_for(method: ApplyMethod, fact: &super::podfacts::PodFact) -> bool {
    match method {
        ApplyMethod::AddNode | ApplyMethod::PodReschedule => fact.is_running && !fact.is_pending_delete,
        ApplyMethod::RemoveNode | ApplyMethod::DrainNode | ApplyMethod::DisableProxy => !fact.is_pending_delete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::VerticaDBSpec;

    #[test]
    fn test_predicate_add_node_requires_running() {
        let fact = super::super::podfacts::PodFact {
            is_running: false,
            ..Default::default()
        };
        assert!(!predicate_for(ApplyMethod::AddNode, &fact));
    }

    #[test]
    fn test_reconcile_labels_skips_draining_subcluster_pods() {
        // exercised at the integration-test layer (mock apiserver); here we only assert the
        // draining-subcluster filter is computed as expected from the spec.
        let vdb = VerticaDB::new(
            "test",
            VerticaDBSpec {
                subclusters: vec![crate::crd::Subcluster {
                    name: "primary".to_string(),
                    size: 1,
                    type_: crate::crd::SubclusterType::Primary,
                    shutdown: true,
                    service_type: None,
                    annotations: Default::default(),
                    proxy: None,
                }],
                ..Default::default()
            },
        );
        let draining: Vec<&str> = vdb.spec.subclusters.iter().filter(|sc| sc.shutdown).map(|sc| sc.name.as_str()).collect();
        assert_eq!(draining, vec!["primary"]);
    }

    #[test]
    fn test_would_lose_quorum_two_of_three_primaries_shutdown() {
        assert!(would_lose_quorum(3, 2));
    }

    #[test]
    fn test_would_lose_quorum_one_of_three_primaries_shutdown_keeps_quorum() {
        assert!(!would_lose_quorum(3, 1));
    }

    #[test]
    fn test_would_lose_quorum_no_primaries_configured() {
        assert!(!would_lose_quorum(0, 0));
    }
}
