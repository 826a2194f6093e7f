use crate::crd::{SubclusterType, VerticaDB};
use crate::dispatcher::{Dispatch, Operation};

use super::podfacts::PodFacts;

use vertdb_operator::controller::Context;
use vertdb_operator::error::Result;

use std::collections::HashSet;

use tracing::warn;

const MAX_SHARD_TO_NODE_RATIO: f64 = 3.0;

/// Adds any subcluster present in the spec but missing from the catalog, then tops up per-pod
/// membership and rebalances. Runs after the database is initialized; a no-op before that.
pub async fn reconcile_add(vdb: &VerticaDB, ctx: &Context<VerticaDB>, facts: &mut PodFacts) -> Result<()> {
    let Ok(dispatcher) = super::select_dispatcher(vdb, ctx, facts) else {
        return Ok(());
    };

    let catalog_subclusters: HashSet<&str> = facts
        .by_pod
        .values()
        .filter(|f| f.db_exists.is_true())
        .map(|f| f.subcluster.as_str())
        .collect();

    let mut any_added = false;
    for sc in &vdb.spec.subclusters {
        if catalog_subclusters.contains(sc.name.as_str()) {
            continue;
        }
        dispatcher
            .dispatch(Operation::AddSubcluster {
                name: sc.name.clone(),
                is_primary: sc.type_ == SubclusterType::Primary,
            })
            .await?;
        any_added = true;

        let ratio = sc.size as f64 / vdb.spec.shard_count.max(1) as f64;
        if ratio > MAX_SHARD_TO_NODE_RATIO {
            warn!(
                msg = "subcluster shard-to-node ratio is high",
                subcluster = sc.name,
                ratio
            );
        }
    }

    let added_nodes = add_missing_nodes(vdb, ctx, facts, &dispatcher).await?;

    if any_added || added_nodes {
        dispatcher
            .dispatch(Operation::RebalanceShards { subcluster: None })
            .await?;
        facts.invalidate();
    }

    Ok(())
}

async fn add_missing_nodes(
    vdb: &VerticaDB,
    _ctx: &Context<VerticaDB>,
    facts: &mut PodFacts,
    dispatcher: &impl Dispatch,
) -> Result<bool> {
    let mut added = false;
    for sc in &vdb.spec.subclusters {
        let pending: Vec<_> = facts
            .by_pod
            .values()
            .filter(|f| f.subcluster == sc.name && f.installed.is_true() && !f.db_exists.is_true())
            .filter_map(|f| f.ip)
            .collect();
        if pending.is_empty() {
            continue;
        }
        dispatcher
            .dispatch(Operation::AddNode {
                subcluster: sc.name.clone(),
                hosts: pending,
            })
            .await?;
        added = true;
    }
    Ok(added)
}

/// Removes subclusters/nodes no longer present in the spec. Node removal always precedes
/// subcluster removal so a shrinking subcluster drains before the subcluster itself goes away.
pub async fn reconcile_remove(vdb: &VerticaDB, ctx: &Context<VerticaDB>, facts: &mut PodFacts) -> Result<()> {
    let Ok(dispatcher) = super::select_dispatcher(vdb, ctx, facts) else {
        return Ok(());
    };

    let spec_names: HashSet<&str> = vdb.spec.subclusters.iter().map(|sc| sc.name.as_str()).collect();

    let pending_delete_vnodes: Vec<String> = facts
        .by_pod
        .values()
        .filter(|f| f.is_pending_delete && f.db_exists.is_true())
        .filter_map(|f| f.vnode_name.clone())
        .collect();
    if !pending_delete_vnodes.is_empty() {
        dispatcher
            .dispatch(Operation::RemoveNode {
                vnodes: pending_delete_vnodes,
            })
            .await?;
        facts.invalidate();
    }

    let catalog_subclusters: HashSet<String> = facts
        .by_pod
        .values()
        .map(|f| f.subcluster.clone())
        .filter(|name| !name.is_empty())
        .collect();

    for name in catalog_subclusters {
        if spec_names.contains(name.as_str()) {
            continue;
        }
        let is_default = vdb
            .spec
            .default_subcluster()
            .map(|sc| sc.name == name)
            .unwrap_or(false);
        if is_default {
            if let Some(replacement) = vdb.spec.subclusters.iter().find(|sc| sc.type_ == SubclusterType::Primary) {
                dispatcher
                    .dispatch(Operation::AlterSubclusterType {
                        name: replacement.name.clone(),
                        promote_to_primary: true,
                    })
                    .await?;
            }
        }
        dispatcher.dispatch(Operation::RemoveSubcluster { name }).await?;
        facts.invalidate();
    }

    reconcile_subcluster_type_changes(vdb, facts, &dispatcher).await
}

/// Promotes/demotes subclusters whose spec `type` no longer matches the catalog, rejecting any
/// change that would leave the main cluster without a primary.
async fn reconcile_subcluster_type_changes(
    vdb: &VerticaDB,
    facts: &PodFacts,
    dispatcher: &impl Dispatch,
) -> Result<()> {
    let catalog_primary_subclusters: HashSet<&str> = facts
        .by_pod
        .values()
        .filter(|f| f.node_state.as_deref() == Some("PRIMARY"))
        .map(|f| f.subcluster.as_str())
        .collect();

    for sc in &vdb.spec.subclusters {
        let catalog_is_primary = catalog_primary_subclusters.contains(sc.name.as_str());
        let wants_primary = sc.type_ == SubclusterType::Primary;
        if catalog_is_primary == wants_primary {
            continue;
        }
        if catalog_is_primary && !wants_primary && catalog_primary_subclusters.len() <= 1 {
            // demoting the catalog's last live primary would leave the cluster without quorum
            continue;
        }
        dispatcher
            .dispatch(Operation::AlterSubclusterType {
                name: sc.name.clone(),
                promote_to_primary: wants_primary,
            })
            .await?;
    }
    Ok(())
}
