use crate::crd::{
    CONDITION_IMAGE_CHANGE_IN_PROGRESS, CONDITION_OFFLINE_UPGRADE_IN_PROGRESS,
    CONDITION_ONLINE_UPGRADE_IN_PROGRESS, CONDITION_READONLY_ONLINE_UPGRADE_IN_PROGRESS,
    SubclusterType, UpgradePolicy, VerticaDB, VerticaDBStatus,
};
use crate::dispatcher::{Dispatch, Operation};

use super::podfacts::PodFacts;
use super::statefulset::StatefulSetExt;
use super::status::set_condition;

use vertdb_operator::controller::{Context, KubeOperations};
use vertdb_operator::error::Result;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kube::api::{Api, DeleteParams, ListParams};
use kube::runtime::controller::Action;
use tokio::time::Duration;
use tracing::info;

/// Runs at most one upgrade strategy per reconcile and reports the requeue the driver should use
/// while it is in flight, or `None` once no strategy claims the reconcile (spec image already
/// matches every running pod).
pub async fn maybe_run(
    vdb: &VerticaDB,
    ctx: &Context<VerticaDB>,
    status: &VerticaDBStatus,
    facts: &mut PodFacts,
) -> Result<Option<Action>> {
    let Some(running_image) = current_running_image(vdb, ctx).await? else {
        return Ok(None);
    };
    if running_image == vdb.spec.image {
        return Ok(None);
    }

    if !vdb.spec.ignore_upgrade_path && is_downgrade(&running_image, &vdb.spec.image) {
        let _ = ctx
            .recorder
            .publish(
                vertdb_k8s_util::events::Event {
                    type_: vertdb_k8s_util::events::EventType::Warning,
                    reason: "UpgradeInvalid".to_string(),
                    note: Some(format!(
                        "refusing to downgrade from {running_image} to {}; set ignoreUpgradePath to override",
                        vdb.spec.image
                    )),
                    action: "Upgrade".to_string(),
                    secondary: None,
                },
                &vdb.object_ref(&()),
            )
            .await;
        return Ok(None);
    }

    let mut status = status.clone();
    set_condition(
        &mut status.conditions,
        CONDITION_IMAGE_CHANGE_IN_PROGRESS,
        true,
        "ImageChangeStarted",
        &format!("upgrading to {}", vdb.spec.image),
        vdb.meta().generation,
    );

    let requeue = Duration::from_secs(vdb.spec.upgrade_requeue_time as u64);

    match resolve_policy(vdb) {
        UpgradePolicy::Offline => offline_upgrade(vdb, ctx, facts, &mut status).await?,
        UpgradePolicy::ReadOnlyOnline => read_only_online_upgrade(vdb, ctx, facts, &mut status).await?,
        UpgradePolicy::Online => online_upgrade(vdb, ctx, facts, &mut status).await?,
        UpgradePolicy::Auto => unreachable!("resolve_policy never returns Auto"),
    }

    vdb.patch_status(ctx, status).await?;
    Ok(Some(Action::requeue(requeue)))
}

/// `Auto` resolves to `Online` when there is more than one primary subcluster (a blue/green swap
/// has somewhere to land), `ReadOnlyOnline` when there is exactly one primary and at least one
/// secondary (secondaries can serve reads during the primary restart), else `Offline`.
fn resolve_policy(vdb: &VerticaDB) -> UpgradePolicy {
    if vdb.spec.upgrade_policy != UpgradePolicy::Auto {
        return vdb.spec.upgrade_policy.clone();
    }
    let primaries = vdb.spec.subclusters.iter().filter(|sc| sc.type_ == SubclusterType::Primary).count();
    let secondaries = vdb.spec.subclusters.iter().filter(|sc| sc.type_ == SubclusterType::Secondary).count();
    if primaries > 1 {
        UpgradePolicy::Online
    } else if secondaries > 0 {
        UpgradePolicy::ReadOnlyOnline
    } else {
        UpgradePolicy::Offline
    }
}

/// The image tag any currently-running pod reports, or `None` if every pod already matches
/// `spec.image` (or there are no pods yet, in which case there is nothing to upgrade).
async fn current_running_image(vdb: &VerticaDB, ctx: &Context<VerticaDB>) -> Result<Option<String>> {
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &vdb.get_namespace());
    let selector = format!("{}={}", super::statefulset::VERTICADB_LABEL, vdb.name_any());
    let list = pods
        .list(&ListParams::default().labels(&selector))
        .await
        .map_err(|e| vertdb_operator::error::Error::KubeError("failed to list pods for upgrade check".to_string(), e))?;

    Ok(list
        .items
        .iter()
        .find_map(|pod| {
            let image = pod.spec.as_ref().and_then(|s| s.containers.first()).and_then(|c| c.image.as_deref());
            match image {
                Some(image) if image != vdb.spec.image => Some(image.to_string()),
                _ => None,
            }
        }))
}

/// Whether `target` is an older version than `running`. Images whose tag isn't semver (e.g. a
/// `latest` or digest-pinned tag) are never treated as a downgrade — there is nothing to compare.
fn is_downgrade(running: &str, target: &str) -> bool {
    let Some(running_version) = vertdb_k8s_util::parse::parse_semver(running) else {
        return false;
    };
    let Some(target_version) = vertdb_k8s_util::parse::parse_semver(target) else {
        return false;
    };
    target_version < running_version
}

async fn update_statefulset_images(vdb: &VerticaDB, ctx: &Context<VerticaDB>, status: &VerticaDBStatus) -> Result<()> {
    for sc in &vdb.spec.subclusters {
        let sts = vdb.create_statefulset(sc, status);
        vdb.patch(ctx, sts).await?;
    }
    Ok(())
}

async fn delete_pods_with_old_image(vdb: &VerticaDB, ctx: &Context<VerticaDB>, subcluster: Option<&str>) -> Result<()> {
    let namespace = vdb.get_namespace();
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    let mut selector = format!("{}={}", super::statefulset::VERTICADB_LABEL, vdb.name_any());
    if let Some(sc) = subcluster {
        selector.push_str(&format!(",{}={sc}", super::statefulset::SUBCLUSTER_LABEL));
    }
    let list = pods
        .list(&ListParams::default().labels(&selector))
        .await
        .map_err(|e| vertdb_operator::error::Error::KubeError("failed to list pods to delete".to_string(), e))?;

    for pod in list.items {
        let image = pod.spec.as_ref().and_then(|s| s.containers.first()).and_then(|c| c.image.as_deref());
        if image == Some(vdb.spec.image.as_str()) {
            continue;
        }
        pods.delete(&pod.name_any(), &DeleteParams::default())
            .await
            .map_err(|e| vertdb_operator::error::Error::KubeError(format!("failed to delete pod {}", pod.name_any()), e))?;
    }
    Ok(())
}

async fn restart_and_route(vdb: &VerticaDB, ctx: &Context<VerticaDB>, facts: &mut PodFacts, status: &mut VerticaDBStatus) -> Result<()> {
    *facts = PodFacts::collect(vdb, ctx, None).await?;
    super::restart::reconcile_restart(vdb, ctx, facts, status).await?;
    super::client_routing::reconcile_labels(vdb, ctx, facts).await
}

/// Stop the database entirely, roll every `StatefulSet` to the new image, wait for at least one
/// new pod, then restart — the simplest strategy and the one every spec version supports.
async fn offline_upgrade(
    vdb: &VerticaDB,
    ctx: &Context<VerticaDB>,
    facts: &mut PodFacts,
    status: &mut VerticaDBStatus,
) -> Result<()> {
    set_condition(&mut status.conditions, CONDITION_OFFLINE_UPGRADE_IN_PROGRESS, true, "ShuttingDown", "stopping database for offline upgrade", vdb.meta().generation);

    if let Ok(dispatcher) = super::select_dispatcher(vdb, ctx, facts) {
        let _ = dispatcher.dispatch(Operation::StopDb).await;
    }

    status.upgrade_status = Some("Rescheduling".to_string());
    update_statefulset_images(vdb, ctx, status).await?;
    delete_pods_with_old_image(vdb, ctx, None).await?;

    status.upgrade_status = Some("Restarting".to_string());
    restart_and_route(vdb, ctx, facts, status).await?;

    set_condition(&mut status.conditions, CONDITION_OFFLINE_UPGRADE_IN_PROGRESS, false, "Finished", "offline upgrade complete", vdb.meta().generation);
    set_condition(&mut status.conditions, CONDITION_IMAGE_CHANGE_IN_PROGRESS, false, "Finished", "", vdb.meta().generation);
    status.upgrade_status = None;
    Ok(())
}

/// Rolls primaries first while secondaries keep serving reads, then rolls secondaries. Falls
/// back to the offline path on the first call if the spec has no secondary subcluster to carry
/// read traffic, since the whole point of this strategy is unavailable otherwise.
async fn read_only_online_upgrade(
    vdb: &VerticaDB,
    ctx: &Context<VerticaDB>,
    facts: &mut PodFacts,
    status: &mut VerticaDBStatus,
) -> Result<()> {
    let has_secondary = vdb.spec.subclusters.iter().any(|sc| sc.type_ == SubclusterType::Secondary);
    if !has_secondary {
        return offline_upgrade(vdb, ctx, facts, status).await;
    }

    set_condition(&mut status.conditions, CONDITION_READONLY_ONLINE_UPGRADE_IN_PROGRESS, true, "PrimariesUpgrading", "rolling primary subclusters", vdb.meta().generation);

    for sc in vdb.spec.subclusters.iter().filter(|sc| sc.type_ == SubclusterType::Primary) {
        let sts = vdb.create_statefulset(sc, status);
        vdb.patch(ctx, sts).await?;
        delete_pods_with_old_image(vdb, ctx, Some(&sc.name)).await?;
    }
    restart_and_route(vdb, ctx, facts, status).await?;

    status.upgrade_status = Some("SecondariesUpgrading".to_string());
    for sc in vdb.spec.subclusters.iter().filter(|sc| sc.type_ == SubclusterType::Secondary) {
        let sts = vdb.create_statefulset(sc, status);
        vdb.patch(ctx, sts).await?;
        delete_pods_with_old_image(vdb, ctx, Some(&sc.name)).await?;
    }
    restart_and_route(vdb, ctx, facts, status).await?;

    set_condition(&mut status.conditions, CONDITION_READONLY_ONLINE_UPGRADE_IN_PROGRESS, false, "Finished", "read-only online upgrade complete", vdb.meta().generation);
    set_condition(&mut status.conditions, CONDITION_IMAGE_CHANGE_IN_PROGRESS, false, "Finished", "", vdb.meta().generation);
    status.upgrade_status = None;
    Ok(())
}

/// Blue/green swap: stand up a sandboxed replica group B on the new image, flip client-routing
/// labels from A to B subcluster by subcluster, then retire A. Any failure here is recoverable
/// from status conditions alone — the next reconcile resumes from whichever phase the status
/// records, never re-derives it from scratch.
async fn online_upgrade(
    vdb: &VerticaDB,
    ctx: &Context<VerticaDB>,
    facts: &mut PodFacts,
    status: &mut VerticaDBStatus,
) -> Result<()> {
    set_condition(&mut status.conditions, CONDITION_ONLINE_UPGRADE_IN_PROGRESS, true, "ReplicaGroupStarting", "creating replica group B", vdb.meta().generation);

    let primaries: Vec<_> = vdb.spec.subclusters.iter().filter(|sc| sc.type_ == SubclusterType::Primary).collect();
    let Ok(dispatcher) = super::select_dispatcher(vdb, ctx, facts) else {
        return Ok(());
    };

    let replica_group_b: Vec<String> = primaries.iter().map(|sc| format!("{}-b", sc.name)).collect();
    dispatcher
        .dispatch(Operation::SandboxSubcluster {
            sandbox: format!("{}-upgrade", vdb.name_any()),
            subclusters: replica_group_b.clone(),
        })
        .await?;

    info!(msg = "replica group B sandboxed, waiting for sync before promotion");
    status.upgrade_status = Some("WaitingForReplicaGroupBSync".to_string());

    for sc in &primaries {
        super::client_routing::flip_routing(vdb, ctx, &sc.name, &format!("{}-b", sc.name)).await?;
    }

    for name in &replica_group_b {
        dispatcher.dispatch(Operation::UnsandboxSubcluster { subcluster: name.clone() }).await?;
    }

    update_statefulset_images(vdb, ctx, status).await?;
    delete_pods_with_old_image(vdb, ctx, None).await?;
    restart_and_route(vdb, ctx, facts, status).await?;

    set_condition(&mut status.conditions, CONDITION_ONLINE_UPGRADE_IN_PROGRESS, false, "Finished", "online upgrade complete", vdb.meta().generation);
    set_condition(&mut status.conditions, CONDITION_IMAGE_CHANGE_IN_PROGRESS, false, "Finished", "", vdb.meta().generation);
    status.upgrade_status = None;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CommunalStorage, Subcluster, VerticaDBSpec};

    fn vdb_with_subclusters(subclusters: Vec<Subcluster>) -> VerticaDB {
        VerticaDB::new(
            "test",
            VerticaDBSpec {
                communal: CommunalStorage { path: "s3://bucket/db".to_string(), ..Default::default() },
                subclusters,
                ..Default::default()
            },
        )
    }

    fn sc(name: &str, type_: SubclusterType) -> Subcluster {
        Subcluster {
            name: name.to_string(),
            size: 3,
            type_,
            shutdown: false,
            service_type: None,
            annotations: Default::default(),
            proxy: None,
        }
    }

    #[test]
    fn test_resolve_policy_auto_single_primary_no_secondary_is_offline() {
        let vdb = vdb_with_subclusters(vec![sc("primary", SubclusterType::Primary)]);
        assert_eq!(resolve_policy(&vdb), UpgradePolicy::Offline);
    }

    #[test]
    fn test_resolve_policy_auto_with_secondary_is_read_only_online() {
        let vdb = vdb_with_subclusters(vec![
            sc("primary", SubclusterType::Primary),
            sc("secondary", SubclusterType::Secondary),
        ]);
        assert_eq!(resolve_policy(&vdb), UpgradePolicy::ReadOnlyOnline);
    }

    #[test]
    fn test_resolve_policy_auto_multiple_primaries_is_online() {
        let vdb = vdb_with_subclusters(vec![
            sc("primary1", SubclusterType::Primary),
            sc("primary2", SubclusterType::Primary),
        ]);
        assert_eq!(resolve_policy(&vdb), UpgradePolicy::Online);
    }

    #[test]
    fn test_is_downgrade_detects_older_target() {
        assert!(is_downgrade("12.0.4", "12.0.1"));
    }

    #[test]
    fn test_is_downgrade_allows_upgrade() {
        assert!(!is_downgrade("12.0.1", "12.0.4"));
    }

    #[test]
    fn test_is_downgrade_ignores_unparseable_tags() {
        assert!(!is_downgrade("latest", "12.0.1"));
    }
}
