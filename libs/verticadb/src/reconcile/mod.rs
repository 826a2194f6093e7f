pub mod auth_parms;
pub mod client_routing;
pub mod initializer;
pub mod membership;
pub mod podfacts;
pub mod restart;
pub mod sandbox;
pub mod service;
pub mod statefulset;
pub mod status;
pub mod statuscheck;
pub mod tls;
pub mod upgrade;

use self::podfacts::PodFacts;
use self::service::ServiceExt;
use self::statefulset::StatefulSetExt;
use self::status::StatusExt;

use crate::crd::{VerticaDB, VerticaDBStatus};

use vertdb_operator::controller::{Context, KubeOperations};
use vertdb_operator::error::{Error, Result};
use vertdb_operator::telemetry;

use std::sync::Arc;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use kube::api::{Api, ListParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{Event as Finalizer, finalizer};
use tokio::time::Duration;
use tracing::{Span, debug, field, info, instrument};

use self::statefulset::VERTICADB_LABEL;
use crate::dispatcher::{AnyDispatcher, VCLUSTEROPS_ANNOTATION, select_backend};

pub const VERTICADB_FINALIZER: &str = "verticadbs.vertica.com/finalizer";

const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[instrument(skip(ctx, vdb))]
pub async fn reconcile_verticadb(
    vdb: Arc<VerticaDB>,
    ctx: Arc<Context<VerticaDB>>,
) -> Result<Action> {
    let trace_id = telemetry::get_trace_id().unwrap_or_default();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.reconcile_count_and_measure(&trace_id);
    info!(msg = "reconciling VerticaDB");

    let status = vdb.update_status(&ctx).await.map_err(|e| {
        debug!(msg = "failed to refresh status", %e);
        ctx.metrics.status_update_errors_inc();
        e
    })?;

    let vdb_api: Api<VerticaDB> = Api::namespaced(ctx.client.clone(), &vdb.get_namespace());
    finalizer(&vdb_api, VERTICADB_FINALIZER, vdb, |event| async {
        match event {
            Finalizer::Apply(vdb) => reconcile(vdb, ctx, status).await,
            Finalizer::Cleanup(vdb) => cleanup(vdb, ctx).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError("failed on VerticaDB finalizer".to_string(), Box::new(e)))
}

/// Runs the fixed actor chain described for the VerticaDB reconcile loop. Every step is
/// idempotent; any step returning an error aborts the remaining chain so the next reconcile
/// resumes from the same point.
async fn reconcile(
    vdb: Arc<VerticaDB>,
    ctx: Arc<Context<VerticaDB>>,
    mut status: VerticaDBStatus,
) -> Result<Action> {
    // 1. Pre-checks: annotation sync, TLS cert bootstrap.
    tls::ensure_tls_secrets(&vdb, &ctx).await?;

    // 3. Object sync (scaling-preserving): statefulsets + services with OnDelete update strategy.
    for sc in &vdb.spec.subclusters {
        let sts = vdb.create_statefulset(sc, &status);
        vdb.patch(&ctx, sts).await?;
        vdb.patch(&ctx, vdb.create_service(sc)).await?;
    }
    vdb.delete_orphaned_objects(&ctx).await?;

    // 2/status refresh happens implicitly via the collectors below; collect pod facts once
    // up front so every downstream actor shares a consistent snapshot.
    let mut facts = podfacts::PodFacts::collect(&vdb, &ctx, None).await?;

    // TLS rotation: best-effort, never aborts the reconcile on its own — a rotation failure sets
    // TLSCertRollbackNeeded on status and is picked up by the next reconcile.
    if let Ok(dispatcher) = select_dispatcher(&vdb, &ctx, &facts) {
        let _ = tls::reconcile_rotation(&vdb, &ctx, &dispatcher, &mut status).await;
    }

    // 4. Upgrade: exactly one strategy runs per reconcile, chosen by policy + version.
    if let Some(action) = upgrade::maybe_run(&vdb, &ctx, &status, &mut facts).await? {
        return Ok(action);
    }

    // 5. Shutdown: force a cluster restart if a restart-needed condition is pending, then stop
    // any subcluster marked shutdown=true.
    client_routing::reconcile_shutdown(&vdb, &ctx, &facts).await?;

    // 6. Restart / re-IP.
    restart::reconcile_restart(&vdb, &ctx, &mut facts, &mut status).await?;

    // 8/9. Membership: remove before add, full object sync already done above.
    membership::reconcile_remove(&vdb, &ctx, &mut facts).await?;

    // 11. Create or revive the database (mutually exclusive, no-op once initialized).
    if !status::is_db_initialized(&status) {
        initializer::reconcile_initializer(&vdb, &ctx, &mut facts, &mut status).await?;
    }

    // 12. Add subclusters/nodes, rebalance, client-routing labels.
    membership::reconcile_add(&vdb, &ctx, &mut facts).await?;
    client_routing::reconcile_labels(&vdb, &ctx, &facts).await?;

    // 13. Sandbox add/remove is driven by the sandbox-scope controller; here we only write the
    // trigger UUID onto the sandbox ConfigMap when the spec changes.
    sandbox::sync_sandbox_configmaps(&vdb, &ctx).await?;

    // 14. Restore points, on demand.
    if let Some(restore_point) = &vdb.spec.restore_point {
        initializer::save_restore_point(&vdb, &ctx, restore_point).await?;
    }

    // 16. Trailing safety net + status persist.
    status.subclusters = statuscheck::collect_subcluster_status(&vdb, &facts);
    vdb.patch_status(&ctx, status).await?;

    Ok(Action::requeue(DEFAULT_RECONCILE_INTERVAL))
}

async fn cleanup(vdb: Arc<VerticaDB>, ctx: Arc<Context<VerticaDB>>) -> Result<Action> {
    debug!(msg = "cleanup");
    ctx.internal_cache.write().await.retain(|k, _| k.name != vdb.name_any());
    Ok(Action::requeue(DEFAULT_RECONCILE_INTERVAL))
}

/// Picks a backend for the current reconcile: any running, reachable pod is good enough as the
/// admintools exec target or, when a vclusterops sidecar is available, as its IP. Every actor
/// that issues Dispatcher operations goes through this instead of constructing a backend itself,
/// so the annotation/version gate in `select_backend` is honored consistently everywhere.
pub(crate) fn select_dispatcher(
    vdb: &VerticaDB,
    ctx: &Context<VerticaDB>,
    facts: &PodFacts,
) -> Result<AnyDispatcher> {
    let exec_pod = facts
        .by_pod
        .values()
        .find(|f| f.is_running && !f.is_pending_delete)
        .ok_or_else(|| Error::InvalidSpec("no running pod available to dispatch operations".to_string()))?;

    let wants_vclusterops = vdb
        .annotations()
        .get(VCLUSTEROPS_ANNOTATION)
        .map(String::as_str)
        == Some("true");
    let vclusterops_url = exec_pod.ip.map(|ip| format!("https://{ip}:8443"));

    select_backend(
        ctx.client.clone(),
        &vdb.get_namespace(),
        &exec_pod.pod_name,
        &vdb.spec.image,
        wants_vclusterops,
        vclusterops_url.as_deref(),
    )
}

impl VerticaDB {
    #[inline]
    pub(crate) fn get_namespace(&self) -> String {
        // safe unwrap: VerticaDB is namespace-scoped
        self.namespace().unwrap()
    }

    /// Deletes StatefulSets/Services left over from subclusters that were removed from the spec.
    async fn delete_orphaned_objects(&self, ctx: &Context<VerticaDB>) -> Result<()> {
        let namespace = self.get_namespace();
        let expected: Vec<String> = self
            .spec
            .subclusters
            .iter()
            .map(|sc| self.statefulset_name(&sc.name))
            .collect();
        let selector = format!("{VERTICADB_LABEL}={}", self.name_any());

        let sts_api: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), &namespace);
        let orphan_sts = sts_api
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| Error::KubeError("failed to list StatefulSets".to_string(), e))?
            .items
            .into_iter()
            .filter(|sts| !expected.contains(&sts.name_any()));
        for sts in orphan_sts {
            self.delete(ctx, &sts).await?;
        }

        let svc_api: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);
        let orphan_svc = svc_api
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| Error::KubeError("failed to list Services".to_string(), e))?
            .items
            .into_iter()
            .filter(|svc| !expected.contains(&svc.name_any()));
        for svc in orphan_svc {
            self.delete(ctx, &svc).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod mock_apiserver_tests {
    use super::*;
    use crate::crd::{Subcluster, SubclusterType, VerticaDBSpec};
    use crate::reconcile::client_routing::CLIENT_ROUTING_LABEL;
    use crate::reconcile::podfacts::PodFact;

    use std::collections::BTreeMap;

    use http::{Request, Response};
    use k8s_openapi::api::core::v1::Pod;
    use kube::client::Body;
    use kube::{Client, Resource};
    use vertdb_operator::controller::State;

    impl VerticaDB {
        fn test(name: &str) -> Self {
            let mut vdb = VerticaDB::new(
                name,
                VerticaDBSpec {
                    image: "12.0.1".to_string(),
                    subclusters: vec![Subcluster {
                        name: "primary".to_string(),
                        size: 1,
                        type_: SubclusterType::Primary,
                        shutdown: false,
                        service_type: None,
                        annotations: BTreeMap::new(),
                        proxy: None,
                    }],
                    ..Default::default()
                },
            );
            vdb.meta_mut().namespace = Some("default".to_string());
            vdb
        }
    }

    fn pod_fact(pod_name: &str, subcluster: &str, shard_subscriptions: u32) -> PodFact {
        PodFact {
            pod_name: pod_name.to_string(),
            subcluster: subcluster.to_string(),
            is_running: true,
            shard_subscriptions,
            ..Default::default()
        }
    }

    type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

    /// Replays the fixed sequence of apiserver calls one reconcile actor is expected to make,
    /// failing the test if a call is missing, out of order, or never answered.
    struct ApiServerVerifier(ApiServerHandle);

    async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("timeout on mock apiserver")
            .expect("scenario task did not panic");
    }

    fn get_test_context() -> (Arc<Context<VerticaDB>>, ApiServerVerifier) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let mock_client = Client::new(mock_service, "default");
        let meter = opentelemetry::global::meter("test");
        let controller_id = "test";
        let state = State::new(&meter, &[controller_id]);
        (state.to_context(mock_client, controller_id), ApiServerVerifier(handle))
    }

    impl ApiServerVerifier {
        /// Answers one pod label PATCH, asserting the routing label is set (or cleared) as
        /// expected, then hands back a minimal `Pod` so the caller's `?` succeeds.
        async fn handle_pod_label_patch(mut self, pod_name: &str, expect_enabled: bool) -> Self {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::PATCH);
            assert!(
                request
                    .uri()
                    .to_string()
                    .starts_with(&format!("/api/v1/namespaces/default/pods/{pod_name}?")),
                "unexpected uri: {}",
                request.uri()
            );

            let req_body = request.into_body().collect_bytes().await.unwrap();
            let json: serde_json::Value = serde_json::from_slice(&req_body).expect("patch body is json");
            let label = json
                .pointer(&format!("/metadata/labels/{}", CLIENT_ROUTING_LABEL.replace('/', "~1")))
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            if expect_enabled {
                assert_eq!(label, serde_json::Value::String("true".to_string()));
            } else {
                assert!(label.is_null());
            }

            let mut pod = Pod::default();
            pod.meta_mut().name = Some(pod_name.to_string());
            send.send_response(Response::builder().body(Body::from(serde_json::to_vec(&pod).unwrap())).unwrap());
            self
        }

        /// Answers the single status PATCH that closes out a reconcile actor writing `status`.
        async fn handle_status_patch(mut self, vdb: &VerticaDB) -> Self {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::PATCH);
            assert!(
                request.uri().to_string().starts_with(&format!(
                    "/apis/vertica.com/v1/namespaces/default/verticadbs/{}/status?",
                    vdb.name_any()
                )),
                "unexpected uri: {}",
                request.uri()
            );

            let req_body = request.into_body().collect_bytes().await.unwrap();
            let json: serde_json::Value = serde_json::from_slice(&req_body).expect("patch body is json");
            let mut echoed = vdb.clone();
            echoed.status = serde_json::from_value(json.get("status").unwrap().clone()).expect("valid status");
            send.send_response(Response::builder().body(Body::from(serde_json::to_vec(&echoed).unwrap())).unwrap());
            self
        }
    }

    #[tokio::test]
    async fn reconcile_labels_sets_and_clears_routing_label() {
        let (ctx, fakeserver) = get_test_context();
        let vdb = VerticaDB::test("routing");

        let mut facts = PodFacts::default();
        facts.by_pod.insert("routing-primary-0".to_string(), pod_fact("routing-primary-0", "primary", 1));
        facts.by_pod.insert("routing-primary-1".to_string(), {
            let mut fact = pod_fact("routing-primary-1", "primary", 0);
            fact.is_pending_delete = true;
            fact
        });

        let mocksrv = tokio::spawn(async move {
            fakeserver
                .handle_pod_label_patch("routing-primary-0", true)
                .await
                .handle_pod_label_patch("routing-primary-1", false)
                .await;
        });

        client_routing::reconcile_labels(&vdb, &ctx, &facts).await.expect("reconcile_labels");
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn patch_status_applies_server_side() {
        let (ctx, fakeserver) = get_test_context();
        let vdb = VerticaDB::test("status-roundtrip");

        let mocksrv = tokio::spawn(async move {
            fakeserver.handle_status_patch(&VerticaDB::test("status-roundtrip")).await;
        });

        let mut status = VerticaDBStatus::default();
        status::set_condition(&mut status.conditions, crate::crd::CONDITION_DB_INITIALIZED, true, "Created", "db created", None);
        vdb.patch_status(&ctx, status).await.expect("patch_status");
        timeout_after_1s(mocksrv).await;
    }
}
