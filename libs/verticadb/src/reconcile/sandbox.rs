use crate::crd::VerticaDB;
use crate::dispatcher::{Dispatch, Operation, select_backend};

use vertdb_operator::controller::{Context, KubeOperations};
use vertdb_operator::error::{Error, Result};

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::ResourceExt;
use kube::api::{Api, ListParams, ObjectMeta};
use kube::runtime::controller::Action;
use tokio::time::Duration;
use tracing::info;
use uuid::Uuid;

const DATA_VDB_NAME: &str = "vdbName";
const DATA_SANDBOX_NAME: &str = "sandboxName";

const TRIGGER_SANDBOX_UPGRADE: &str = "vertica.com/sandbox-trigger-sandboxupgrade";
const TRIGGER_UNSANDBOX: &str = "vertica.com/sandbox-trigger-unsandbox";
const TRIGGER_SHUTDOWN: &str = "vertica.com/sandbox-trigger-shutdown";
const ANNOTATION_APPLIED_GENERATION: &str = "vertica.com/sandbox-applied-generation";

const SANDBOX_RECONCILE_INTERVAL: Duration = Duration::from_secs(5 * 60);

fn configmap_name(vdb: &VerticaDB, sandbox_name: &str) -> String {
    format!("{}-{sandbox_name}-sandbox", vdb.name_any())
}

/// Called from the main VerticaDB reconciler: ensures every spec sandbox has a backing
/// ConfigMap and, when the sandbox's subcluster list changed since the last sync, writes a fresh
/// trigger UUID to wake the sandbox-scope controller. The main reconciler never talks to the
/// Dispatcher on behalf of a sandbox; it only leaves this breadcrumb.
pub async fn sync_sandbox_configmaps(vdb: &VerticaDB, ctx: &Context<VerticaDB>) -> Result<()> {
    let namespace = vdb.get_namespace();
    let api: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &namespace);

    for sandbox in &vdb.spec.sandboxes {
        let name = configmap_name(vdb, &sandbox.name);
        let existing = api
            .get_opt(&name)
            .await
            .map_err(|e| Error::KubeError(format!("failed to fetch sandbox configmap {name}"), e))?;

        let subclusters_csv = sandbox.subclusters.join(",");
        let needs_trigger = existing
            .as_ref()
            .and_then(|cm| cm.data.as_ref())
            .and_then(|d| d.get("subclusters"))
            .map(|observed| observed != &subclusters_csv)
            .unwrap_or(true);

        let mut annotations = existing
            .as_ref()
            .and_then(|cm| cm.metadata.annotations.clone())
            .unwrap_or_default();
        if needs_trigger {
            annotations.insert(TRIGGER_SANDBOX_UPGRADE.to_string(), Uuid::new_v4().to_string());
        }

        let mut data = BTreeMap::new();
        data.insert(DATA_VDB_NAME.to_string(), vdb.name_any());
        data.insert(DATA_SANDBOX_NAME.to_string(), sandbox.name.clone());
        data.insert("subclusters".to_string(), subclusters_csv);

        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: Some(namespace.clone()),
                labels: Some(BTreeMap::from([(
                    crate::controller::sandbox::SANDBOX_LABEL.to_string(),
                    sandbox.name.clone(),
                )])),
                annotations: Some(annotations),
                owner_references: Some(vec![vdb.controller_owner_ref(&()).unwrap()]),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };
        vdb.patch(ctx, cm).await?;
    }

    Ok(())
}

/// The sandbox-scope reconciler: reacts to trigger-annotation changes on a sandbox ConfigMap by
/// calling the Dispatcher's sandbox operations against the owning VerticaDB's cluster.
pub async fn reconcile_sandbox_configmap(
    cm: std::sync::Arc<ConfigMap>,
    ctx: std::sync::Arc<Context<ConfigMap>>,
) -> Result<Action> {
    let Some(data) = &cm.data else {
        return Ok(Action::requeue(SANDBOX_RECONCILE_INTERVAL));
    };
    let (Some(vdb_name), Some(sandbox_name)) = (data.get(DATA_VDB_NAME), data.get(DATA_SANDBOX_NAME)) else {
        return Err(Error::InvalidSpec("sandbox configmap missing vdbName/sandboxName".to_string()));
    };

    let namespace = cm.namespace().unwrap_or_default();
    let vdb_api: Api<VerticaDB> = Api::namespaced(ctx.client.clone(), &namespace);
    let vdb = vdb_api
        .get(vdb_name)
        .await
        .map_err(|e| Error::KubeError(format!("failed to fetch owning VerticaDB {vdb_name}"), e))?;

    let sandbox = vdb.spec.sandboxes.iter().find(|sb| &sb.name == sandbox_name);
    let Some(sandbox) = sandbox else {
        return Err(Error::InvalidSpec(format!(
            "sandbox {sandbox_name} no longer present in VerticaDB {vdb_name} spec"
        )));
    };

    let annotations = cm.annotations();
    let applied = annotations.get(ANNOTATION_APPLIED_GENERATION);

    if let Some(unsandbox_trigger) = annotations.get(TRIGGER_UNSANDBOX) {
        if applied != Some(unsandbox_trigger) {
            let dispatcher = pick_dispatcher(&ctx.client, &namespace, &vdb).await?;
            for name in &sandbox.subclusters {
                dispatcher.dispatch(Operation::UnsandboxSubcluster { subcluster: name.clone() }).await?;
            }
            ack(&ctx, &cm, unsandbox_trigger).await?;
        }
    } else if let Some(shutdown_trigger) = annotations.get(TRIGGER_SHUTDOWN) {
        if applied != Some(shutdown_trigger) {
            let dispatcher = pick_dispatcher(&ctx.client, &namespace, &vdb).await?;
            for name in &sandbox.subclusters {
                dispatcher
                    .dispatch(Operation::StopSubcluster {
                        name: name.clone(),
                        drain_seconds: 0,
                    })
                    .await?;
            }
            ack(&ctx, &cm, shutdown_trigger).await?;
        }
    } else if let Some(upgrade_trigger) = annotations.get(TRIGGER_SANDBOX_UPGRADE) {
        if applied != Some(upgrade_trigger) {
            let dispatcher = pick_dispatcher(&ctx.client, &namespace, &vdb).await?;
            dispatcher
                .dispatch(Operation::SandboxSubcluster {
                    sandbox: sandbox_name.clone(),
                    subclusters: sandbox.subclusters.clone(),
                })
                .await?;
            ack(&ctx, &cm, upgrade_trigger).await?;
        }
    }

    Ok(Action::requeue(SANDBOX_RECONCILE_INTERVAL))
}

async fn ack(ctx: &Context<ConfigMap>, cm: &ConfigMap, trigger_value: &str) -> Result<()> {
    let api: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &cm.namespace().unwrap_or_default());
    let patch = ConfigMap {
        metadata: ObjectMeta {
            annotations: Some(BTreeMap::from([(
                ANNOTATION_APPLIED_GENERATION.to_string(),
                trigger_value.to_string(),
            )])),
            ..Default::default()
        },
        ..Default::default()
    };
    let params = kube::api::PatchParams::apply(ctx.controller_id).force();
    api.patch(&cm.name_any(), &params, &kube::api::Patch::Apply(patch))
        .await
        .map_err(|e| Error::KubeError("failed to ack sandbox trigger".to_string(), e))?;
    Ok(())
}

async fn pick_dispatcher(
    client: &kube::Client,
    namespace: &str,
    vdb: &VerticaDB,
) -> Result<crate::dispatcher::AnyDispatcher> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let selector = format!("{}={}", super::statefulset::VERTICADB_LABEL, vdb.name_any());
    let list = pods
        .list(&ListParams::default().labels(&selector))
        .await
        .map_err(|e| Error::KubeError("failed to list pods for sandbox dispatch".to_string(), e))?;
    let exec_pod = list
        .items
        .iter()
        .find(|p| p.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running"))
        .ok_or_else(|| Error::InvalidSpec("no running pod to dispatch sandbox operation against".to_string()))?;

    info!(msg = "dispatching sandbox operation", exec_pod = exec_pod.name_any());

    select_backend(client.clone(), namespace, &exec_pod.name_any(), &vdb.spec.image, false, None)
}
