use crate::reconcile::sandbox::reconcile_sandbox_configmap;

use vertdb_operator::backoff_reconciler;
use vertdb_operator::controller::{ControllerId, State, check_api_queryable, error_policy};

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::client::Client;
use kube::runtime::controller::{self, Controller};
use kube::runtime::watcher;
use tokio::time::Duration;
use tracing::info;

pub const CONTROLLER_ID: ControllerId = "sandbox";

/// Label carried by every sandbox-scope ConfigMap; the watcher filters on it so the sandbox
/// controller never wakes up for unrelated config maps in the namespace.
pub const SANDBOX_LABEL: &str = "vertica.com/sandbox";

/// Initialize the sandbox-scope controller, a second `Controller<ConfigMap>` decoupled from the
/// main VerticaDB reconcile loop per the sandbox subsystem design.
pub async fn run(state: State, client: Client) {
    let configmaps = check_api_queryable::<ConfigMap>(client.clone()).await;

    let ctx = state.to_context(client, CONTROLLER_ID);

    info!(msg = format!("starting {CONTROLLER_ID} controller"));
    let watcher_config = watcher::Config::default()
        .labels(SANDBOX_LABEL)
        .any_semantic();
    let sandbox_controller = Controller::new(configmaps, watcher_config)
        .with_config(controller::Config::default().debounce(Duration::from_millis(500)))
        .shutdown_on_signal()
        .run(
            backoff_reconciler!(reconcile_sandbox_configmap),
            error_policy,
            ctx.clone(),
        )
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    ctx.metrics.ready_set(1);
    tokio::join!(sandbox_controller);
}
