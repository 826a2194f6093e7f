use crate::error::{Error, Result};
use crate::metrics::{ControllerMetrics, Metrics};

use vertdb_k8s_util::events::Recorder;
use vertdb_k8s_util::types::short_type_name;

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use k8s_openapi::NamespaceResourceScope;
use kube::ResourceExt;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::client::Client;
use kube::runtime::controller::Action;
use kube::runtime::reflector::{Lookup, ObjectRef};
use opentelemetry::metrics::Meter;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use kube::Resource;
use tokio::sync::RwLock;
use tokio::time::Duration;
use tracing::{error, info, trace};

pub type ControllerId = &'static str;
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// State shared between the controllers and the web server
#[derive(Clone)]
pub struct State {
    metrics: Arc<Metrics>,
}

impl State {
    pub fn new(meter: &Meter, controller_names: &[&'static str]) -> Self {
        Self {
            metrics: Arc::new(Metrics::new(meter, controller_names)),
        }
    }

    /// Create a Controller Context that can update State
    pub fn to_context<K>(&self, client: Client, controller_id: ControllerId) -> Arc<Context<K>>
    where
        K: Resource + Lookup + Clone + 'static,
        <K as Lookup>::DynamicType: Default + Eq + std::hash::Hash + Clone,
    {
        Arc::new(Context {
            controller_id,
            recorder: Recorder::new(client.clone(), controller_id.into()),
            client,
            metrics: self
                .metrics
                .controllers
                .get(controller_id)
                .expect("all CONTROLLER_IDs have to be registered")
                .clone(),
            internal_cache: Arc::default(),
            error_backoff_policy: Arc::default(),
        })
    }
}

/// Context for our reconciler
#[derive(Clone)]
pub struct Context<K: Resource> {
    /// Controller ID
    pub controller_id: ControllerId,
    /// Kubernetes client
    pub client: Client,
    /// Metrics for this controller
    pub metrics: Arc<ControllerMetrics>,
    /// Internal controller cache, e.g. to remember cheap facts across reconciles without
    /// round-tripping to the apiserver (last-seen pod-fact snapshot, sandbox generation, ...)
    pub internal_cache: Arc<RwLock<HashMap<ObjectRef<K>, jiff::Timestamp>>>,
    /// State of the error backoff policy per object
    error_backoff_policy: Arc<RwLock<HashMap<ObjectRef<K>, RwLock<ExponentialBackoff>>>>,
    /// Event recorder
    pub recorder: Recorder,
}

impl<K> Context<K>
where
    K: Resource<DynamicType = ()> + ResourceExt + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Eq + std::hash::Hash + Clone,
{
    /// Return next duration of the backoff policy for the given object
    pub async fn get_backoff(&self, obj_ref: ObjectRef<K>) -> Duration {
        {
            let read_guard = self.error_backoff_policy.read().await;
            if let Some(backoff) = read_guard.get(&obj_ref) {
                if let Some(duration) = backoff.write().await.next() {
                    return duration;
                }
            }
        }

        // Backoff policy: 1s, 2s, 4s, 8s, 16s, 32s, 64s, 128s, 256s, 300s, 300s...
        let mut backoff = ExponentialBuilder::default()
            .with_max_delay(DEFAULT_RECONCILE_INTERVAL)
            .without_max_times()
            .build();
        // safe unwrap: first backoff is always Some(Duration)
        let duration = backoff.next().unwrap();
        self.error_backoff_policy
            .write()
            .await
            .insert(obj_ref.clone(), RwLock::new(backoff));
        trace!(
            msg = "recreate backoff policy",
            namespace = obj_ref.namespace.as_deref().unwrap(),
            name = obj_ref.name,
        );
        duration
    }

    /// Reset the backoff policy for the given object
    pub async fn reset_backoff(&self, obj_ref: ObjectRef<K>) {
        let read_guard = self.error_backoff_policy.read().await;
        if read_guard.get(&obj_ref).is_some() {
            drop(read_guard);
            trace!(
                msg = "reset backoff policy",
                namespace = obj_ref.namespace.as_deref().unwrap(),
                name = obj_ref.name
            );
            let mut write_guard = self.error_backoff_policy.write().await;
            write_guard.remove(&obj_ref);
        }
    }
}

/// Generic patch/delete helpers shared by every owning resource (`VerticaDB` owning
/// `StatefulSet`/`Service`/`ConfigMap`, ...). Patches use server-side apply with `force()` so the
/// operator always wins field ownership conflicts against stale clients; a 422 (immutable field
/// changed) falls back to delete-then-recreate.
#[allow(async_fn_in_trait)]
pub trait KubeOperations<T, K>
where
    T: Resource + ResourceExt + Lookup + Clone + 'static,
    <T as Lookup>::DynamicType: Eq + std::hash::Hash + Clone,
    K: Resource<Scope = NamespaceResourceScope>
        + Serialize
        + Clone
        + std::fmt::Debug
        + for<'de> Deserialize<'de>,
    <K as kube::Resource>::DynamicType: Default,
    <K as Resource>::Scope: std::marker::Sized,
{
    async fn delete(&self, ctx: &Context<T>, obj: &K) -> Result<()>;
    async fn patch(&self, ctx: &Context<T>, obj: K) -> Result<K>;
}

impl<T, K> KubeOperations<T, K> for T
where
    T: Resource + ResourceExt + Lookup + Clone + 'static,
    <T as Lookup>::DynamicType: Eq + std::hash::Hash + Clone,
    K: Resource<Scope = NamespaceResourceScope>
        + Serialize
        + Clone
        + std::fmt::Debug
        + for<'de> Deserialize<'de>,
    <K as kube::Resource>::DynamicType: Default,
    <K as Resource>::Scope: std::marker::Sized,
{
    async fn delete(&self, ctx: &Context<T>, obj: &K) -> Result<()> {
        let name = obj.name_any();
        // safe unwrap: self is namespace scoped
        let namespace = kube::ResourceExt::namespace(self).unwrap();
        trace!(
            msg = format!("deleting {}", short_type_name::<K>().unwrap_or("Unknown")),
            resource.name = &name,
            resource.namespace = &namespace
        );
        let api = Api::<K>::namespaced(ctx.client.clone(), &namespace);
        api.delete(&name, &Default::default()).await.map_err(|e| {
            Error::KubeError(
                format!(
                    "failed to delete {} {namespace}/{name}",
                    short_type_name::<K>().unwrap_or("Unknown")
                ),
                e,
            )
        })?;
        Ok(())
    }

    async fn patch(&self, ctx: &Context<T>, obj: K) -> Result<K> {
        let name = obj.name_any();
        // safe unwrap: self is namespace scoped
        let namespace = kube::ResourceExt::namespace(self).unwrap();
        trace!(
            msg = format!("patching {}", short_type_name::<K>().unwrap_or("Unknown")),
            resource.name = &name,
            resource.namespace = &namespace
        );
        let resource_api = Api::<K>::namespaced(ctx.client.clone(), &namespace);

        let result = resource_api
            .patch(
                &name,
                &PatchParams::apply(ctx.controller_id).force(),
                &Patch::Apply(&obj),
            )
            .await;
        match result {
            Ok(resource) => Ok(resource),
            Err(e) => match e {
                kube::Error::Api(ref ae) if ae.code == 422 => {
                    info!(
                        msg = format!(
                            "recreating {} because the update operation was not possible",
                            short_type_name::<K>().unwrap_or("Unknown")
                        ),
                        reason = ae.reason.clone()
                    );
                    self.delete(ctx, &obj).await?;
                    resource_api
                        .patch(
                            &name,
                            &PatchParams::apply(ctx.controller_id).force(),
                            &Patch::Apply(&obj),
                        )
                        .await
                        .map_err(|e| {
                            Error::KubeError(
                                format!(
                                    "failed to re-try patch {} {namespace}/{name}",
                                    short_type_name::<K>().unwrap_or("Unknown")
                                ),
                                e,
                            )
                        })
                }
                _ => Err(Error::KubeError(
                    format!(
                        "failed to patch {} {namespace}/{name}",
                        short_type_name::<K>().unwrap_or("Unknown")
                    ),
                    e,
                )),
            },
        }
    }
}

pub async fn check_api_queryable<K>(client: Client) -> Api<K>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let api = Api::<K>::all(client.clone());
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!(
            "{} is not queryable; {e:?}. Check controller permissions",
            short_type_name::<K>().unwrap_or("Unknown resource"),
        );
        std::process::exit(1);
    }
    api
}

pub fn error_policy<K>(_obj: Arc<K>, _error: &Error, _ctx: Arc<Context<K>>) -> Action
where
    K: Resource + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    unreachable!("Handle in backoff_reconciler macro")
}

#[macro_export]
macro_rules! backoff_reconciler {
    ($inner_reconciler:ident) => {
        |obj, ctx| async move {
            match $inner_reconciler(obj.clone(), ctx.clone()).await {
                Ok(action) => {
                    ctx.reset_backoff(kube::runtime::reflector::ObjectRef::from(obj.as_ref()))
                        .await;
                    Ok(action)
                }
                Err(error) => {
                    // safe unwrap: all resources in the operator are namespace scoped resources
                    let namespace = kube::ResourceExt::namespace(obj.as_ref()).unwrap();
                    let name = kube::ResourceExt::name_any(obj.as_ref());
                    tracing::error!(msg = "failed reconciliation", %namespace, %name, %error);
                    ctx.metrics.reconcile_failure_inc();
                    let backoff_duration = ctx
                        .get_backoff(kube::runtime::reflector::ObjectRef::from(obj.as_ref()))
                        .await;
                    tracing::trace!(
                        msg = format!("backoff duration: {backoff_duration:?}"),
                        %namespace,
                        %name,
                    );
                    Ok(kube::runtime::controller::Action::requeue(backoff_duration))
                }
            }
        }
    };
}
