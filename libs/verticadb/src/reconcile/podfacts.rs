use crate::crd::VerticaDB;

use vertdb_operator::controller::Context;
use vertdb_operator::error::{Error, Result};

use std::collections::BTreeMap;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kube::api::{Api, AttachParams, ListParams};
use vertdb_k8s_util::client::get_output;

/// A fact that can only be determined by probing a pod; `Unknown` means the probe could not run
/// (pod unreachable, exec failed) rather than that the condition is false.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TriState<T> {
    True(T),
    False,
    #[default]
    Unknown,
}

impl<T> TriState<T> {
    pub fn is_true(&self) -> bool {
        matches!(self, TriState::True(_))
    }
}

impl TriState<()> {
    fn from_bool(b: bool) -> Self {
        if b { TriState::True(()) } else { TriState::False }
    }
}

/// Everything the reconcile actors know about one pod, refreshed once per reconcile and shared
/// across all of them. Any actor that mutates cluster state must call `facts.invalidate()`; the
/// next accessor re-collects before trusting stale data.
#[derive(Clone, Debug, Default)]
pub struct PodFact {
    pub pod_name: String,
    pub subcluster: String,
    pub ip: Option<IpAddr>,
    pub is_running: bool,
    pub is_pending_delete: bool,
    pub installed: TriState<()>,
    pub db_exists: TriState<()>,
    pub vnode_name: Option<String>,
    pub node_state: Option<String>,
    pub shard_subscriptions: u32,
}

#[derive(Clone, Debug, Default)]
pub struct PodFacts {
    pub by_pod: BTreeMap<String, PodFact>,
    pub resource_version: String,
}

impl PodFacts {
    /// Collects facts for every pod belonging to `vdb`, optionally narrowed to one sandbox.
    /// Catastrophic API-server failures abort with an error so the caller requeues the whole
    /// reconcile; per-pod probe failures degrade individual facts to `Unknown` instead.
    pub async fn collect(
        vdb: &VerticaDB,
        ctx: &Context<VerticaDB>,
        sandbox: Option<&str>,
    ) -> Result<Self> {
        let namespace = vdb.get_namespace();
        let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
        let selector = format!("vertica.com/verticadb={}", vdb.name_any());
        let list = pods
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| Error::KubeError("failed to list VerticaDB pods".to_string(), e))?;

        let mut by_pod = BTreeMap::new();
        for pod in list.items {
            let pod_name = pod.name_any();
            let subcluster = pod
                .labels()
                .get("vertica.com/subcluster")
                .cloned()
                .unwrap_or_default();
            if let Some(sb) = sandbox {
                if pod.labels().get("vertica.com/sandbox").map(String::as_str) != Some(sb) {
                    continue;
                }
            }

            let is_running = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .map(|p| p == "Running")
                .unwrap_or(false);
            let is_pending_delete = pod.metadata.deletion_timestamp.is_some();
            let ip = pod
                .status
                .as_ref()
                .and_then(|s| s.pod_ip.as_deref())
                .and_then(|ip| ip.parse().ok());

            let mut fact = PodFact {
                pod_name: pod_name.clone(),
                subcluster,
                ip,
                is_running,
                is_pending_delete,
                ..Default::default()
            };

            if is_running && !is_pending_delete {
                Self::probe_pod(&pods, &pod_name, &mut fact).await;
            }

            by_pod.insert(pod_name, fact);
        }

        Ok(PodFacts {
            by_pod,
            resource_version: vdb.resource_version().unwrap_or_default(),
        })
    }

    /// Marks the snapshot stale after a mutating actor runs. This crate's actor chain always
    /// re-collects fresh facts at the top of the next reconcile, so staleness here only guards
    /// against accidentally trusting counts this pass computed before the mutation.
    pub fn invalidate(&mut self) {
        self.resource_version.clear();
    }

    /// Runs the in-container probes documented for the collector: admintools.conf presence (a
    /// proxy for "installed"), and the data/depot/catalog directory markers (a proxy for
    /// "has a database"). Any exec failure leaves the corresponding fact `Unknown`.
    async fn probe_pod(pods: &Api<Pod>, pod_name: &str, fact: &mut PodFact) {
        let probe = [
            "sh",
            "-c",
            "test -f /opt/vertica/config/admintools.conf && echo INSTALLED; \
             test -d /catalog/*/v_*_catalog && echo HASDB",
        ];

        let attached = match pods
            .exec(pod_name, probe, &AttachParams::default().stdout(true).stderr(true))
            .await
        {
            Ok(attached) => attached,
            Err(_) => return,
        };

        let Ok(output) = get_output(attached).await else {
            return;
        };

        fact.installed = TriState::from_bool(output.contains("INSTALLED"));
        fact.db_exists = TriState::from_bool(output.contains("HASDB"));
    }
}
