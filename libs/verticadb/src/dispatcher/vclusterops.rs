use super::{Dispatch, DispatchOutput, Operation, classify_error};

use vertdb_operator::error::Result;

use std::time::Duration;

use serde_json::json;

/// Issues every Dispatcher operation as a JSON-RPC-style POST to the vclusterops HTTPS sidecar
/// running alongside each Vertica pod, over a `reqwest::Client` built with `rustls-tls` and
/// HTTP/2 enabled — the same client construction used elsewhere in the stack for outbound HTTPS.
pub struct VClusterOpsDispatcher {
    client: reqwest::Client,
    base_url: String,
}

impl VClusterOpsDispatcher {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .http2_prior_knowledge()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| classify_error(format!("failed to build vclusterops client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn endpoint_and_body(op: &Operation) -> (&'static str, serde_json::Value) {
        match op {
            Operation::CreateDb {
                hosts,
                db_name,
                shard_count,
                catalog_path,
                data_path,
                depot_path,
                k_safety,
                ..
            } => (
                "/v1/db/create",
                json!({
                    "hosts": hosts.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    "dbName": db_name,
                    "shardCount": shard_count,
                    "catalogPath": catalog_path,
                    "dataPath": data_path,
                    "depotPath": depot_path,
                    "kSafety": k_safety,
                }),
            ),
            Operation::ReviveDb {
                hosts,
                db_name,
                communal_path,
                describe_only,
                ..
            } => (
                "/v1/db/revive",
                json!({
                    "hosts": hosts.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    "dbName": db_name,
                    "communalPath": communal_path,
                    "describeOnly": describe_only,
                }),
            ),
            Operation::DescribeDb { communal_path, .. } => (
                "/v1/db/describe",
                json!({ "communalPath": communal_path }),
            ),
            Operation::AddSubcluster { name, is_primary } => (
                "/v1/subcluster/add",
                json!({ "name": name, "isPrimary": is_primary }),
            ),
            Operation::RemoveSubcluster { name } => {
                ("/v1/subcluster/remove", json!({ "name": name }))
            }
            Operation::AddNode { subcluster, hosts } => (
                "/v1/node/add",
                json!({
                    "subcluster": subcluster,
                    "hosts": hosts.iter().map(ToString::to_string).collect::<Vec<_>>(),
                }),
            ),
            Operation::RemoveNode { vnodes } => ("/v1/node/remove", json!({ "vnodes": vnodes })),
            Operation::RestartNode { vnodes, hosts } => (
                "/v1/node/restart",
                json!({
                    "vnodes": vnodes,
                    "hosts": hosts.iter().map(ToString::to_string).collect::<Vec<_>>(),
                }),
            ),
            Operation::StartDb { hosts, host_subset } => (
                "/v1/db/start",
                json!({
                    "hosts": hosts.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    "hostSubset": host_subset.as_ref().map(|hs| hs.iter().map(ToString::to_string).collect::<Vec<_>>()),
                }),
            ),
            Operation::StopDb => ("/v1/db/stop", json!({})),
            Operation::StopSubcluster {
                name,
                drain_seconds,
            } => (
                "/v1/subcluster/stop",
                json!({ "name": name, "drainSeconds": drain_seconds }),
            ),
            Operation::ReIp { map, force } => (
                "/v1/node/re-ip",
                json!({
                    "map": map.iter().map(|(node, old, new)| json!({
                        "node": node, "oldIP": old.to_string(), "newIP": new.to_string(),
                    })).collect::<Vec<_>>(),
                    "force": force,
                }),
            ),
            Operation::RebalanceShards { subcluster } => {
                ("/v1/shards/rebalance", json!({ "subcluster": subcluster }))
            }
            Operation::AlterSubclusterType {
                name,
                promote_to_primary,
            } => (
                "/v1/subcluster/alter-type",
                json!({ "name": name, "promoteToPrimary": promote_to_primary }),
            ),
            Operation::SandboxSubcluster {
                sandbox,
                subclusters,
            } => (
                "/v1/sandbox/add",
                json!({ "sandbox": sandbox, "subclusters": subclusters }),
            ),
            Operation::UnsandboxSubcluster { subcluster } => {
                ("/v1/sandbox/remove", json!({ "subcluster": subcluster }))
            }
            Operation::CreateArchive { archive_name } => {
                ("/v1/archive/create", json!({ "archiveName": archive_name }))
            }
            Operation::SaveRestorePoint { archive_name } => (
                "/v1/archive/restore-point",
                json!({ "archiveName": archive_name }),
            ),
            Operation::CheckLicense => ("/v1/license/check", json!({})),
            Operation::RotateHttpsCerts {
                key_secret_ref,
                cert_secret_ref,
                ca_secret_ref,
            } => (
                "/v1/tls/https/rotate",
                json!({
                    "keySecretRef": key_secret_ref,
                    "certSecretRef": cert_secret_ref,
                    "caSecretRef": ca_secret_ref,
                }),
            ),
        }
    }
}

impl Dispatch for VClusterOpsDispatcher {
    async fn dispatch(&self, op: Operation) -> Result<DispatchOutput> {
        let (path, body) = Self::endpoint_and_body(&op);
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_error(format!("vclusterops request failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| classify_error(format!("failed to read vclusterops response: {e}")))?;

        if !status.is_success() {
            return Err(classify_error(format!(
                "vclusterops {op_name} failed ({status}): {text}",
                op_name = op.name()
            )));
        }

        let fields = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|v| v.as_object().cloned())
            .map(|obj| {
                obj.into_iter()
                    .map(|(k, v)| (k, v.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(DispatchOutput { raw: text, fields })
    }
}
