use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
#[cfg(feature = "schemars")]
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The `VerticaDB` custom resource defines a desired Vertica analytic database cluster topology:
/// subclusters, image, communal storage, TLS, sandboxes, upgrade and init policy. For each
/// `VerticaDB`, the operator deploys one `StatefulSet` (and optional proxy `Deployment`) per
/// subcluster in the same namespace.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[kube(
    group = "vertica.com",
    version = "v1",
    kind = "VerticaDB",
    plural = "verticadbs",
    singular = "verticadb",
    shortname = "vdb",
    namespaced,
    status = "VerticaDBStatus",
    printcolumn = r#"{"name":"Subclusters","type":"integer","jsonPath":".spec.subclusters.length()"}"#,
    printcolumn = r#"{"name":"Initialized","type":"string","jsonPath":".status.conditions[?(@.type == 'DBInitialized')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#,
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct VerticaDBSpec {
    /// How the database should come into existence.
    #[serde(default)]
    pub init_policy: InitPolicy,

    /// Container image running the Vertica server.
    pub image: String,

    /// Communal (shared object storage) configuration.
    pub communal: CommunalStorage,

    /// Local (pod-disk) storage paths and sizing.
    #[serde(default)]
    pub local: LocalStorage,

    /// Ordered list of subclusters. The first primary subcluster in this order is the default
    /// subcluster the catalog falls back to.
    pub subclusters: Vec<Subcluster>,

    /// Redundancy level: 0 = single-node, 1 = tolerate one primary loss.
    #[serde(default = "default_k_safety")]
    pub k_safety: u8,

    /// Number of shards in the EON catalog.
    pub shard_count: u32,

    /// Catalog/database name.
    pub db_name: String,

    /// Seconds to wait for a node to come back up before giving up on a restart attempt.
    #[serde(default = "default_restart_timeout")]
    pub restart_timeout: u32,

    /// Skip the cluster-lease check that otherwise blocks re-creating a database whose lease
    /// has not yet expired.
    #[serde(default)]
    pub ignore_cluster_lease: bool,

    /// Image upgrade strategy.
    #[serde(default)]
    pub upgrade_policy: UpgradePolicy,

    /// Allow upgrades that skip versions or downgrade.
    #[serde(default)]
    pub ignore_upgrade_path: bool,

    /// Requeue interval used during long upgrade phases, to avoid exponential controller backoff.
    #[serde(default = "default_upgrade_requeue_time")]
    pub upgrade_requeue_time: u32,

    /// Sandboxes, in spec order.
    #[serde(default)]
    pub sandboxes: Vec<Sandbox>,

    /// TLS configuration for the HTTPS/NMA service.
    #[serde(default)]
    pub https_nma_tls: TLSConfig,

    /// TLS configuration for the client/server protocol.
    #[serde(default)]
    pub client_server_tls: TLSConfig,

    /// Legacy single-secret NMA TLS reference, superseded by `httpsNMATLS.secret`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nma_tls_secret: Option<String>,

    /// Parameters controlling a revive-from-communal-storage flow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore_point: Option<RestorePoint>,

    /// Secret holding the Vertica license.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_secret: Option<String>,

    /// Encrypt the internal spread (cluster membership) protocol.
    #[serde(default)]
    pub encrypt_spread_comm: bool,

    /// Pod-to-subcluster assignment used by revive, honoring the pre-existing vnode-to-host
    /// mapping. Unlisted subclusters are appended in spec order.
    #[serde(default)]
    pub revive_order: Vec<ReviveOrderEntry>,
}

fn default_k_safety() -> u8 {
    1
}

fn default_restart_timeout() -> u32 {
    600
}

fn default_upgrade_requeue_time() -> u32 {
    30
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "PascalCase")]
pub enum InitPolicy {
    #[default]
    Create,
    CreateSkipPackageInstall,
    Revive,
    ScheduleOnly,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "PascalCase")]
pub enum UpgradePolicy {
    #[default]
    Auto,
    Offline,
    ReadOnlyOnline,
    Online,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct CommunalStorage {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default)]
    pub additional_config: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kerberos: Option<KerberosConfig>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct KerberosConfig {
    pub service_name: String,
    pub realm: String,
    pub keytab_file: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct LocalStorage {
    #[serde(default = "default_data_path")]
    pub data_path: String,
    #[serde(default = "default_depot_path")]
    pub depot_path: String,
    #[serde(default = "default_catalog_path")]
    pub catalog_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depot_volume: Option<String>,
}

fn default_data_path() -> String {
    "/data".to_string()
}
fn default_depot_path() -> String {
    "/depot".to_string()
}
fn default_catalog_path() -> String {
    "/catalog".to_string()
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct Subcluster {
    pub name: String,
    #[serde(default)]
    pub size: u32,
    #[serde(rename = "type", default)]
    pub type_: SubclusterType,
    #[serde(default)]
    pub shutdown: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxySpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "PascalCase")]
pub enum SubclusterType {
    #[default]
    Primary,
    Secondary,
    Transient,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct ProxySpec {
    #[serde(default = "default_proxy_replicas")]
    pub replicas: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

fn default_proxy_replicas() -> u32 {
    1
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct Sandbox {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub subclusters: Vec<String>,
    #[serde(default)]
    pub shutdown: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct TLSConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default)]
    pub mode: TLSMode,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TLSMode {
    #[default]
    Disable,
    Enable,
    TryVerify,
    VerifyCa,
    VerifyFull,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct RestorePoint {
    pub archive: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct ReviveOrderEntry {
    pub subcluster_index: u32,
    pub pod_count: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct VerticaDBStatus {
    #[serde(default)]
    pub subclusters: Vec<SubclusterStatus>,
    #[serde(default)]
    pub sandboxes: Vec<SandboxStatus>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub tls_configs: Vec<TLSConfigStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade_status: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct SubclusterStatus {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oid: Option<String>,
    #[serde(default)]
    pub install_count: u32,
    #[serde(default)]
    pub added_to_db_count: u32,
    #[serde(default)]
    pub up_node_count: u32,
    #[serde(default)]
    pub shutdown: bool,
    #[serde(default)]
    pub detail: Vec<PodDetail>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct PodDetail {
    pub pod_name: String,
    pub installed: bool,
    pub added_to_db: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vnode_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct SandboxStatus {
    pub name: String,
    #[serde(default)]
    pub subclusters: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct TLSConfigStatus {
    pub name: String,
    pub secret: String,
    pub mode: TLSMode,
}

/// Closed set of status-condition kinds tracked on `VerticaDBStatus.conditions`.
pub const CONDITION_DB_INITIALIZED: &str = "DBInitialized";
pub const CONDITION_AUTO_RESTART_VERTICA: &str = "AutoRestartVertica";
pub const CONDITION_VERTICA_RESTART_NEEDED: &str = "VerticaRestartNeeded";
pub const CONDITION_IMAGE_CHANGE_IN_PROGRESS: &str = "ImageChangeInProgress";
pub const CONDITION_OFFLINE_UPGRADE_IN_PROGRESS: &str = "OfflineUpgradeInProgress";
pub const CONDITION_READONLY_ONLINE_UPGRADE_IN_PROGRESS: &str = "ReadOnlyOnlineUpgradeInProgress";
pub const CONDITION_ONLINE_UPGRADE_IN_PROGRESS: &str = "OnlineUpgradeInProgress";
pub const CONDITION_SAVE_RESTORE_POINTS_NEEDED: &str = "SaveRestorePointsNeeded";
pub const CONDITION_TLS_CERT_ROTATION_IN_PROGRESS: &str = "TLSCertRotationInProgress";
pub const CONDITION_HTTPS_CERT_ROTATION_FINISHED: &str = "HTTPSCertRotationFinished";
pub const CONDITION_TLS_CERT_ROLLBACK_NEEDED: &str = "TLSCertRollbackNeeded";

impl VerticaDBSpec {
    /// The first primary subcluster in spec order; the catalog's fallback default subcluster.
    pub fn default_subcluster(&self) -> Option<&Subcluster> {
        self.subclusters
            .iter()
            .find(|sc| sc.type_ == SubclusterType::Primary)
    }
}
