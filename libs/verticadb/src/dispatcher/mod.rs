pub mod admintools;
pub mod vclusterops;

use vertdb_operator::error::{DispatchErrorKind, Error, Result};

use std::collections::BTreeMap;
use std::net::IpAddr;

/// Which concrete implementation a `VerticaDB` is configured to use for every cluster operation.
/// Selection is per-object (driven by the `vclusterops` annotation) and version-gated against the
/// running image via `vertdb_operator::version::supports_vclusterops`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Admintools,
    VClusterOps,
}

/// One variant per cluster operation the Dispatcher exposes. Each carries its own typed inputs
/// rather than a loose option map, so a backend that cannot support an operation fails to compile
/// against a mismatched call site instead of at runtime.
#[derive(Clone, Debug)]
pub enum Operation {
    CreateDb {
        hosts: Vec<IpAddr>,
        db_name: String,
        shard_count: u32,
        catalog_path: String,
        data_path: String,
        depot_path: String,
        auth_parms_path: String,
        k_safety: u8,
    },
    ReviveDb {
        hosts: Vec<IpAddr>,
        db_name: String,
        communal_path: String,
        auth_parms_path: String,
        describe_only: bool,
    },
    DescribeDb {
        communal_path: String,
        auth_parms_path: String,
    },
    AddSubcluster {
        name: String,
        is_primary: bool,
    },
    RemoveSubcluster {
        name: String,
    },
    AddNode {
        subcluster: String,
        hosts: Vec<IpAddr>,
    },
    RemoveNode {
        vnodes: Vec<String>,
    },
    RestartNode {
        vnodes: Vec<String>,
        hosts: Vec<IpAddr>,
    },
    StartDb {
        hosts: Vec<IpAddr>,
        host_subset: Option<Vec<IpAddr>>,
    },
    StopDb,
    StopSubcluster {
        name: String,
        drain_seconds: u32,
    },
    ReIp {
        map: Vec<(String, IpAddr, IpAddr)>,
        force: bool,
    },
    RebalanceShards {
        subcluster: Option<String>,
    },
    AlterSubclusterType {
        name: String,
        promote_to_primary: bool,
    },
    SandboxSubcluster {
        sandbox: String,
        subclusters: Vec<String>,
    },
    UnsandboxSubcluster {
        subcluster: String,
    },
    CreateArchive {
        archive_name: Option<String>,
    },
    SaveRestorePoint {
        archive_name: String,
    },
    CheckLicense,
    RotateHttpsCerts {
        key_secret_ref: String,
        cert_secret_ref: String,
        ca_secret_ref: String,
    },
}

impl Operation {
    /// Human-readable tag used in logs/events; never part of the Dispatcher wire protocol.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::CreateDb { .. } => "CreateDB",
            Operation::ReviveDb { .. } => "ReviveDB",
            Operation::DescribeDb { .. } => "DescribeDB",
            Operation::AddSubcluster { .. } => "AddSubcluster",
            Operation::RemoveSubcluster { .. } => "RemoveSubcluster",
            Operation::AddNode { .. } => "AddNode",
            Operation::RemoveNode { .. } => "RemoveNode",
            Operation::RestartNode { .. } => "RestartNode",
            Operation::StartDb { .. } => "StartDB",
            Operation::StopDb => "StopDB",
            Operation::StopSubcluster { .. } => "StopSubcluster",
            Operation::ReIp { .. } => "ReIP",
            Operation::RebalanceShards { .. } => "RebalanceShards",
            Operation::AlterSubclusterType { .. } => "AlterSubclusterType",
            Operation::SandboxSubcluster { .. } => "SandboxSubcluster",
            Operation::UnsandboxSubcluster { .. } => "UnsandboxSubcluster",
            Operation::CreateArchive { .. } => "CreateArchive",
            Operation::SaveRestorePoint { .. } => "SaveRestorePoint",
            Operation::CheckLicense => "CheckLicense",
            Operation::RotateHttpsCerts { .. } => "RotateHTTPSCerts",
        }
    }
}

/// Output of a dispatched operation: raw admintools stdout, or a parsed vclusterops response
/// body, normalized to a key/value map the callers pick fields out of.
#[derive(Clone, Debug, Default)]
pub struct DispatchOutput {
    pub raw: String,
    pub fields: BTreeMap<String, String>,
}

#[allow(async_fn_in_trait)]
pub trait Dispatch {
    async fn dispatch(&self, op: Operation) -> Result<DispatchOutput>;
}

/// Annotation selecting the vclusterops backend for a `VerticaDB`; absent or `"false"` keeps the
/// admintools default.
pub const VCLUSTEROPS_ANNOTATION: &str = "vertica.com/vcluster-ops";

/// A concrete, statically dispatched Dispatcher. `Operation::dispatch` stays an `async fn` in the
/// `Dispatch` trait (not object-safe as `dyn`), so callers hold one of these instead of a trait
/// object and match through to the right implementation.
pub enum AnyDispatcher {
    Admintools(admintools::AdmintoolsDispatcher),
    VClusterOps(vclusterops::VClusterOpsDispatcher),
}

impl Dispatch for AnyDispatcher {
    async fn dispatch(&self, op: Operation) -> Result<DispatchOutput> {
        match self {
            AnyDispatcher::Admintools(d) => d.dispatch(op).await,
            AnyDispatcher::VClusterOps(d) => d.dispatch(op).await,
        }
    }
}

/// Picks the backend annotation-first, then gates it against the running image's version: an
/// image too old for vclusterops silently falls back to admintools rather than hard-failing, so
/// an operator-wide annotation rollout does not brick clusters mid-upgrade.
pub fn select_backend(
    client: kube::Client,
    namespace: &str,
    exec_pod: &str,
    image: &str,
    wants_vclusterops: bool,
    vclusterops_url: Option<&str>,
) -> Result<AnyDispatcher> {
    let use_vclusterops = wants_vclusterops
        && vertdb_operator::version::supports_vclusterops(image)
        && vclusterops_url.is_some();

    if use_vclusterops {
        // safe unwrap: checked above
        Ok(AnyDispatcher::VClusterOps(vclusterops::VClusterOpsDispatcher::new(
            vclusterops_url.unwrap(),
        )?))
    } else {
        Ok(AnyDispatcher::Admintools(admintools::AdmintoolsDispatcher::new(
            client, namespace, exec_pod,
        )))
    }
}

/// Maps a raw backend failure message onto the closed `DispatchErrorKind` taxonomy so every
/// caller gets the same typed warning-event reason regardless of which backend ran the operation.
pub fn classify_failure(message: &str) -> DispatchErrorKind {
    let m = message.to_ascii_lowercase();
    if m.contains("communal storage location") && m.contains("not empty") {
        DispatchErrorKind::CommunalPathNotEmpty
    } else if m.contains("wrong region") || m.contains("region mismatch") {
        DispatchErrorKind::WrongRegion
    } else if m.contains("bucket") && (m.contains("does not exist") || m.contains("not found")) {
        DispatchErrorKind::BucketMissing
    } else if m.contains("could not connect") || m.contains("endpoint") {
        DispatchErrorKind::EndpointBad
    } else if m.contains("cluster lease") {
        DispatchErrorKind::ClusterLeaseNotExpired
    } else if m.contains("permission denied") || m.contains("access denied") {
        DispatchErrorKind::PermissionDenied
    } else if m.contains("node count") || m.contains("number of nodes") {
        DispatchErrorKind::NodeCountMismatch
    } else if m.contains("database") && m.contains("does not exist") {
        DispatchErrorKind::DatabaseNotFound
    } else if m.contains("kerberos") {
        DispatchErrorKind::KerberosFailure
    } else {
        DispatchErrorKind::Unknown
    }
}

/// Turn a classified backend failure into an `Error`, ready to bubble up through `?`.
pub fn classify_error(message: impl Into<String>) -> Error {
    let message = message.into();
    let kind = classify_failure(&message);
    Error::DispatcherError { kind, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_known_kinds() {
        assert_eq!(
            classify_failure("Could not connect to endpoint https://s3.example.com"),
            DispatchErrorKind::EndpointBad
        );
        assert_eq!(
            classify_failure("Permission denied writing to bucket"),
            DispatchErrorKind::PermissionDenied
        );
        assert_eq!(
            classify_failure("something exploded"),
            DispatchErrorKind::Unknown
        );
    }
}
