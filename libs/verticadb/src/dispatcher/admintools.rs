use super::{Dispatch, DispatchOutput, Operation, classify_error};

use vertdb_k8s_util::client::get_output;
use vertdb_operator::error::Result;

use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use kube::api::{Api, AttachParams};

/// Runs every Dispatcher operation as an `admintools` invocation exec'd inside the first running
/// pod of the main cluster, the same `Api<Pod>::exec` + `AttachedProcess` shape used for pulling
/// command output elsewhere in the stack.
pub struct AdmintoolsDispatcher {
    client: Client,
    namespace: String,
    exec_pod: String,
    container: String,
}

impl AdmintoolsDispatcher {
    pub fn new(client: Client, namespace: impl Into<String>, exec_pod: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            exec_pod: exec_pod.into(),
            container: "vertica".to_string(),
        }
    }

    fn command_line(op: &Operation) -> Option<Vec<String>> {
        let admintools = |args: Vec<String>| {
            let mut v = vec!["/opt/vertica/bin/admintools".to_string(), "-t".to_string()];
            v.extend(args);
            Some(v)
        };

        match op {
            Operation::CreateDb {
                hosts,
                db_name,
                catalog_path,
                data_path,
                depot_path,
                auth_parms_path,
                shard_count,
                ..
            } => admintools(vec![
                "create_db".to_string(),
                "--hosts".to_string(),
                join_hosts(hosts),
                "--database".to_string(),
                db_name.clone(),
                "--catalog_path".to_string(),
                catalog_path.clone(),
                "--data_path".to_string(),
                data_path.clone(),
                "--depot_path".to_string(),
                depot_path.clone(),
                "--shard_count".to_string(),
                shard_count.to_string(),
                "--auth".to_string(),
                auth_parms_path.clone(),
            ]),
            Operation::ReviveDb {
                hosts,
                db_name,
                communal_path,
                auth_parms_path,
                describe_only,
            } => {
                let mut args = vec![
                    "revive_db".to_string(),
                    "--hosts".to_string(),
                    join_hosts(hosts),
                    "--database".to_string(),
                    db_name.clone(),
                    "--communal-storage-location".to_string(),
                    communal_path.clone(),
                    "--auth".to_string(),
                    auth_parms_path.clone(),
                ];
                if *describe_only {
                    args.push("--display-only".to_string());
                }
                admintools(args)
            }
            Operation::DescribeDb {
                communal_path,
                auth_parms_path,
            } => admintools(vec![
                "describe_db".to_string(),
                "--communal-storage-location".to_string(),
                communal_path.clone(),
                "--auth".to_string(),
                auth_parms_path.clone(),
            ]),
            Operation::AddSubcluster { name, is_primary } => {
                let mut args = vec!["db_add_subcluster".to_string(), "--subcluster".to_string(), name.clone()];
                if *is_primary {
                    args.push("--is-primary".to_string());
                }
                admintools(args)
            }
            Operation::RemoveSubcluster { name } => admintools(vec![
                "db_remove_subcluster".to_string(),
                "--subcluster".to_string(),
                name.clone(),
            ]),
            Operation::AddNode { subcluster, hosts } => admintools(vec![
                "db_add_node".to_string(),
                "--subcluster".to_string(),
                subcluster.clone(),
                "--hosts".to_string(),
                join_hosts(hosts),
            ]),
            Operation::RemoveNode { vnodes } => admintools(vec![
                "db_remove_node".to_string(),
                "--hosts".to_string(),
                vnodes.join(","),
            ]),
            Operation::RestartNode { vnodes, hosts } => admintools(vec![
                "restart_node".to_string(),
                "--hosts".to_string(),
                vnodes.join(","),
                "--new-host-ips".to_string(),
                join_hosts(hosts),
            ]),
            Operation::StartDb { hosts, host_subset } => {
                let mut args = vec!["start_db".to_string(), "--hosts".to_string(), join_hosts(hosts)];
                if let Some(subset) = host_subset {
                    args.push("--host-subset".to_string());
                    args.push(join_hosts(subset));
                }
                admintools(args)
            }
            Operation::StopDb => admintools(vec!["stop_db".to_string()]),
            Operation::StopSubcluster {
                name,
                drain_seconds,
            } => admintools(vec![
                "stop_subcluster".to_string(),
                "--subcluster".to_string(),
                name.clone(),
                "--drain-seconds".to_string(),
                drain_seconds.to_string(),
            ]),
            Operation::ReIp { map, force } => {
                let mut args = vec!["re_ip".to_string(), "--file".to_string(), re_ip_map_file(map)];
                if *force {
                    args.push("--force".to_string());
                }
                admintools(args)
            }
            Operation::RebalanceShards { subcluster } => {
                let mut args = vec!["rebalance_shards".to_string()];
                if let Some(sc) = subcluster {
                    args.push("--subcluster".to_string());
                    args.push(sc.clone());
                }
                admintools(args)
            }
            Operation::CreateArchive { archive_name } => {
                let mut args = vec!["create_archive".to_string()];
                if let Some(name) = archive_name {
                    args.push("--archive".to_string());
                    args.push(name.clone());
                }
                admintools(args)
            }
            Operation::SaveRestorePoint { archive_name } => admintools(vec![
                "create_restore_point".to_string(),
                "--archive".to_string(),
                archive_name.clone(),
            ]),
            Operation::CheckLicense => admintools(vec!["list_license".to_string()]),
            // admintools has no RPC for promote/demote, sandboxing, or TLS rotation: these
            // require VSQL or vclusterops and are reported unsupported so the caller can fall
            // back or requeue, per the §4.11 contract.
            Operation::AlterSubclusterType { .. }
            | Operation::SandboxSubcluster { .. }
            | Operation::UnsandboxSubcluster { .. }
            | Operation::RotateHttpsCerts { .. } => None,
        }
    }
}

fn join_hosts(hosts: &[std::net::IpAddr]) -> String {
    hosts
        .iter()
        .map(|h| h.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn re_ip_map_file(map: &[(String, std::net::IpAddr, std::net::IpAddr)]) -> String {
    // admintools reads the re_ip map from a file path; the reconciler writes this file before
    // invoking the operation and passes the same path here.
    map.iter()
        .map(|(node, _old, new)| format!("{node} {new}"))
        .collect::<Vec<_>>()
        .join("\n")
}

impl Dispatch for AdmintoolsDispatcher {
    async fn dispatch(&self, op: Operation) -> Result<DispatchOutput> {
        let command = Self::command_line(&op).ok_or_else(|| {
            classify_error(format!(
                "admintools backend does not support operation {}",
                op.name()
            ))
        })?;

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let attached = pods
            .exec(
                &self.exec_pod,
                command,
                &AttachParams::default()
                    .container(self.container.clone())
                    .stdout(true)
                    .stderr(true),
            )
            .await
            .map_err(|e| classify_error(format!("exec failed: {e}")))?;

        let output = get_output(attached)
            .await
            .map_err(|e| classify_error(e.to_string()))?;

        Ok(DispatchOutput {
            raw: output,
            fields: Default::default(),
        })
    }
}
