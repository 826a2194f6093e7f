use crate::crd::{CONDITION_VERTICA_RESTART_NEEDED, InitPolicy, VerticaDB, VerticaDBStatus};
use crate::dispatcher::{Dispatch, Operation};

use super::podfacts::PodFacts;
use super::status::{is_vertica_restart_needed, set_condition};

use vertdb_k8s_util::client::get_output;
use vertdb_operator::controller::Context;
use vertdb_operator::error::Result;

use std::net::IpAddr;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kube::api::{Api, AttachParams};
use tokio::time::Duration;
use tracing::info;

const ADMINTOOLS_CONF_PATH: &str = "/opt/vertica/config/admintools.conf";
const KILL_STRAY_PROBE: &[&str] = &["sh", "-c", "pkill -9 -f '/opt/vertica/bin/vertica ' && echo KILLED || true"];

/// Chooses between cluster-wide and per-node restart based on how many nodes are currently up,
/// kills stray vertica processes, re-IPs pods whose address changed, and starts/restarts the
/// affected nodes. Kill-processes always precedes re-IP, which always precedes start.
///
/// A pending `VerticaRestartNeeded` condition (set when a config change like `encryptSpreadComm`
/// requires every node to come back up, not just the down ones) forces a full stop/start even
/// when nodes are already up, and is cleared once that bounce completes.
pub async fn reconcile_restart(
    vdb: &VerticaDB,
    ctx: &Context<VerticaDB>,
    facts: &mut PodFacts,
    status: &mut VerticaDBStatus,
) -> Result<()> {
    if vdb.spec.init_policy == InitPolicy::ScheduleOnly {
        return Ok(());
    }

    let up_node_count = facts
        .by_pod
        .values()
        .filter(|f| f.is_running && f.db_exists.is_true())
        .count();

    if up_node_count == 0 {
        cluster_wide_restart(vdb, ctx, facts).await
    } else if is_vertica_restart_needed(status) {
        force_restart_up_nodes(vdb, ctx, facts).await?;
        set_condition(
            &mut status.conditions,
            CONDITION_VERTICA_RESTART_NEEDED,
            false,
            "Restarted",
            "cluster restarted to pick up pending configuration",
            vdb.meta().generation,
        );
        Ok(())
    } else {
        per_node_restart(vdb, ctx, facts).await
    }
}

/// Stops and restarts every already-up node, used to force a cluster-wide bounce that `per_node_restart`
/// would otherwise skip since no node is actually down.
async fn force_restart_up_nodes(vdb: &VerticaDB, ctx: &Context<VerticaDB>, facts: &mut PodFacts) -> Result<()> {
    let installed: Vec<_> = facts.by_pod.values().filter(|f| f.installed.is_true()).collect();
    if installed.is_empty() {
        return Ok(());
    }
    let Ok(dispatcher) = super::select_dispatcher(vdb, ctx, facts) else {
        return Ok(());
    };

    dispatcher.dispatch(Operation::StopDb).await?;
    let hosts: Vec<IpAddr> = installed.iter().filter_map(|f| f.ip).collect();
    dispatcher
        .dispatch(Operation::StartDb {
            hosts,
            host_subset: None,
        })
        .await?;
    facts.invalidate();
    Ok(())
}

async fn cluster_wide_restart(vdb: &VerticaDB, ctx: &Context<VerticaDB>, facts: &mut PodFacts) -> Result<()> {
    let installed: Vec<_> = facts.by_pod.values().filter(|f| f.installed.is_true()).collect();
    if installed.is_empty() {
        return Ok(());
    }
    let Some(admintools_pod) = installed.iter().find(|f| f.is_running).map(|f| f.pod_name.clone()) else {
        return Ok(());
    };

    let Ok(dispatcher) = super::select_dispatcher(vdb, ctx, facts) else {
        return Ok(());
    };

    let killed = kill_stray_processes(ctx, &vdb.get_namespace(), &installed.iter().map(|f| f.pod_name.clone()).collect::<Vec<_>>()).await?;
    if killed {
        facts.invalidate();
        return Ok(());
    }

    reip_changed_pods(vdb, ctx, &admintools_pod, facts, &dispatcher).await?;

    let hosts: Vec<IpAddr> = installed.iter().filter_map(|f| f.ip).collect();
    dispatcher
        .dispatch(Operation::StartDb {
            hosts,
            host_subset: None,
        })
        .await?;
    facts.invalidate();
    Ok(())
}

async fn per_node_restart(vdb: &VerticaDB, ctx: &Context<VerticaDB>, facts: &mut PodFacts) -> Result<()> {
    let restartable: Vec<_> = facts
        .by_pod
        .values()
        .filter(|f| f.installed.is_true() && f.db_exists.is_true() && !f.is_running && !f.is_pending_delete)
        .cloned()
        .collect();
    if restartable.is_empty() {
        return Ok(());
    }

    let Ok(dispatcher) = super::select_dispatcher(vdb, ctx, facts) else {
        return Ok(());
    };

    let running_pods: Vec<_> = facts.by_pod.values().filter(|f| f.is_running).map(|f| f.pod_name.clone()).collect();
    let killed = kill_stray_processes(ctx, &vdb.get_namespace(), &running_pods).await?;
    if killed {
        facts.invalidate();
        return Ok(());
    }

    let vnodes: Vec<String> = restartable.iter().filter_map(|f| f.vnode_name.clone()).collect();
    let hosts: Vec<IpAddr> = restartable.iter().filter_map(|f| f.ip).collect();
    if !vnodes.is_empty() {
        match dispatcher.dispatch(Operation::RestartNode { vnodes, hosts }).await {
            Ok(_) => {}
            Err(e) if e.to_string().contains("not down") => {
                // the catalog still believes these nodes are up; give status a moment to settle
                info!(msg = "restart_node reported nodes already up, requeuing");
                return Err(vertdb_operator::error::Error::RequeueAfter(Duration::from_secs(10)));
            }
            Err(e) => return Err(e),
        }
    }

    reip_changed_pods(vdb, ctx, &restartable[0].pod_name, facts, &dispatcher).await?;
    facts.invalidate();
    Ok(())
}

async fn reip_changed_pods(
    vdb: &VerticaDB,
    ctx: &Context<VerticaDB>,
    probe_pod: &str,
    facts: &PodFacts,
    dispatcher: &impl Dispatch,
) -> Result<()> {
    let old_ips = read_admintools_conf_ips(ctx, &vdb.get_namespace(), probe_pod).await?;

    let mut map = Vec::new();
    for (node, old_ip) in &old_ips {
        let Some(fact) = facts.by_pod.values().find(|f| f.vnode_name.as_deref() == Some(node.as_str())) else {
            continue;
        };
        if let Some(new_ip) = fact.ip {
            if new_ip != *old_ip {
                map.push((node.clone(), *old_ip, new_ip));
            }
        }
    }

    if map.is_empty() {
        return Ok(());
    }

    dispatcher.dispatch(Operation::ReIp { map, force: true }).await?;
    Ok(())
}

/// Reads the observed catalog node -> IP mapping out of `admintools.conf` on `pod`, matching
/// lines of the form `node0001 = 10.0.0.1,...`.
async fn read_admintools_conf_ips(
    ctx: &Context<VerticaDB>,
    namespace: &str,
    pod: &str,
) -> Result<Vec<(String, IpAddr)>> {
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);
    let command = vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("grep -E '^node[0-9]+ = ' {ADMINTOOLS_CONF_PATH}"),
    ];
    let attached = pods
        .exec(pod, command, &AttachParams::default().stdout(true).stderr(true))
        .await
        .map_err(|e| vertdb_operator::error::Error::PodExecError(format!("admintools.conf read failed: {e}")))?;
    let output = get_output(attached)
        .await
        .map_err(|e| vertdb_operator::error::Error::ReceiveOutput(e.to_string()))?;

    Ok(parse_admintools_conf(&output))
}

fn parse_admintools_conf(output: &str) -> Vec<(String, IpAddr)> {
    output
        .lines()
        .filter_map(|line| {
            let (node, rest) = line.split_once('=')?;
            let ip_str = rest.split(',').next()?.trim();
            let ip = ip_str.parse().ok()?;
            Some((node.trim().to_string(), ip))
        })
        .collect()
}

/// Kills any lingering `vertica` process on the given pods (e.g. left over from a prior crash),
/// so re-IP and restart do not race a half-dead process still holding the old address.
async fn kill_stray_processes(ctx: &Context<VerticaDB>, namespace: &str, pod_names: &[String]) -> Result<bool> {
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);
    let mut any_killed = false;
    for pod_name in pod_names {
        let attached = match pods
            .exec(pod_name, KILL_STRAY_PROBE.to_vec(), &AttachParams::default().stdout(true).stderr(true))
            .await
        {
            Ok(attached) => attached,
            Err(_) => continue,
        };
        if let Ok(output) = get_output(attached).await {
            if output.contains("KILLED") {
                any_killed = true;
            }
        }
    }
    Ok(any_killed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_admintools_conf() {
        let output = "node0001 = 10.0.0.1,/data,/depot\nnode0002 = 10.0.0.2,/data,/depot\n";
        let parsed = parse_admintools_conf(output);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].0, "node0001");
        assert_eq!(parsed[0].1, "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_parse_admintools_conf_ignores_unrelated_lines() {
        let output = "database = verticadb\nnode0001 = 10.0.0.1,/data,/depot\n";
        let parsed = parse_admintools_conf(output);
        assert_eq!(parsed.len(), 1);
    }
}
