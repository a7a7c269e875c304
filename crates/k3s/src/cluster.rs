//! Read-only cluster queries over the server node.
//!
//! Every query shells into `k3s kubectl` on the server over SSH; no
//! kubeconfig ever leaves the node.

use std::time::Duration;

use remote::{poll_until, Executor, ExecOutput, RemoteCommand, RemoteError};
use tracing::{debug, info};

use crate::server::InstallError;

/// How long to wait for a node to report Ready.
pub const NODE_READY_TIMEOUT: Duration = Duration::from_secs(150);

/// Poll interval for node readiness.
const NODE_READY_INTERVAL: Duration = Duration::from_secs(5);

/// Run `k3s kubectl` with the given arguments on the server.
pub(crate) fn kubectl(exec: &dyn Executor, args: &[&str]) -> Result<ExecOutput, RemoteError> {
    let cmd = RemoteCommand::new("k3s")
        .arg("kubectl")
        .args(args.iter().copied())
        .sudo();
    exec.execute(&cmd)
}

/// Whether the named cluster node currently reports `Ready=true`.
///
/// # Errors
///
/// Returns an error on transport failure; an unknown node reads as not ready.
pub fn node_ready(exec: &dyn Executor, node_name: &str) -> Result<bool, RemoteError> {
    let jsonpath = "jsonpath={.status.conditions[?(@.type=='Ready')].status}";
    let out = kubectl(exec, &["get", "node", node_name, "-o", jsonpath])?;
    Ok(out.success() && out.stdout.trim() == "True")
}

/// Poll the cluster node list until `node_name` reports `Ready=true`.
///
/// # Errors
///
/// Returns [`InstallError::Timeout`] if the condition is not observed in
/// the window.
pub fn wait_node_ready(
    exec: &dyn Executor,
    node_name: &str,
    timeout: Duration,
) -> Result<(), InstallError> {
    info!(node = node_name, timeout_secs = timeout.as_secs(), "waiting for Ready");

    poll_until(
        &format!("node {node_name} Ready"),
        timeout,
        NODE_READY_INTERVAL,
        || match node_ready(exec, node_name) {
            Ok(true) => Some(()),
            Ok(false) => None,
            Err(e) => {
                debug!(node = node_name, error = %e, "readiness query failed");
                None
            }
        },
    )?;

    info!(node = node_name, "node is Ready");
    Ok(())
}

/// Names of all nodes currently registered in the cluster.
///
/// # Errors
///
/// Returns an error on transport failure or a failed query.
pub fn list_node_names(exec: &dyn Executor) -> Result<Vec<String>, InstallError> {
    let jsonpath = "jsonpath={.items[*].metadata.name}";
    let out = kubectl(exec, &["get", "nodes", "-o", jsonpath])?;
    if !out.success() {
        return Err(InstallError::Query {
            host: exec.host().to_string(),
            stderr: out.stderr.trim().to_string(),
        });
    }
    Ok(out
        .stdout
        .split_whitespace()
        .map(str::to_string)
        .collect())
}

/// The installed k3s version on a node, if the binary is present.
///
/// # Errors
///
/// Returns an error only on transport failure.
pub fn installed_version(exec: &dyn Executor) -> Result<Option<String>, RemoteError> {
    let out = exec.execute(&RemoteCommand::new("k3s").arg("--version"))?;
    if !out.success() {
        return Ok(None);
    }
    Ok(parse_version(&out.stdout))
}

/// Extract the version tag from `k3s --version` output.
fn parse_version(output: &str) -> Option<String> {
    // First line looks like: "k3s version v1.30.2+k3s1 (ab12cd34)"
    output
        .lines()
        .next()?
        .split_whitespace()
        .find(|tok| tok.starts_with('v'))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        let out = "k3s version v1.30.2+k3s1 (d7ae6526)\ngo version go1.22.4\n";
        assert_eq!(parse_version(out), Some("v1.30.2+k3s1".to_string()));
    }

    #[test]
    fn test_parse_version_garbage() {
        assert_eq!(parse_version(""), None);
        assert_eq!(parse_version("command not found"), None);
    }
}
