//! Worker (k3s agent) installation.

use std::time::Duration;

use remote::{poll_until, Executor};
use stager::ArtifactBundle;
use tracing::info;

use crate::server::{
    cleanup_partial, confirm_artifacts, install_command, unit_active, InstallError, InstallOptions,
};
use crate::token::JoinToken;

/// Window for the agent unit to come up after install.
const AGENT_UNIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Poll interval for the agent unit.
const AGENT_UNIT_INTERVAL: Duration = Duration::from_secs(5);

/// Uninstall script left behind by any prior agent install.
const AGENT_UNINSTALL: &str = "/usr/local/bin/k3s-agent-uninstall.sh";

/// Install and start the agent role on a node, idempotently.
///
/// The join token authenticates the node against the control plane at
/// `server_url`. An already-active agent is left untouched; a partial prior
/// installation is removed first. Cluster-level readiness (`Ready=true`) is
/// the caller's concern via [`crate::wait_node_ready`].
///
/// # Errors
///
/// Returns an [`InstallError`] on transport, staging, or install failure,
/// or [`InstallError::Timeout`] if the agent unit never comes up.
pub fn install_agent(
    exec: &dyn Executor,
    server_url: &str,
    token: &JoinToken,
    bundle: &ArtifactBundle,
    opts: &InstallOptions,
) -> Result<(), InstallError> {
    if unit_active(exec, "k3s-agent")? {
        info!(host = exec.host(), "agent already installed and active");
        return Ok(());
    }

    cleanup_partial(exec, AGENT_UNINSTALL)?;
    confirm_artifacts(exec, bundle)?;

    info!(
        host = exec.host(),
        server_url,
        version = %bundle.version,
        mode = %bundle.mode,
        "installing agent"
    );

    let cmd = install_command(bundle, opts, "agent")
        .env("K3S_URL", server_url)
        .env_secret("K3S_TOKEN", token.value());
    exec.execute_ok(&cmd)?;

    poll_until(
        &format!("agent unit on {}", exec.host()),
        AGENT_UNIT_TIMEOUT,
        AGENT_UNIT_INTERVAL,
        || {
            unit_active(exec, "k3s-agent")
                .unwrap_or(false)
                .then_some(())
        },
    )?;

    info!(host = exec.host(), "agent is up");
    Ok(())
}
