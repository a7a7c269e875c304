//! Control-plane (k3s server) installation.

use std::time::Duration;

use remote::{poll_until, Executor, PollTimeout, RemoteCommand, RemoteError};
use stager::{push, ArtifactBundle, StageError, StageMode};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cluster::kubectl;

/// Window for the control-plane local API to report ready.
pub const SERVER_READY_TIMEOUT: Duration = Duration::from_secs(150);

/// Poll interval for readiness checks.
const READY_INTERVAL: Duration = Duration::from_secs(5);

/// Uninstall script left behind by any prior server install.
const SERVER_UNINSTALL: &str = "/usr/local/bin/k3s-uninstall.sh";

/// Errors installing a cluster role on a node.
#[derive(Debug, Error)]
pub enum InstallError {
    /// Transport failure.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Artifact staging or delivery failure.
    #[error(transparent)]
    Stage(#[from] StageError),

    /// Readiness was not observed in the window. Never silently ignored.
    #[error(transparent)]
    Timeout(#[from] PollTimeout),

    /// A cluster query failed.
    #[error("cluster query on {host} failed: {stderr}")]
    Query { host: String, stderr: String },
}

/// Options shared by server and agent installs.
#[derive(Debug, Clone)]
pub struct InstallOptions {
    /// Pinned installer version (e.g. `v1.30.2+k3s1`).
    pub version: String,
    /// Install script URL used by online nodes.
    pub script_url: String,
    /// Readiness window for the installed role.
    pub ready_timeout: Duration,
}

impl InstallOptions {
    /// Options for a pinned version with lab defaults.
    #[must_use]
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            script_url: stager::source::DEFAULT_INSTALL_SCRIPT_URL.to_string(),
            ready_timeout: SERVER_READY_TIMEOUT,
        }
    }

    /// Override the install script URL (private mirror).
    #[must_use]
    pub fn with_script_url(mut self, url: impl Into<String>) -> Self {
        self.script_url = url.into();
        self
    }

    /// Override the readiness window.
    #[must_use]
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }
}

/// Whether a systemd unit is currently active on the node.
pub(crate) fn unit_active(exec: &dyn Executor, unit: &str) -> Result<bool, RemoteError> {
    let out = exec.execute(&RemoteCommand::new("systemctl").args(["is-active", unit]))?;
    Ok(out.success())
}

/// Whether the control plane is installed, active, and ready on the node.
///
/// This is the control-plane phase's idempotency predicate: when it holds,
/// installation is skipped entirely.
#[must_use]
pub fn healthy(exec: &dyn Executor) -> bool {
    unit_active(exec, "k3s").unwrap_or(false) && server_ready(exec)
}

/// Whether the control-plane local API answers its readiness probe.
fn server_ready(exec: &dyn Executor) -> bool {
    match kubectl(exec, &["get", "--raw", "/readyz"]) {
        Ok(out) => out.success() && out.stdout.trim() == "ok",
        Err(e) => {
            debug!(host = exec.host(), error = %e, "readyz probe failed");
            false
        }
    }
}

/// Run the uninstall script if a partial prior installation left one behind.
pub(crate) fn cleanup_partial(
    exec: &dyn Executor,
    uninstall_script: &str,
) -> Result<(), InstallError> {
    let present = exec
        .execute(&RemoteCommand::new("test").args(["-x", uninstall_script]))?
        .success();
    if !present {
        return Ok(());
    }

    warn!(host = exec.host(), uninstall_script, "cleaning up partial installation");
    exec.execute_ok(&RemoteCommand::new(uninstall_script).sudo())?;
    Ok(())
}

/// Make sure the node holds the offline bundle, pushing it if absent.
pub(crate) fn confirm_artifacts(
    exec: &dyn Executor,
    bundle: &ArtifactBundle,
) -> Result<(), InstallError> {
    if bundle.mode == StageMode::Online {
        return Ok(());
    }

    let binary_present = exec
        .execute(&RemoteCommand::new("test").args(["-x", stager::push::NODE_BINARY_PATH]))?
        .success();
    let script_present = exec
        .execute(&RemoteCommand::new("test").args(["-f", stager::push::NODE_INSTALL_SCRIPT]))?
        .success();

    if binary_present && script_present {
        debug!(host = exec.host(), "bundle already on node");
        return Ok(());
    }

    push(bundle, exec)?;
    Ok(())
}

/// Build the install command for a role.
///
/// Offline installs run the pushed script with downloads disabled; online
/// installs let the node fetch the pinned version through the vendor script.
/// Untrusted values only travel through quoted environment assignments.
pub(crate) fn install_command(
    bundle: &ArtifactBundle,
    opts: &InstallOptions,
    role_arg: &str,
) -> RemoteCommand {
    match bundle.mode {
        StageMode::Offline => RemoteCommand::new("sh")
            .args([stager::push::NODE_INSTALL_SCRIPT, role_arg])
            .env("INSTALL_K3S_SKIP_DOWNLOAD", "true")
            .sudo(),
        StageMode::Online => RemoteCommand::new("sh")
            .args([
                "-c",
                &format!("curl -sfL \"$INSTALL_SCRIPT_URL\" | sh -s - {role_arg}"),
            ])
            .env("INSTALL_SCRIPT_URL", &opts.script_url)
            .env("INSTALL_K3S_VERSION", &opts.version)
            .sudo(),
    }
}

/// Install and start the control-plane role on a node, idempotently.
///
/// An already-active, ready server is left untouched. A partial prior
/// installation is removed first. Success means the local API answered its
/// readiness probe within the window.
///
/// # Errors
///
/// Returns an [`InstallError`]; a readiness window expiry is
/// [`InstallError::Timeout`].
pub fn install_server(
    exec: &dyn Executor,
    bundle: &ArtifactBundle,
    opts: &InstallOptions,
) -> Result<(), InstallError> {
    if healthy(exec) {
        info!(host = exec.host(), "control plane already installed and ready");
        return Ok(());
    }

    cleanup_partial(exec, SERVER_UNINSTALL)?;
    confirm_artifacts(exec, bundle)?;

    info!(
        host = exec.host(),
        version = %bundle.version,
        mode = %bundle.mode,
        "installing control plane"
    );
    exec.execute_ok(&install_command(bundle, opts, "server"))?;

    poll_until(
        &format!("control plane ready on {}", exec.host()),
        opts.ready_timeout,
        READY_INTERVAL,
        || server_ready(exec).then_some(()),
    )?;

    info!(host = exec.host(), "control plane is ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use remote::ExecOutput;
    use std::path::Path;
    use std::sync::Mutex;

    /// Executor that answers from a script of (command substring, output)
    /// rules and records every command it sees.
    struct ScriptedExecutor {
        rules: Vec<(&'static str, ExecOutput)>,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedExecutor {
        fn new(rules: Vec<(&'static str, ExecOutput)>) -> Self {
            Self {
                rules,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn saw(&self, fragment: &str) -> bool {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .any(|c| c.contains(fragment))
        }
    }

    fn ok(stdout: &str) -> ExecOutput {
        ExecOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    fn fail() -> ExecOutput {
        ExecOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 1,
        }
    }

    impl Executor for ScriptedExecutor {
        fn host(&self) -> &str {
            "10.30.0.11"
        }

        fn execute(&self, cmd: &RemoteCommand) -> Result<ExecOutput, RemoteError> {
            let rendered = cmd.render();
            self.seen.lock().unwrap().push(rendered.clone());
            for (fragment, out) in &self.rules {
                if rendered.contains(fragment) {
                    return Ok(out.clone());
                }
            }
            Ok(fail())
        }

        fn copy(&self, _local: &Path, remote: &str, _mode: i32) -> Result<(), RemoteError> {
            self.seen.lock().unwrap().push(format!("copy {remote}"));
            Ok(())
        }
    }

    #[test]
    fn test_healthy_server_is_not_reinstalled() {
        let exec = ScriptedExecutor::new(vec![
            ("is-active k3s", ok("active\n")),
            ("--raw /readyz", ok("ok")),
        ]);
        let bundle = ArtifactBundle::online("v1.30.2+k3s1");
        let opts = InstallOptions::new("v1.30.2+k3s1");

        install_server(&exec, &bundle, &opts).unwrap();

        assert!(!exec.saw("k3s-install"));
        assert!(!exec.saw("curl"));
        assert!(!exec.saw("uninstall"));
    }

    #[test]
    fn test_partial_install_is_cleaned_before_reinstall() {
        let exec = ScriptedExecutor::new(vec![
            // Unit inactive, uninstall script present, install succeeds,
            // readiness comes up.
            ("test -x /usr/local/bin/k3s-uninstall.sh", ok("")),
            ("/usr/local/bin/k3s-uninstall.sh", ok("")),
            ("curl", ok("")),
            ("--raw /readyz", ok("ok")),
        ]);
        let bundle = ArtifactBundle::online("v1.30.2+k3s1");
        let opts = InstallOptions::new("v1.30.2+k3s1");

        install_server(&exec, &bundle, &opts).unwrap();

        assert!(exec.saw("sudo /usr/local/bin/k3s-uninstall.sh"));
        assert!(exec.saw("curl"));
    }

    #[test]
    fn test_readiness_window_expiry_is_a_timeout() {
        let exec = ScriptedExecutor::new(vec![("curl", ok(""))]);
        let bundle = ArtifactBundle::online("v1.30.2+k3s1");
        let opts =
            InstallOptions::new("v1.30.2+k3s1").with_ready_timeout(Duration::from_millis(50));

        let err = install_server(&exec, &bundle, &opts).unwrap_err();
        assert!(matches!(err, InstallError::Timeout(_)));
    }

    #[test]
    fn test_install_command_online_pins_version() {
        let bundle = ArtifactBundle::online("v1.30.2+k3s1");
        let opts = InstallOptions::new("v1.30.2+k3s1");
        let rendered = install_command(&bundle, &opts, "server").render();
        assert!(rendered.contains("INSTALL_K3S_VERSION='v1.30.2+k3s1'"));
        assert!(rendered.contains("sudo"));
        assert!(rendered.contains("$INSTALL_SCRIPT_URL"));
    }

    #[test]
    fn test_install_command_offline_skips_download() {
        let bundle = ArtifactBundle::offline("v1.30.2+k3s1", "/var/cache/forgelab/v1.30.2+k3s1");
        let opts = InstallOptions::new("v1.30.2+k3s1");
        let rendered = install_command(&bundle, &opts, "server").render();
        assert!(rendered.contains("INSTALL_K3S_SKIP_DOWNLOAD=true"));
        assert!(rendered.contains("/tmp/k3s-install.sh server"));
        assert!(!rendered.contains("curl"));
    }
}
