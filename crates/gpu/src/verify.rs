//! Allocatable verification and the probe workload.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use remote::{poll_until, Executor, RemoteCommand, RemoteError};
use tracing::{debug, info, warn};

use crate::policy::{GpuError, SharingPolicy};

/// Window for the device plugin rollout to surface the advertised counts.
pub const ALLOCATABLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Poll interval for allocatable queries.
const ALLOCATABLE_INTERVAL: Duration = Duration::from_secs(15);

/// Window for the probe pod to finish.
const PROBE_TIMEOUT: Duration = Duration::from_secs(300);

/// Poll interval for the probe pod phase.
const PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Probe workload image; a minimal CUDA sample.
pub const PROBE_IMAGE: &str = "nvcr.io/nvidia/k8s/cuda-sample:vectoradd-cuda12.5.0";

const PROBE_POD: &str = "forgelab-gpu-probe";

/// Query a node's advertised count for the shared resource.
///
/// # Errors
///
/// Returns an error only on transport failure; an absent resource reads as 0.
pub fn allocatable(
    exec: &dyn Executor,
    node: &str,
    resource: &str,
) -> Result<u64, RemoteError> {
    // Dots inside the resource key must be escaped for the jsonpath index.
    let escaped = resource.replace('.', "\\.");
    let jsonpath = format!("jsonpath={{.status.allocatable['{escaped}']}}");
    let out = exec.execute(
        &RemoteCommand::new("k3s")
            .args(["kubectl", "get", "node", node, "-o", &jsonpath])
            .sudo(),
    )?;

    if !out.success() {
        return Ok(0);
    }
    Ok(out.stdout.trim().parse().unwrap_or(0))
}

/// Poll until every targeted node advertises exactly the policy's replica
/// count.
///
/// # Errors
///
/// Returns [`GpuError::ResourceNotAdvertised`] for the first still-divergent
/// node once the window expires.
pub fn poll_allocatable(
    server: &dyn Executor,
    nodes: &[String],
    policy: &SharingPolicy,
    timeout: Duration,
) -> Result<(), GpuError> {
    info!(
        resource = policy.resource_name(),
        timeout_secs = timeout.as_secs(),
        "verifying advertised GPU resources"
    );

    let start = Instant::now();
    let mut divergent: Option<(String, u32, u64)> = None;

    let result = poll_until(
        &format!("{} advertised on all nodes", policy.resource_name()),
        timeout,
        ALLOCATABLE_INTERVAL,
        || {
            divergent = None;
            for node in nodes {
                let expected = policy.replicas_for(node);
                let actual = match allocatable(server, node, policy.resource_name()) {
                    Ok(n) => n,
                    Err(e) => {
                        debug!(node = %node, error = %e, "allocatable query failed");
                        divergent = Some((node.clone(), expected, 0));
                        return None;
                    }
                };
                if actual != u64::from(expected) {
                    debug!(node = %node, expected, actual, "count not converged");
                    divergent = Some((node.clone(), expected, actual));
                    return None;
                }
            }
            Some(())
        },
    );

    match result {
        Ok(()) => {
            info!(resource = policy.resource_name(), "all nodes advertise the policy count");
            Ok(())
        }
        Err(_) => {
            let (node, expected, actual) = divergent
                .unwrap_or_else(|| ("<none>".to_string(), policy.replicas(), 0));
            Err(GpuError::ResourceNotAdvertised {
                node,
                resource: policy.resource_name().to_string(),
                expected,
                actual,
                waited_secs: start.elapsed().as_secs(),
            })
        }
    }
}

/// Outcome of the GPU smoke test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The probe workload completed successfully.
    Passed,
    /// The probe did not complete; the cluster may still be usable.
    Failed(String),
}

impl ProbeOutcome {
    /// Whether the probe passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

fn render_probe_pod(resource: &str) -> String {
    format!(
        r"apiVersion: v1
kind: Pod
metadata:
  name: {PROBE_POD}
  namespace: default
spec:
  restartPolicy: Never
  runtimeClassName: nvidia
  containers:
    - name: vectoradd
      image: {PROBE_IMAGE}
      resources:
        limits:
          {resource}: 1
"
    )
}

/// Launch a minimal workload requesting one unit of the shared resource and
/// wait for it to complete.
///
/// A failure here is reported, never fatal: the probe only demonstrates that
/// a slice is schedulable end to end.
#[must_use]
pub fn run_probe(server: &dyn Executor, resource: &str) -> ProbeOutcome {
    match try_probe(server, resource) {
        Ok(()) => ProbeOutcome::Passed,
        Err(e) => {
            warn!(error = %e, "GPU probe failed");
            ProbeOutcome::Failed(e.to_string())
        }
    }
}

fn try_probe(server: &dyn Executor, resource: &str) -> Result<(), GpuError> {
    let pod_yaml = render_probe_pod(resource);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let local = std::env::temp_dir().join(format!("forgelab-probe-{nanos}.yaml"));
    std::fs::write(&local, pod_yaml).map_err(|e| {
        GpuError::Remote(RemoteError::LocalIo {
            path: local.clone(),
            source: e,
        })
    })?;

    let remote_path = "/tmp/forgelab-gpu-probe.yaml";
    let copied = server.copy(&local, remote_path, 0o644);
    let _ = std::fs::remove_file(&local);
    copied?;

    // Replace any leftover probe pod from a previous run.
    let _ = server.execute(
        &RemoteCommand::new("k3s")
            .args(["kubectl", "delete", "pod", PROBE_POD, "--ignore-not-found"])
            .sudo(),
    );
    server.execute_ok(
        &RemoteCommand::new("k3s")
            .args(["kubectl", "apply", "-f", remote_path])
            .sudo(),
    )?;

    info!(pod = PROBE_POD, "probe pod launched");

    let phase_cmd = RemoteCommand::new("k3s")
        .args([
            "kubectl",
            "get",
            "pod",
            PROBE_POD,
            "-o",
            "jsonpath={.status.phase}",
        ])
        .sudo();

    let outcome = poll_until(
        &format!("probe pod {PROBE_POD} completion"),
        PROBE_TIMEOUT,
        PROBE_INTERVAL,
        || match server.execute(&phase_cmd) {
            Ok(out) if out.success() => match out.stdout.trim() {
                "Succeeded" => Some(Ok(())),
                "Failed" => Some(Err(GpuError::Policy("probe pod failed".to_string()))),
                _ => None,
            },
            _ => None,
        },
    );

    // Best-effort cleanup either way.
    let _ = server.execute(
        &RemoteCommand::new("k3s")
            .args(["kubectl", "delete", "pod", PROBE_POD, "--ignore-not-found"])
            .sudo(),
    );

    outcome.map_err(GpuError::from)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use remote::ExecOutput;
    use std::path::Path;

    #[test]
    fn test_render_probe_pod_requests_one_unit() {
        let yaml = render_probe_pod("nvidia.com/gpu");
        assert!(yaml.contains("nvidia.com/gpu: 1"));
        assert!(yaml.contains(PROBE_IMAGE));
        assert!(yaml.contains("restartPolicy: Never"));
    }

    struct CannedExecutor {
        stdout: String,
    }

    impl Executor for CannedExecutor {
        fn host(&self) -> &str {
            "10.30.0.11"
        }

        fn execute(&self, _cmd: &RemoteCommand) -> Result<ExecOutput, RemoteError> {
            Ok(ExecOutput {
                stdout: self.stdout.clone(),
                stderr: String::new(),
                exit_code: 0,
            })
        }

        fn copy(&self, _local: &Path, _remote: &str, _mode: i32) -> Result<(), RemoteError> {
            Ok(())
        }
    }

    #[test]
    fn test_allocatable_parses_count() {
        let exec = CannedExecutor {
            stdout: "4".to_string(),
        };
        assert_eq!(allocatable(&exec, "lab-server", "nvidia.com/gpu").unwrap(), 4);
    }

    #[test]
    fn test_allocatable_absent_resource_reads_zero() {
        let exec = CannedExecutor {
            stdout: String::new(),
        };
        assert_eq!(allocatable(&exec, "lab-server", "nvidia.com/gpu").unwrap(), 0);
    }

    #[test]
    fn test_poll_allocatable_converged() {
        let exec = CannedExecutor {
            stdout: "4".to_string(),
        };
        let policy = SharingPolicy::new("nvidia.com/gpu", 4).unwrap();
        poll_allocatable(
            &exec,
            &["lab-server".to_string()],
            &policy,
            Duration::from_millis(100),
        )
        .unwrap();
    }

    #[test]
    fn test_poll_allocatable_mismatch_is_reported() {
        let exec = CannedExecutor {
            stdout: "1".to_string(),
        };
        let policy = SharingPolicy::new("nvidia.com/gpu", 4).unwrap();
        let err = poll_allocatable(
            &exec,
            &["lab-server".to_string()],
            &policy,
            Duration::from_millis(50),
        )
        .unwrap_err();

        match err {
            GpuError::ResourceNotAdvertised {
                node,
                expected,
                actual,
                ..
            } => {
                assert_eq!(node, "lab-server");
                assert_eq!(expected, 4);
                assert_eq!(actual, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
