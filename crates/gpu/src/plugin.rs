//! Device plugin installation.
//!
//! Renders the time-slicing ConfigMap and the device plugin DaemonSet and
//! drops them into the cluster's manifest auto-deploy directory on the
//! server node. The deploy controller applies them; no package manager or
//! chart tooling is needed on the operator host, and the same path works
//! air-gapped.

use std::time::{SystemTime, UNIX_EPOCH};

use remote::{Executor, RemoteCommand};
use tracing::{debug, info};

use crate::policy::{override_key, GpuError, SharingPolicy};

/// Device plugin image; staged in the air-gap bundle for offline sites.
pub const PLUGIN_IMAGE: &str = "nvcr.io/nvidia/k8s-device-plugin:v0.16.2";

/// Node label the plugin's config manager selects per-node configs by.
pub const CONFIG_LABEL: &str = "nvidia.com/device-plugin.config";

/// Manifest auto-deploy directory on the server node.
const MANIFEST_DIR: &str = "/var/lib/rancher/k3s/server/manifests";

/// Staged manifest path before it is moved into place.
const TMP_MANIFEST: &str = "/tmp/forgelab-nvidia-device-plugin.yaml";

/// Whether GPU drivers are managed by the lab or assumed present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverMode {
    /// Install driver packages and the container toolkit via the OS package
    /// manager before deploying the plugin.
    Managed,
    /// Drivers ship with the VM template; only verify them.
    PreInstalled,
}

impl std::fmt::Display for DriverMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Managed => write!(f, "managed"),
            Self::PreInstalled => write!(f, "preinstalled"),
        }
    }
}

impl std::str::FromStr for DriverMode {
    type Err = GpuError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "managed" => Ok(Self::Managed),
            "preinstalled" | "pre-installed" => Ok(Self::PreInstalled),
            _ => Err(GpuError::Policy(format!(
                "unknown driver mode: {s}. Supported: managed, preinstalled"
            ))),
        }
    }
}

/// Driver packages installed in managed mode.
const DRIVER_PACKAGES: &[&str] = &["nvidia-driver-550-server", "nvidia-container-toolkit"];

/// Make GPU drivers usable on a node according to the mode.
fn ensure_driver(exec: &dyn Executor, mode: DriverMode) -> Result<(), GpuError> {
    match mode {
        DriverMode::Managed => {
            info!(host = exec.host(), "installing GPU driver packages");
            exec.execute_ok(
                &RemoteCommand::new("apt-get")
                    .arg("update")
                    .env("DEBIAN_FRONTEND", "noninteractive")
                    .sudo(),
            )?;
            exec.execute_ok(
                &RemoteCommand::new("apt-get")
                    .args(["install", "-y"])
                    .args(DRIVER_PACKAGES.iter().copied())
                    .env("DEBIAN_FRONTEND", "noninteractive")
                    .sudo(),
            )?;
        }
        DriverMode::PreInstalled => {
            debug!(host = exec.host(), "verifying pre-installed GPU driver");
            let out = exec.execute(&RemoteCommand::new("nvidia-smi").arg("-L"))?;
            if !out.success() {
                return Err(GpuError::DriverMissing {
                    host: exec.host().to_string(),
                    reason: out.stderr.trim().to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Render the ConfigMap + DaemonSet manifest for the policy.
fn render_manifest(policy: &SharingPolicy) -> Result<String, GpuError> {
    let configs = policy.render_plugin_configs()?;

    let mut config_entries = String::new();
    for (key, body) in &configs {
        config_entries.push_str(&format!("  {key}: |\n"));
        for line in body.lines() {
            config_entries.push_str(&format!("    {line}\n"));
        }
    }

    Ok(format!(
        r"apiVersion: v1
kind: ConfigMap
metadata:
  name: nvidia-device-plugin-config
  namespace: kube-system
data:
{config_entries}---
apiVersion: apps/v1
kind: DaemonSet
metadata:
  name: nvidia-device-plugin
  namespace: kube-system
spec:
  selector:
    matchLabels:
      name: nvidia-device-plugin
  updateStrategy:
    type: RollingUpdate
  template:
    metadata:
      labels:
        name: nvidia-device-plugin
    spec:
      runtimeClassName: nvidia
      priorityClassName: system-node-critical
      tolerations:
        - key: nvidia.com/gpu
          operator: Exists
          effect: NoSchedule
      shareProcessNamespace: true
      containers:
        - name: nvidia-device-plugin
          image: {PLUGIN_IMAGE}
          command: [nvidia-device-plugin]
          env:
            - name: CONFIG_FILE
              value: /config/config.yaml
          securityContext:
            allowPrivilegeEscalation: false
            capabilities:
              drop: [ALL]
          volumeMounts:
            - name: device-plugin
              mountPath: /var/lib/kubelet/device-plugins
            - name: config
              mountPath: /config
        - name: config-manager
          image: {PLUGIN_IMAGE}
          command: [config-manager]
          env:
            - name: ONESHOT
              value: 'false'
            - name: NODE_NAME
              valueFrom:
                fieldRef:
                  fieldPath: spec.nodeName
            - name: NODE_LABEL
              value: {CONFIG_LABEL}
            - name: CONFIG_FILE_SRCDIR
              value: /available-configs
            - name: CONFIG_FILE_DST
              value: /config/config.yaml
            - name: DEFAULT_CONFIG
              value: default
            - name: FALLBACK_STRATEGIES
              value: named,single
            - name: SEND_SIGNAL
              value: 'true'
            - name: SIGNAL
              value: '1'
            - name: PROCESS_TO_SIGNAL
              value: nvidia-device-plugin
          volumeMounts:
            - name: available-configs
              mountPath: /available-configs
            - name: config
              mountPath: /config
      volumes:
        - name: device-plugin
          hostPath:
            path: /var/lib/kubelet/device-plugins
        - name: available-configs
          configMap:
            name: nvidia-device-plugin-config
        - name: config
          emptyDir: {{}}
"
    ))
}

/// Apply the sharing policy to the cluster.
///
/// Prepares drivers per `mode`, labels override nodes so the config manager
/// picks their named config, and installs/updates the device plugin through
/// the manifest auto-deploy directory. Idempotent: re-applying the same
/// policy rewrites the same manifest.
///
/// # Errors
///
/// Returns a [`GpuError`] on driver, render, or delivery failure.
pub fn apply(
    server: &dyn Executor,
    gpu_nodes: &[&dyn Executor],
    policy: &SharingPolicy,
    mode: DriverMode,
) -> Result<(), GpuError> {
    for exec in gpu_nodes {
        ensure_driver(*exec, mode)?;
    }

    for (node, _) in policy.overrides() {
        server.execute_ok(
            &RemoteCommand::new("k3s")
                .args([
                    "kubectl",
                    "label",
                    "node",
                    node,
                    &format!("{CONFIG_LABEL}={}", override_key(node)),
                    "--overwrite",
                ])
                .sudo(),
        )?;
    }

    let manifest = render_manifest(policy)?;
    let local = stage_local_manifest(&manifest)?;
    server.copy(&local, TMP_MANIFEST, 0o644)?;
    let _ = std::fs::remove_file(&local);

    server.execute_ok(&RemoteCommand::new("mkdir").args(["-p", MANIFEST_DIR]).sudo())?;
    server.execute_ok(
        &RemoteCommand::new("mv")
            .args([TMP_MANIFEST, &format!("{MANIFEST_DIR}/nvidia-device-plugin.yaml")])
            .sudo(),
    )?;

    info!(
        resource = policy.resource_name(),
        replicas = policy.replicas(),
        "time-slicing policy applied"
    );
    Ok(())
}

/// Write the rendered manifest to a local temp file for transfer.
fn stage_local_manifest(manifest: &str) -> Result<std::path::PathBuf, GpuError> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let path = std::env::temp_dir().join(format!("forgelab-gpu-{nanos}.yaml"));
    std::fs::write(&path, manifest).map_err(|e| {
        GpuError::Remote(remote::RemoteError::LocalIo {
            path: path.clone(),
            source: e,
        })
    })?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_manifest_carries_policy() {
        let policy = SharingPolicy::new("nvidia.com/gpu", 4).unwrap();
        let manifest = render_manifest(&policy).unwrap();

        assert!(manifest.contains("kind: ConfigMap"));
        assert!(manifest.contains("kind: DaemonSet"));
        assert!(manifest.contains("replicas: 4"));
        assert!(manifest.contains(PLUGIN_IMAGE));
        assert!(manifest.contains("runtimeClassName: nvidia"));
        // ConfigMap body is indented under the `default` key.
        assert!(manifest.contains("  default: |"));
    }

    #[test]
    fn test_render_manifest_includes_override_configs() {
        let policy = SharingPolicy::new("nvidia.com/gpu", 2)
            .unwrap()
            .with_node_override("lab-agent1", 8)
            .unwrap();
        let manifest = render_manifest(&policy).unwrap();

        assert!(manifest.contains("  node-lab-agent1: |"));
        assert!(manifest.contains("replicas: 8"));
    }

    #[test]
    fn test_driver_mode_parsing() {
        assert_eq!("managed".parse::<DriverMode>().unwrap(), DriverMode::Managed);
        assert_eq!(
            "pre-installed".parse::<DriverMode>().unwrap(),
            DriverMode::PreInstalled
        );
        assert!("bare".parse::<DriverMode>().is_err());
    }
}
