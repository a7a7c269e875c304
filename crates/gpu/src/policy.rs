//! Declarative GPU sharing policy.

use std::collections::BTreeMap;

use remote::{PollTimeout, RemoteError};
use serde::Serialize;
use thiserror::Error;

/// Errors configuring or verifying GPU sharing.
#[derive(Debug, Error)]
pub enum GpuError {
    /// Invalid policy values.
    #[error("invalid GPU policy: {0}")]
    Policy(String),

    /// Transport failure.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// GPU drivers were required but are not usable on the node.
    #[error("no usable GPU driver on {host}: {reason}")]
    DriverMissing { host: String, reason: String },

    /// A node's advertised count never matched the policy in the window.
    /// Reported as a warning; the run completes degraded.
    #[error(
        "node {node} advertises {actual} x {resource}, expected {expected} (waited {waited_secs}s)"
    )]
    ResourceNotAdvertised {
        node: String,
        resource: String,
        expected: u32,
        actual: u64,
        waited_secs: u64,
    },

    /// Rendering the plugin configuration failed.
    #[error("cannot render plugin config: {0}")]
    Render(#[from] serde_yaml::Error),

    /// Readiness window expired.
    #[error(transparent)]
    Timeout(#[from] PollTimeout),
}

/// Declarative time-slicing policy: one value per resource name, applied
/// cluster-wide, with optional per-node replica overrides.
#[derive(Debug, Clone)]
pub struct SharingPolicy {
    resource_name: String,
    replicas: u32,
    per_node: BTreeMap<String, u32>,
}

impl SharingPolicy {
    /// Create a policy advertising `replicas` units of `resource_name` per
    /// physical device.
    ///
    /// # Errors
    ///
    /// Returns [`GpuError::Policy`] unless `replicas` is a positive integer.
    pub fn new(resource_name: impl Into<String>, replicas: u32) -> Result<Self, GpuError> {
        if replicas == 0 {
            return Err(GpuError::Policy("replicas must be at least 1".to_string()));
        }
        Ok(Self {
            resource_name: resource_name.into(),
            replicas,
            per_node: BTreeMap::new(),
        })
    }

    /// Override the replica count for one node.
    ///
    /// # Errors
    ///
    /// Returns [`GpuError::Policy`] unless `replicas` is a positive integer.
    pub fn with_node_override(
        mut self,
        node: impl Into<String>,
        replicas: u32,
    ) -> Result<Self, GpuError> {
        if replicas == 0 {
            return Err(GpuError::Policy("replicas must be at least 1".to_string()));
        }
        self.per_node.insert(node.into(), replicas);
        Ok(self)
    }

    /// The shared resource name (e.g. `nvidia.com/gpu`).
    #[must_use]
    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    /// The cluster-wide replica count.
    #[must_use]
    pub fn replicas(&self) -> u32 {
        self.replicas
    }

    /// The replica count a given node must advertise.
    #[must_use]
    pub fn replicas_for(&self, node: &str) -> u32 {
        self.per_node.get(node).copied().unwrap_or(self.replicas)
    }

    /// Nodes with explicit overrides, with their config key names.
    #[must_use]
    pub fn overrides(&self) -> &BTreeMap<String, u32> {
        &self.per_node
    }

    /// Render the device plugin's time-slicing configuration files, one per
    /// ConfigMap key: `default` plus one named config per override.
    ///
    /// # Errors
    ///
    /// Returns an error if YAML rendering fails.
    pub fn render_plugin_configs(&self) -> Result<BTreeMap<String, String>, GpuError> {
        let mut configs = BTreeMap::new();
        configs.insert("default".to_string(), self.render_one(self.replicas)?);
        for (node, replicas) in &self.per_node {
            configs.insert(override_key(node), self.render_one(*replicas)?);
        }
        Ok(configs)
    }

    fn render_one(&self, replicas: u32) -> Result<String, GpuError> {
        let config = PluginConfig {
            version: "v1",
            flags: Flags {
                mig_strategy: "none",
            },
            sharing: Sharing {
                time_slicing: TimeSlicing {
                    rename_by_default: false,
                    resources: vec![SharedResource {
                        name: &self.resource_name,
                        replicas,
                    }],
                },
            },
        };
        Ok(serde_yaml::to_string(&config)?)
    }
}

/// ConfigMap key holding a node's override config.
#[must_use]
pub fn override_key(node: &str) -> String {
    format!("node-{node}")
}

// Device plugin configuration file schema (the subset the lab drives).

#[derive(Serialize)]
struct PluginConfig<'a> {
    version: &'a str,
    flags: Flags<'a>,
    sharing: Sharing<'a>,
}

#[derive(Serialize)]
struct Flags<'a> {
    #[serde(rename = "migStrategy")]
    mig_strategy: &'a str,
}

#[derive(Serialize)]
struct Sharing<'a> {
    #[serde(rename = "timeSlicing")]
    time_slicing: TimeSlicing<'a>,
}

#[derive(Serialize)]
struct TimeSlicing<'a> {
    #[serde(rename = "renameByDefault")]
    rename_by_default: bool,
    resources: Vec<SharedResource<'a>>,
}

#[derive(Serialize)]
struct SharedResource<'a> {
    name: &'a str,
    replicas: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_replicas_rejected() {
        let err = SharingPolicy::new("nvidia.com/gpu", 0).unwrap_err();
        assert!(matches!(err, GpuError::Policy(_)));

        let err = SharingPolicy::new("nvidia.com/gpu", 4)
            .unwrap()
            .with_node_override("lab-agent1", 0)
            .unwrap_err();
        assert!(matches!(err, GpuError::Policy(_)));
    }

    #[test]
    fn test_replica_counts_honored_exactly() {
        for replicas in [1, 2, 4, 8] {
            let policy = SharingPolicy::new("nvidia.com/gpu", replicas).unwrap();
            let rendered = &policy.render_plugin_configs().unwrap()["default"];
            assert!(rendered.contains(&format!("replicas: {replicas}")));
            assert!(rendered.contains("name: nvidia.com/gpu"));
            assert!(rendered.contains("timeSlicing"));
        }
    }

    #[test]
    fn test_node_override_adds_named_config() {
        let policy = SharingPolicy::new("nvidia.com/gpu", 4)
            .unwrap()
            .with_node_override("lab-agent1", 8)
            .unwrap();

        assert_eq!(policy.replicas_for("lab-server"), 4);
        assert_eq!(policy.replicas_for("lab-agent1"), 8);

        let configs = policy.render_plugin_configs().unwrap();
        assert_eq!(configs.len(), 2);
        assert!(configs["node-lab-agent1"].contains("replicas: 8"));
        assert!(configs["default"].contains("replicas: 4"));
    }
}
