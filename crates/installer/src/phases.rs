//! The explicit, ordered deployment phase list.
//!
//! Each phase carries a skip flag (for resuming after partial failure) and
//! an idempotency predicate evaluated by the driver before execution. The
//! dependency order is fixed: later phases consume outputs of earlier ones
//! (addresses, the staged bundle, the join token, control-plane readiness).

use crate::config::{ArtifactMode, LabConfig};

/// One deployment phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Clone VMs from the template and discover their addresses.
    Provision,
    /// Wait for SSH, set hostnames, prepare base tooling.
    Prerequisites,
    /// Acquire and verify the installer bundle (offline modes only).
    StageArtifacts,
    /// Install the control-plane role on the server node.
    InstallControlPlane,
    /// Fetch the join token and install agents.
    InstallAgents,
    /// Apply the GPU time-slicing policy and device plugin.
    ConfigureGpu,
    /// Confirm node readiness and advertised resources; report.
    Verify,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Self; 7] = [
        Self::Provision,
        Self::Prerequisites,
        Self::StageArtifacts,
        Self::InstallControlPlane,
        Self::InstallAgents,
        Self::ConfigureGpu,
        Self::Verify,
    ];

    /// Human-readable title.
    #[must_use]
    pub fn title(&self) -> &'static str {
        match self {
            Self::Provision => "Provision lab VMs",
            Self::Prerequisites => "Node prerequisites",
            Self::StageArtifacts => "Stage installer artifacts",
            Self::InstallControlPlane => "Install control plane",
            Self::InstallAgents => "Install agents",
            Self::ConfigureGpu => "Configure GPU sharing",
            Self::Verify => "Verify cluster",
        }
    }

    /// Whether the operator's skip flags exclude this phase.
    #[must_use]
    pub fn skipped(&self, config: &LabConfig) -> bool {
        match self {
            Self::Provision => config.skip.provision,
            Self::Prerequisites => config.skip.prereqs,
            Self::StageArtifacts => config.skip.stage,
            Self::InstallControlPlane => config.skip.control_plane,
            Self::InstallAgents => config.skip.agents,
            Self::ConfigureGpu => config.skip.gpu,
            Self::Verify => false,
        }
    }

    /// Planned actions for dry-run output. Nothing here mutates anything.
    #[must_use]
    pub fn plan(&self, config: &LabConfig) -> Vec<String> {
        match self {
            Self::Provision => {
                let mut actions = vec![format!(
                    "clone '{}' -> '{}' ({} cores, {} MiB) unless it exists",
                    config.template,
                    config.server_name(),
                    config.server_sizing.cores,
                    config.server_sizing.memory_mb,
                )];
                for agent in config.agent_names() {
                    actions.push(format!(
                        "clone '{}' -> '{agent}' ({} cores, {} MiB) unless it exists",
                        config.template, config.agent_sizing.cores, config.agent_sizing.memory_mb,
                    ));
                }
                actions.push(format!(
                    "discover guest addresses on subnet {} and record them in {}",
                    config.subnet_prefix,
                    config.records_path().display(),
                ));
                actions
            }
            Self::Prerequisites => vec![
                "wait for SSH on every node (180s window)".to_string(),
                "set hostnames to match node names".to_string(),
            ],
            Self::StageArtifacts => match config.artifacts {
                ArtifactMode::Online => {
                    vec!["nothing to stage: nodes fetch directly".to_string()]
                }
                ArtifactMode::Fetch => vec![format!(
                    "download and verify k3s {} into {}",
                    config.k3s_version,
                    config.bundle_dir.display(),
                )],
                ArtifactMode::PreStaged => vec![format!(
                    "verify pre-staged bundle in {}",
                    config.bundle_dir.display(),
                )],
            },
            Self::InstallControlPlane => vec![format!(
                "install k3s {} server on '{}' unless already healthy, then wait for /readyz",
                config.k3s_version,
                config.server_name(),
            )],
            Self::InstallAgents => {
                if config.agent_count == 0 {
                    vec!["no agents configured".to_string()]
                } else {
                    let mut actions =
                        vec!["fetch join token from the control plane".to_string()];
                    for agent in config.agent_names() {
                        actions.push(format!(
                            "install k3s agent on '{agent}' and wait for Ready (150s window)"
                        ));
                    }
                    actions
                }
            }
            Self::ConfigureGpu => vec![
                format!(
                    "apply time-slicing policy: {} x{} ({} driver mode)",
                    config.gpu_resource, config.gpu_replicas, config.driver_mode,
                ),
                format!(
                    "wait until {:?} advertise the configured count (600s window)",
                    config.gpu_node_names(),
                ),
            ],
            Self::Verify => vec![
                "query node readiness and advertised GPU resources".to_string(),
                "run the GPU probe workload (failure is non-fatal)".to_string(),
                "print the deployment summary".to_string(),
            ],
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.title())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order_is_fixed() {
        assert_eq!(Phase::ALL[0], Phase::Provision);
        assert_eq!(Phase::ALL[3], Phase::InstallControlPlane);
        assert_eq!(Phase::ALL[4], Phase::InstallAgents);
        assert_eq!(Phase::ALL.last(), Some(&Phase::Verify));
        // Artifacts are staged before the control-plane install consumes
        // the bundle.
        let stage = Phase::ALL.iter().position(|p| *p == Phase::StageArtifacts);
        let cp = Phase::ALL
            .iter()
            .position(|p| *p == Phase::InstallControlPlane);
        assert!(stage < cp);
    }

    #[test]
    fn test_verify_cannot_be_skipped() {
        let mut config = crate::config::tests_config();
        config.skip.provision = true;
        config.skip.gpu = true;

        assert!(Phase::Provision.skipped(&config));
        assert!(Phase::ConfigureGpu.skipped(&config));
        assert!(!Phase::Verify.skipped(&config));
    }
}
