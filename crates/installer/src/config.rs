//! Deployment configuration.
//!
//! One immutable configuration object, built once from the CLI and threaded
//! by reference through every component call. No component reads the
//! process environment.

use std::path::PathBuf;

use anyhow::Result;
use gpu::{DriverMode, SharingPolicy};
use k3s::{Node, NodeRole};
use remote::SshAuth;

/// How installer artifacts are acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactMode {
    /// Nodes download directly from the internet.
    Online,
    /// Download once on this (connected) host, then push to nodes.
    Fetch,
    /// Use an operator-transferred bundle directory; never fetch.
    PreStaged,
}

impl std::fmt::Display for ArtifactMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Fetch => write!(f, "fetch"),
            Self::PreStaged => write!(f, "prestaged"),
        }
    }
}

impl std::str::FromStr for ArtifactMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "online" => Ok(Self::Online),
            "fetch" => Ok(Self::Fetch),
            "prestaged" | "pre-staged" => Ok(Self::PreStaged),
            _ => Err(anyhow::anyhow!(
                "Unknown artifact mode: {s}. Supported: online, fetch, prestaged"
            )),
        }
    }
}

/// VM sizing for one node class.
#[derive(Debug, Clone, Copy)]
pub struct NodeSizing {
    /// CPU cores.
    pub cores: u32,
    /// Memory in MiB.
    pub memory_mb: u64,
}

/// Hypervisor connection settings.
#[derive(Clone)]
pub struct HypervisorConfig {
    /// API endpoint, e.g. `https://pve.lab:8006`.
    pub url: String,
    /// Hypervisor node hosting the lab VMs.
    pub node: String,
    /// API token ID (`user@realm!tokenname`).
    pub token_id: String,
    /// API token secret.
    pub token_secret: String,
    /// Accept a self-signed API certificate.
    pub insecure_tls: bool,
}

// The token secret stays out of debug output.
impl std::fmt::Debug for HypervisorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HypervisorConfig")
            .field("url", &self.url)
            .field("node", &self.node)
            .field("token_id", &self.token_id)
            .field("token_secret", &"[redacted]")
            .field("insecure_tls", &self.insecure_tls)
            .finish()
    }
}

/// Per-phase skip flags for resuming after partial failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipFlags {
    pub provision: bool,
    pub prereqs: bool,
    pub stage: bool,
    pub control_plane: bool,
    pub agents: bool,
    pub gpu: bool,
}

/// Full deployment configuration.
#[derive(Debug, Clone)]
pub struct LabConfig {
    // Cluster identity
    /// Name of the lab cluster; node names derive from it.
    pub cluster_name: String,

    // Infrastructure
    /// Hypervisor connection.
    pub hypervisor: HypervisorConfig,
    /// Template VM to clone lab nodes from.
    pub template: String,
    /// Number of agent nodes.
    pub agent_count: u8,
    /// Sizing for the server VM.
    pub server_sizing: NodeSizing,
    /// Sizing for agent VMs.
    pub agent_sizing: NodeSizing,
    /// Expected lab subnet prefix for guest address discovery
    /// (e.g. `10.30.0.`).
    pub subnet_prefix: String,

    // Remote access
    /// SSH credentials used on every node.
    pub ssh: SshAuth,

    // Cluster software
    /// Pinned k3s version.
    pub k3s_version: String,
    /// Artifact acquisition mode.
    pub artifacts: ArtifactMode,
    /// Bundle directory (cache for fetch mode, source for prestaged mode).
    pub bundle_dir: PathBuf,
    /// Optional private mirror for release downloads.
    pub registry_mirror: Option<String>,

    // GPU sharing
    /// Shared resource name.
    pub gpu_resource: String,
    /// Advertised replicas per physical GPU.
    pub gpu_replicas: u32,
    /// Nodes carrying GPUs (defaults to every node).
    pub gpu_nodes: Vec<String>,
    /// Per-node replica overrides (`node=replicas`).
    pub gpu_overrides: Vec<(String, u32)>,
    /// Driver handling mode.
    pub driver_mode: DriverMode,

    // Paths
    /// Output directory for the address record.
    pub output_dir: PathBuf,

    // Resume
    /// Per-phase skip flags.
    pub skip: SkipFlags,
}

impl LabConfig {
    /// The server node name.
    #[must_use]
    pub fn server_name(&self) -> String {
        format!("{}-server", self.cluster_name)
    }

    /// Agent node names.
    #[must_use]
    pub fn agent_names(&self) -> Vec<String> {
        (1..=self.agent_count)
            .map(|i| format!("{}-agent{i}", self.cluster_name))
            .collect()
    }

    /// All nodes for this deployment, server first, in `Unprovisioned`
    /// state.
    #[must_use]
    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes = vec![Node::new(self.server_name(), NodeRole::Server)];
        nodes.extend(
            self.agent_names()
                .into_iter()
                .map(|name| Node::new(name, NodeRole::Agent)),
        );
        nodes
    }

    /// Node names targeted by the GPU policy.
    #[must_use]
    pub fn gpu_node_names(&self) -> Vec<String> {
        if self.gpu_nodes.is_empty() {
            let mut names = vec![self.server_name()];
            names.extend(self.agent_names());
            names
        } else {
            self.gpu_nodes.clone()
        }
    }

    /// The GPU sharing policy this deployment applies.
    ///
    /// # Errors
    ///
    /// Returns an error if any replica count is invalid.
    pub fn sharing_policy(&self) -> Result<SharingPolicy> {
        let mut policy = SharingPolicy::new(&self.gpu_resource, self.gpu_replicas)?;
        for (node, replicas) in &self.gpu_overrides {
            policy = policy.with_node_override(node, *replicas)?;
        }
        Ok(policy)
    }

    /// Path of the flat key=value address record.
    #[must_use]
    pub fn records_path(&self) -> PathBuf {
        self.output_dir.join("nodes.env")
    }

    /// The API URL agents join through.
    #[must_use]
    pub fn server_join_url(&self, server_address: &str) -> String {
        format!("https://{server_address}:6443")
    }
}

/// Shared test fixture.
#[cfg(test)]
pub fn tests_config() -> LabConfig {
    LabConfig {
        cluster_name: "lab".into(),
        hypervisor: HypervisorConfig {
            url: "https://pve.lab:8006".into(),
            node: "pve".into(),
            token_id: "forgelab@pam!deploy".into(),
            token_secret: "secret".into(),
            insecure_tls: true,
        },
        template: "ubuntu-gpu-template".into(),
        agent_count: 2,
        server_sizing: NodeSizing {
            cores: 4,
            memory_mb: 8192,
        },
        agent_sizing: NodeSizing {
            cores: 8,
            memory_mb: 16384,
        },
        subnet_prefix: "10.30.0.".into(),
        ssh: SshAuth::key("ops", "/home/ops/.ssh/id_ed25519"),
        k3s_version: "v1.30.2+k3s1".into(),
        artifacts: ArtifactMode::Online,
        bundle_dir: "/var/cache/forgelab".into(),
        registry_mirror: None,
        gpu_resource: "nvidia.com/gpu".into(),
        gpu_replicas: 4,
        gpu_nodes: Vec::new(),
        gpu_overrides: Vec::new(),
        driver_mode: DriverMode::PreInstalled,
        output_dir: "/tmp/forgelab".into(),
        skip: SkipFlags::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LabConfig {
        super::tests_config()
    }

    #[test]
    fn test_node_names_derive_from_cluster() {
        let config = config();
        assert_eq!(config.server_name(), "lab-server");
        assert_eq!(config.agent_names(), vec!["lab-agent1", "lab-agent2"]);

        let nodes = config.nodes();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0].role, NodeRole::Server);
        assert_eq!(nodes[1].role, NodeRole::Agent);
    }

    #[test]
    fn test_gpu_nodes_default_to_all() {
        let config = config();
        assert_eq!(
            config.gpu_node_names(),
            vec!["lab-server", "lab-agent1", "lab-agent2"]
        );
    }

    #[test]
    fn test_artifact_mode_parsing() {
        assert_eq!("online".parse::<ArtifactMode>().unwrap(), ArtifactMode::Online);
        assert_eq!("fetch".parse::<ArtifactMode>().unwrap(), ArtifactMode::Fetch);
        assert_eq!(
            "pre-staged".parse::<ArtifactMode>().unwrap(),
            ArtifactMode::PreStaged
        );
        assert!("usb-stick".parse::<ArtifactMode>().is_err());
    }

    #[test]
    fn test_join_url() {
        assert_eq!(
            config().server_join_url("10.30.0.11"),
            "https://10.30.0.11:6443"
        );
    }
}
