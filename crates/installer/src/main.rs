//! Forge Lab deployment CLI.
//!
//! One command brings up a small GPU-enabled k3s cluster: it clones lab VMs
//! from a hypervisor template, installs the control plane and agents over
//! SSH (online or air-gapped), applies a GPU time-slicing policy, and
//! verifies the result. All operations are idempotent; re-running the same
//! command resumes from where it left off, and per-phase skip flags jump
//! past completed work.

#![allow(clippy::doc_markdown)]

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod config;
mod orchestrator;
mod phases;
mod records;
mod ui;

use config::{ArtifactMode, HypervisorConfig, LabConfig, NodeSizing, SkipFlags};
use orchestrator::Driver;

/// Parse a `node=replicas` override.
fn parse_gpu_override(s: &str) -> Result<(String, u32), String> {
    let (node, replicas) = s
        .split_once('=')
        .ok_or_else(|| format!("expected node=replicas, got '{s}'"))?;
    let replicas = replicas
        .parse()
        .map_err(|_| format!("bad replica count in '{s}'"))?;
    Ok((node.to_string(), replicas))
}

/// Forge Lab - GPU lab cluster provisioning.
#[derive(Parser)]
#[command(
    name = "forgelab",
    version,
    about = "Provision a GPU-enabled k3s lab cluster",
    long_about = "Provision a small GPU-enabled k3s cluster end to end.\n\n\
                  Clones lab VMs from a hypervisor template, installs the k3s\n\
                  server and agents over SSH (online or air-gapped), applies an\n\
                  NVIDIA time-slicing policy, and verifies the advertised GPU\n\
                  resources.\n\n\
                  All operations are idempotent - re-running the same command\n\
                  will resume from where it left off."
)]
struct Cli {
    // Hypervisor
    /// Hypervisor API URL (e.g. https://pve.lab:8006).
    #[arg(long, env = "PVE_URL")]
    pve_url: String,

    /// Hypervisor node hosting the lab VMs.
    #[arg(long, env = "PVE_NODE", default_value = "pve")]
    pve_node: String,

    /// Hypervisor API token ID (user@realm!tokenname).
    #[arg(long, env = "PVE_TOKEN_ID")]
    pve_token_id: String,

    /// Hypervisor API token secret.
    #[arg(long, env = "PVE_TOKEN_SECRET", hide_env_values = true)]
    pve_token_secret: String,

    /// Accept a self-signed hypervisor certificate.
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    pve_insecure_tls: bool,

    // Cluster shape
    /// Lab cluster name; node names derive from it.
    #[arg(long, default_value = "lab")]
    cluster_name: String,

    /// Template VM to clone nodes from.
    #[arg(long, default_value = "ubuntu-gpu-template")]
    template: String,

    /// Number of agent nodes.
    #[arg(long, default_value_t = 1)]
    agents: u8,

    /// CPU cores for the server VM.
    #[arg(long, default_value_t = 4)]
    server_cores: u32,

    /// Memory in MiB for the server VM.
    #[arg(long, default_value_t = 8192)]
    server_memory: u64,

    /// CPU cores for agent VMs.
    #[arg(long, default_value_t = 8)]
    agent_cores: u32,

    /// Memory in MiB for agent VMs.
    #[arg(long, default_value_t = 16384)]
    agent_memory: u64,

    /// Expected lab subnet prefix for guest address discovery.
    #[arg(long, default_value = "10.30.0.")]
    subnet_prefix: String,

    // Remote access
    /// SSH user on the lab nodes.
    #[arg(long, default_value = "ops")]
    ssh_user: String,

    /// SSH private key path (key auth; preferred).
    #[arg(long, env = "FORGELAB_SSH_KEY")]
    ssh_key: Option<PathBuf>,

    /// SSH password (only for templates without key access).
    #[arg(long, env = "FORGELAB_SSH_PASSWORD", hide_env_values = true)]
    ssh_password: Option<String>,

    // Cluster software
    /// Pinned k3s version.
    #[arg(long, default_value = "v1.30.2+k3s1")]
    k3s_version: String,

    /// Artifact mode: online, fetch, or prestaged.
    #[arg(long, default_value = "online")]
    artifacts: String,

    /// Bundle directory (cache for fetch mode, source for prestaged mode).
    #[arg(long, default_value = "/var/cache/forgelab")]
    bundle_dir: PathBuf,

    /// Private mirror base URL for release downloads.
    #[arg(long, env = "FORGELAB_MIRROR")]
    registry_mirror: Option<String>,

    // GPU sharing
    /// Shared GPU resource name.
    #[arg(long, default_value = "nvidia.com/gpu")]
    gpu_resource: String,

    /// Advertised replicas per physical GPU.
    #[arg(long, default_value_t = 4)]
    gpu_replicas: u32,

    /// Nodes carrying GPUs (defaults to every node).
    #[arg(long, value_delimiter = ',')]
    gpu_nodes: Vec<String>,

    /// Per-node replica override (node=replicas, repeatable).
    #[arg(long, value_parser = parse_gpu_override)]
    gpu_override: Vec<(String, u32)>,

    /// GPU driver mode: managed or preinstalled.
    #[arg(long, default_value = "preinstalled")]
    driver_mode: String,

    // Paths
    /// Output directory for the node address record.
    #[arg(long, default_value = "forgelab-state")]
    output_dir: PathBuf,

    // Resume
    /// Skip VM provisioning.
    #[arg(long, env = "SKIP_PROVISION")]
    skip_provision: bool,

    /// Skip node prerequisites.
    #[arg(long, env = "SKIP_PREREQS")]
    skip_prereqs: bool,

    /// Skip artifact staging.
    #[arg(long, env = "SKIP_STAGE")]
    skip_stage: bool,

    /// Skip the control-plane install.
    #[arg(long, env = "SKIP_CONTROL_PLANE")]
    skip_control_plane: bool,

    /// Skip agent installs.
    #[arg(long, env = "SKIP_AGENTS")]
    skip_agents: bool,

    /// Skip GPU configuration.
    #[arg(long, env = "SKIP_GPU")]
    skip_gpu: bool,

    // Modes
    /// Dry run: print planned actions, mutate nothing.
    #[arg(long, conflicts_with_all = ["verify", "destroy"])]
    check: bool,

    /// Read-only: report current cluster and GPU state.
    #[arg(long, conflicts_with = "destroy")]
    verify: bool,

    /// Tear down provisioned VMs by name.
    #[arg(long)]
    destroy: bool,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> Result<LabConfig> {
        let ssh = match (&self.ssh_key, &self.ssh_password) {
            (Some(key), _) => remote::SshAuth::key(&self.ssh_user, key),
            (None, Some(password)) => remote::SshAuth::password(&self.ssh_user, password),
            (None, None) => anyhow::bail!("either --ssh-key or --ssh-password is required"),
        };

        Ok(LabConfig {
            cluster_name: self.cluster_name,
            hypervisor: HypervisorConfig {
                url: self.pve_url,
                node: self.pve_node,
                token_id: self.pve_token_id,
                token_secret: self.pve_token_secret,
                insecure_tls: self.pve_insecure_tls,
            },
            template: self.template,
            agent_count: self.agents,
            server_sizing: NodeSizing {
                cores: self.server_cores,
                memory_mb: self.server_memory,
            },
            agent_sizing: NodeSizing {
                cores: self.agent_cores,
                memory_mb: self.agent_memory,
            },
            subnet_prefix: self.subnet_prefix,
            ssh,
            k3s_version: self.k3s_version,
            artifacts: self.artifacts.parse::<ArtifactMode>()?,
            bundle_dir: self.bundle_dir,
            registry_mirror: self.registry_mirror,
            gpu_resource: self.gpu_resource,
            gpu_replicas: self.gpu_replicas,
            gpu_nodes: self.gpu_nodes,
            gpu_overrides: self.gpu_override,
            driver_mode: self.driver_mode.parse()?,
            output_dir: self.output_dir,
            skip: SkipFlags {
                provision: self.skip_provision,
                prereqs: self.skip_prereqs,
                stage: self.skip_stage,
                control_plane: self.skip_control_plane,
                agents: self.skip_agents,
                gpu: self.skip_gpu,
            },
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("info,remote=debug,virt=debug,stager=debug,k3s=debug,gpu=debug")
    } else {
        EnvFilter::new("warn,installer=info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let check = cli.check;
    let verify = cli.verify;
    let destroy = cli.destroy;

    let config = cli.into_config()?;

    // Validate the GPU policy up front, before touching anything.
    config.sharing_policy()?;

    let mut driver = Driver::new(config)?;

    if check {
        driver.check();
        return Ok(());
    }
    if verify {
        return driver.verify().await;
    }
    if destroy {
        return driver.destroy().await;
    }

    driver.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gpu_override() {
        assert_eq!(
            parse_gpu_override("lab-agent1=8").unwrap(),
            ("lab-agent1".to_string(), 8)
        );
        assert!(parse_gpu_override("lab-agent1").is_err());
        assert!(parse_gpu_override("lab-agent1=lots").is_err());
    }
}
