//! Deployment orchestration.
//!
//! The driver owns the node set and walks the phase list in dependency
//! order. Every phase checks its idempotency predicate first, so a rerun
//! after partial failure only performs the missing work. Fatal errors abort
//! the run and dump the current node states; degradations (an agent that
//! never reports Ready, a GPU count that never converges, a failed probe)
//! are warnings and the run completes.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use gpu::{ProbeOutcome, SharingPolicy};
use k3s::{InstallOptions, Node, NodeRole, NodeState};
use remote::{wait_for_reachable, Executor, RemoteCommand, SshSession, SSH_PORT};
use stager::{ArtifactBundle, ArtifactSource, NetworkFetch, NodeDirect, PreStaged};
use virt::{
    discover_address, ensure_power_off, ensure_power_on, provision, CloneRequest, Hypervisor,
    Proxmox,
};

use crate::config::{ArtifactMode, LabConfig};
use crate::phases::Phase;
use crate::records::Records;
use crate::ui;

/// Window for SSH to come up on a freshly provisioned node.
const SSH_REACHABLE_TIMEOUT: Duration = Duration::from_secs(180);

/// Poll interval for SSH reachability.
const SSH_REACHABLE_INTERVAL: Duration = Duration::from_secs(5);

/// Window for guest address discovery.
const DISCOVER_TIMEOUT_SECS: u64 = 300;

/// Poll interval for guest address discovery.
const DISCOVER_INTERVAL_SECS: u64 = 10;

/// The deployment driver.
pub struct Driver {
    config: LabConfig,
    hv: Box<dyn Hypervisor>,
    /// Server first, then agents. Owned here; phases mutate through the
    /// driver only.
    nodes: Vec<Node>,
    records: Records,
    /// Bundle produced by the staging phase, if any.
    bundle: Option<ArtifactBundle>,
}

impl Driver {
    /// Create a driver against the configured hypervisor, restoring any
    /// previously recorded node addresses.
    ///
    /// # Errors
    ///
    /// Returns an error if the hypervisor client cannot be built or the
    /// record file is unreadable.
    pub fn new(config: LabConfig) -> Result<Self> {
        let hv = Proxmox::new(
            &config.hypervisor.url,
            &config.hypervisor.node,
            &config.hypervisor.token_id,
            &config.hypervisor.token_secret,
            config.hypervisor.insecure_tls,
        )
        .context("Failed to create hypervisor client")?;

        Self::with_hypervisor(config, Box::new(hv))
    }

    /// Create a driver with an explicit hypervisor (test seam).
    ///
    /// # Errors
    ///
    /// Returns an error if the record file is unreadable.
    pub fn with_hypervisor(config: LabConfig, hv: Box<dyn Hypervisor>) -> Result<Self> {
        let records = Records::load(config.records_path())?;

        let mut nodes = config.nodes();
        for node in &mut nodes {
            if let Some(address) = records.address(&node.name) {
                node.address = Some(address.to_string());
            }
        }

        Ok(Self {
            config,
            hv,
            nodes,
            records,
            bundle: None,
        })
    }

    /// The current node set (server first).
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    // --- Mode entry points ---

    /// Run the full deployment.
    ///
    /// # Errors
    ///
    /// Returns an error on the first fatal failure; node states are dumped
    /// and the partial state stays resumable via skip flags.
    pub async fn run(&mut self) -> Result<()> {
        ui::print_banner();

        let total = Phase::ALL.len();
        for (i, phase) in Phase::ALL.iter().enumerate() {
            ui::print_phase(i + 1, total, phase.title());

            if phase.skipped(&self.config) {
                ui::print_warning("skipped by flag");
                continue;
            }

            match self.satisfied(*phase).await {
                Ok(true) => {
                    ui::print_info("already satisfied, skipping");
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(phase = %phase, error = %e, "predicate check failed, executing phase");
                }
            }

            if let Err(e) = self.execute(*phase).await {
                ui::print_error(&format!("{} failed: {e:#}", phase.title()));
                self.dump_states();
                return Err(e).with_context(|| format!("Phase '{}' failed", phase.title()));
            }
        }

        Ok(())
    }

    /// Dry run: print what each phase would do, mutate nothing.
    pub fn check(&self) {
        ui::print_banner();
        ui::print_step("Dry run: planned actions");
        ui::print_kv("cluster", &self.config.cluster_name);
        ui::print_kv("k3s version", &self.config.k3s_version);
        ui::print_kv("artifacts", &self.config.artifacts.to_string());
        ui::print_kv(
            "gpu policy",
            &format!("{} x{}", self.config.gpu_resource, self.config.gpu_replicas),
        );

        let total = Phase::ALL.len();
        for (i, phase) in Phase::ALL.iter().enumerate() {
            ui::print_phase(i + 1, total, phase.title());
            if phase.skipped(&self.config) {
                ui::print_warning("skipped by flag");
                continue;
            }
            for action in phase.plan(&self.config) {
                ui::print_planned(&action);
            }
        }
        println!();
        ui::print_info("No changes were made.");
    }

    /// Read-only status report of the cluster and GPU state.
    ///
    /// # Errors
    ///
    /// Returns an error if no deployment record exists or queries fail.
    pub async fn verify(&mut self) -> Result<()> {
        ui::print_banner();
        ui::print_step("Verifying cluster state (read-only)");

        let server = self.server_session()?;

        match k3s::installed_version(&server)? {
            Some(version) => ui::print_kv("k3s version", &version),
            None => {
                ui::print_warning("k3s is not installed on the server node");
                return Ok(());
            }
        }

        let policy = self.config.sharing_policy()?;
        let mut rows = Vec::new();
        for node in &self.nodes {
            let ready = k3s::node_ready(&server, &node.name).unwrap_or(false);
            let advertised = gpu::verify::allocatable(&server, &node.name, policy.resource_name())
                .unwrap_or(0);
            rows.push(vec![
                node.name.clone(),
                node.role.to_string(),
                node.address.clone().unwrap_or_else(|| "-".to_string()),
                if ready { "Ready".to_string() } else { "NotReady".to_string() },
                format!("{advertised} x {}", policy.resource_name()),
            ]);
        }

        println!();
        ui::print_table(&["NODE", "ROLE", "ADDRESS", "STATUS", "GPU ALLOCATABLE"], &rows);
        Ok(())
    }

    /// Tear down every provisioned VM by name and drop the address record.
    ///
    /// # Errors
    ///
    /// Returns an error if a VM cannot be destroyed.
    pub async fn destroy(&mut self) -> Result<()> {
        ui::print_banner();
        ui::print_step("Destroying lab VMs");

        for node in &self.nodes {
            match self.hv.find_vm(&node.name).await? {
                Some(vm) => {
                    if let Err(e) = ensure_power_off(self.hv.as_ref(), &vm).await {
                        warn!(vm = %vm.name, error = %e, "power off failed, destroying anyway");
                    }
                    self.hv.destroy(&vm).await?;
                    ui::print_success(&format!("destroyed {}", node.name));
                }
                None => {
                    ui::print_info(&format!("{} does not exist", node.name));
                }
            }
        }

        self.records.remove()?;
        ui::print_success("address record removed");
        Ok(())
    }

    // --- Phase predicates ---

    /// Whether the phase's desired end state already holds.
    async fn satisfied(&mut self, phase: Phase) -> Result<bool> {
        match phase {
            Phase::Provision => Ok(self.nodes.iter().all(|n| n.address.is_some())),

            // The operations are cheap and individually idempotent; always run.
            Phase::Prerequisites => Ok(false),

            Phase::StageArtifacts => Ok(self.config.artifacts == ArtifactMode::Online),

            Phase::InstallControlPlane => {
                if self.nodes[0].address.is_none() {
                    return Ok(false);
                }
                let server = self.server_session()?;
                if k3s::healthy(&server) {
                    self.advance_node(0, NodeState::Bootstrapped)?;
                    return Ok(true);
                }
                Ok(false)
            }

            Phase::InstallAgents => {
                if self.config.agent_count == 0 {
                    return Ok(true);
                }
                if !self.nodes[0].has_reached(NodeState::Bootstrapped) {
                    return Ok(false);
                }
                let server = self.server_session()?;
                let mut all_ready = true;
                for i in 1..self.nodes.len() {
                    let name = self.nodes[i].name.clone();
                    if k3s::node_ready(&server, &name)? {
                        self.advance_node(i, NodeState::Ready)?;
                    } else {
                        all_ready = false;
                    }
                }
                Ok(all_ready)
            }

            Phase::ConfigureGpu => {
                if !self.nodes[0].has_reached(NodeState::Bootstrapped) {
                    return Ok(false);
                }
                let server = self.server_session()?;
                let policy = self.config.sharing_policy()?;
                for node in self.config.gpu_node_names() {
                    let actual =
                        gpu::verify::allocatable(&server, &node, policy.resource_name())?;
                    if actual != u64::from(policy.replicas_for(&node)) {
                        return Ok(false);
                    }
                }
                Ok(true)
            }

            Phase::Verify => Ok(false),
        }
    }

    // --- Phase execution ---

    async fn execute(&mut self, phase: Phase) -> Result<()> {
        info!(phase = %phase, "executing phase");
        match phase {
            Phase::Provision => self.provision_nodes().await,
            Phase::Prerequisites => self.node_prerequisites(),
            Phase::StageArtifacts => self.stage_artifacts().await,
            Phase::InstallControlPlane => self.install_control_plane(),
            Phase::InstallAgents => self.install_agents(),
            Phase::ConfigureGpu => self.configure_gpu(),
            Phase::Verify => self.verify_deployment(),
        }
    }

    async fn provision_nodes(&mut self) -> Result<()> {
        for i in 0..self.nodes.len() {
            let node = self.nodes[i].clone();
            let sizing = match node.role {
                NodeRole::Server => self.config.server_sizing,
                NodeRole::Agent => self.config.agent_sizing,
            };

            self.advance_node(i, NodeState::Provisioning)?;

            let req = CloneRequest::new(&self.config.template, &node.name)
                .with_cores(sizing.cores)
                .with_memory_mb(sizing.memory_mb);

            let vm = provision(self.hv.as_ref(), &req)
                .await
                .with_context(|| format!("Failed to provision {}", node.name))?;
            ensure_power_on(self.hv.as_ref(), &vm)
                .await
                .with_context(|| format!("Failed to power on {}", node.name))?;

            let address = if let Some(address) = node.address {
                address
            } else {
                let address = discover_address(
                    self.hv.as_ref(),
                    &vm,
                    &self.config.subnet_prefix,
                    DISCOVER_TIMEOUT_SECS,
                    DISCOVER_INTERVAL_SECS,
                )
                .await
                .with_context(|| format!("No guest address observed for {}", node.name))?;
                ui::print_success(&format!("{} is at {address}", node.name));
                address
            };

            self.nodes[i].address = Some(address.clone());
            let record_node = self.nodes[i].clone();
            self.records.set_node(&record_node, &address);
            self.records.save()?;
        }

        ui::print_kv("address record", &self.records.path().display().to_string());
        Ok(())
    }

    fn node_prerequisites(&mut self) -> Result<()> {
        for i in 0..self.nodes.len() {
            let node = self.nodes[i].clone();
            let address = node
                .address
                .as_deref()
                .with_context(|| format!("No address for {}", node.name))?;

            ui::print_step(&format!("preparing {} ({address})", node.name));
            wait_for_reachable(
                address,
                SSH_PORT,
                SSH_REACHABLE_TIMEOUT,
                SSH_REACHABLE_INTERVAL,
            )
            .with_context(|| format!("{} never became reachable over SSH", node.name))?;

            let session = self.session(&node)?;
            session.execute_ok(
                &RemoteCommand::new("hostnamectl")
                    .args(["set-hostname", &node.name])
                    .sudo(),
            )?;

            if self.config.artifacts == ArtifactMode::Online {
                // The online install path needs curl on the node.
                session.execute_ok(
                    &RemoteCommand::new("sh")
                        .args([
                            "-c",
                            "command -v curl >/dev/null 2>&1 || \
                             (apt-get update && apt-get install -y curl)",
                        ])
                        .env("DEBIAN_FRONTEND", "noninteractive")
                        .sudo(),
                )?;
            }

            self.advance_node(i, NodeState::NetworkReady)?;
        }
        Ok(())
    }

    async fn stage_artifacts(&mut self) -> Result<()> {
        let source = self.artifact_source()?;
        ui::print_step(&format!(
            "staging k3s {} ({})",
            source.version(),
            source.mode()
        ));

        // An integrity failure here is fatal: the bundle is never loaded.
        let bundle = source
            .stage()
            .await
            .context("Artifact staging failed")?;
        self.bundle = Some(bundle);
        Ok(())
    }

    fn install_control_plane(&mut self) -> Result<()> {
        let node = self.nodes[0].clone();
        let session = self.session(&node)?;
        let bundle = self.current_bundle();
        let opts = self.install_options();

        if let Err(e) = k3s::install_server(&session, &bundle, &opts) {
            self.nodes[0].fail();
            return Err(e).context("Control-plane installation failed");
        }

        self.advance_node(0, NodeState::Bootstrapped)?;
        ui::print_success(&format!("control plane ready on {}", node.name));
        Ok(())
    }

    fn install_agents(&mut self) -> Result<()> {
        if self.config.agent_count == 0 {
            return Ok(());
        }

        let server_node = self.nodes[0].clone();
        let server_session = self.session(&server_node)?;
        let server_address = server_node
            .address
            .as_deref()
            .context("Server address missing")?;
        let join_url = self.config.server_join_url(server_address);

        // Hard synchronization barrier: no agent install before the token.
        let token = k3s::join_token(&server_session, &server_node)
            .context("Join token retrieval failed")?;

        let bundle = self.current_bundle();
        let opts = self.install_options();

        for i in 1..self.nodes.len() {
            let node = self.nodes[i].clone();
            if node.has_reached(NodeState::Ready) {
                continue;
            }

            self.advance_node(i, NodeState::AgentInstalling)?;
            let session = self.session(&node)?;

            if let Err(e) = k3s::install_agent(&session, &join_url, &token, &bundle, &opts) {
                self.nodes[i].fail();
                return Err(e).with_context(|| format!("Agent install failed on {}", node.name));
            }
            self.advance_node(i, NodeState::Joined)?;

            // Not gating: a slow agent is a warning, not an abort.
            match k3s::wait_node_ready(
                &server_session,
                &node.name,
                k3s::cluster::NODE_READY_TIMEOUT,
            ) {
                Ok(()) => {
                    self.advance_node(i, NodeState::Ready)?;
                    ui::print_success(&format!("{} joined and Ready", node.name));
                }
                Err(e) => {
                    ui::print_warning(&format!(
                        "{} joined but did not report Ready in time: {e}",
                        node.name
                    ));
                }
            }
        }

        Ok(())
    }

    fn configure_gpu(&mut self) -> Result<()> {
        let server_node = self.nodes[0].clone();
        let server_session = self.session(&server_node)?;
        let policy = self.config.sharing_policy()?;

        let gpu_names = self.config.gpu_node_names();
        let mut gpu_sessions: Vec<SshSession> = Vec::new();
        for name in &gpu_names {
            let node = self
                .nodes
                .iter()
                .find(|n| &n.name == name)
                .with_context(|| format!("Unknown GPU node: {name}"))?
                .clone();
            gpu_sessions.push(self.session(&node)?);
        }
        let gpu_execs: Vec<&dyn Executor> =
            gpu_sessions.iter().map(|s| s as &dyn Executor).collect();

        gpu::apply(
            &server_session,
            &gpu_execs,
            &policy,
            self.config.driver_mode,
        )
        .context("Applying the GPU sharing policy failed")?;

        match gpu::poll_allocatable(
            &server_session,
            &gpu_names,
            &policy,
            gpu::verify::ALLOCATABLE_TIMEOUT,
        ) {
            Ok(()) => {
                ui::print_success(&format!(
                    "all GPU nodes advertise {} x{}",
                    policy.resource_name(),
                    policy.replicas()
                ));
            }
            // Degraded, not fatal: the cluster may still be usable.
            Err(e @ gpu::GpuError::ResourceNotAdvertised { .. }) => {
                ui::print_warning(&format!("GPU resources degraded: {e}"));
            }
            Err(e) => return Err(e).context("GPU verification failed"),
        }

        Ok(())
    }

    fn verify_deployment(&mut self) -> Result<()> {
        let server_node = self.nodes[0].clone();
        let server_session = self.session(&server_node)?;
        let policy = self.config.sharing_policy()?;

        // Observe final node readiness, server included.
        for i in 0..self.nodes.len() {
            let name = self.nodes[i].name.clone();
            if !self.nodes[i].has_reached(NodeState::Ready)
                && k3s::node_ready(&server_session, &name).unwrap_or(false)
            {
                self.advance_node(i, NodeState::Ready)?;
            }
        }

        let version = k3s::installed_version(&server_session)?;
        let probe = gpu::run_probe(&server_session, policy.resource_name());

        self.print_summary(version.as_deref(), &probe, &policy);

        if let Some(unready) = self
            .nodes
            .iter()
            .find(|n| !n.has_reached(NodeState::Ready))
        {
            ui::print_warning(&format!(
                "{} has not reached Ready; rerun with skip flags once resolved",
                unready.name
            ));
        }

        Ok(())
    }

    // --- Helpers ---

    fn print_summary(
        &self,
        version: Option<&str>,
        probe: &ProbeOutcome,
        policy: &SharingPolicy,
    ) {
        println!();
        ui::print_step("Deployment summary");
        ui::print_kv("cluster", &self.config.cluster_name);
        ui::print_kv("k3s version", version.unwrap_or("unknown"));
        ui::print_kv(
            "gpu policy",
            &format!("{} x{}", policy.resource_name(), policy.replicas()),
        );
        ui::print_kv(
            "gpu probe",
            match probe {
                ProbeOutcome::Passed => "passed",
                ProbeOutcome::Failed(_) => "failed (non-fatal)",
            },
        );

        let server_session = self.nodes[0]
            .address
            .as_ref()
            .map(|a| SshSession::new(a.clone(), self.config.ssh.clone()));

        let mut rows = Vec::new();
        for node in &self.nodes {
            let advertised = server_session
                .as_ref()
                .and_then(|s| gpu::verify::allocatable(s, &node.name, policy.resource_name()).ok())
                .unwrap_or(0);
            rows.push(vec![
                node.name.clone(),
                node.role.to_string(),
                node.address.clone().unwrap_or_else(|| "-".to_string()),
                node.state.to_string(),
                advertised.to_string(),
            ]);
        }
        println!();
        ui::print_table(&["NODE", "ROLE", "ADDRESS", "STATE", "GPU"], &rows);

        println!();
        ui::print_step("Access");
        if let Some(address) = &self.nodes[0].address {
            ui::print_info(&format!(
                "ssh {}@{address} sudo k3s kubectl get nodes",
                self.config.ssh.user()
            ));
            ui::print_info(&format!(
                "request a GPU slice with resources.limits: {{{}: 1}}",
                policy.resource_name()
            ));
        }
    }

    fn dump_states(&self) {
        println!();
        ui::print_step("Node states at failure");
        let rows: Vec<Vec<String>> = self
            .nodes
            .iter()
            .map(|n| {
                vec![
                    n.name.clone(),
                    n.role.to_string(),
                    n.address.clone().unwrap_or_else(|| "-".to_string()),
                    n.state.to_string(),
                ]
            })
            .collect();
        ui::print_table(&["NODE", "ROLE", "ADDRESS", "STATE"], &rows);
        ui::print_info("Rerun the same command to resume; use --skip-* flags to jump phases.");
    }

    /// Move a node forward, tolerating already-reached states.
    fn advance_node(&mut self, index: usize, state: NodeState) -> Result<()> {
        if self.nodes[index].has_reached(state) {
            return Ok(());
        }
        self.nodes[index].advance(state)?;
        Ok(())
    }

    fn session(&self, node: &Node) -> Result<SshSession> {
        let address = node
            .address
            .as_deref()
            .with_context(|| format!("No address recorded for {}", node.name))?;
        Ok(SshSession::new(address, self.config.ssh.clone()))
    }

    fn server_session(&self) -> Result<SshSession> {
        self.session(&self.nodes[0])
    }

    fn install_options(&self) -> InstallOptions {
        let mut opts = InstallOptions::new(&self.config.k3s_version);
        if let Some(mirror) = &self.config.registry_mirror {
            opts = opts.with_script_url(format!("{}/install.sh", mirror.trim_end_matches('/')));
        }
        opts
    }

    fn artifact_source(&self) -> Result<Box<dyn ArtifactSource>> {
        Ok(match self.config.artifacts {
            ArtifactMode::Online => {
                let mut source = NodeDirect::new(&self.config.k3s_version);
                if let Some(mirror) = &self.config.registry_mirror {
                    source = source
                        .with_script_url(format!("{}/install.sh", mirror.trim_end_matches('/')));
                }
                Box::new(source)
            }
            ArtifactMode::Fetch => {
                let mut source =
                    NetworkFetch::new(&self.config.k3s_version, &self.config.bundle_dir)?;
                if let Some(mirror) = &self.config.registry_mirror {
                    source = source.with_release_base(mirror.clone());
                }
                Box::new(source)
            }
            ArtifactMode::PreStaged => Box::new(PreStaged::new(
                &self.config.k3s_version,
                &self.config.bundle_dir,
            )),
        })
    }

    /// The bundle for install phases: the staged one, or the mode's
    /// equivalent when staging was skipped by flag.
    fn current_bundle(&self) -> ArtifactBundle {
        if let Some(bundle) = &self.bundle {
            return bundle.clone();
        }
        match self.config.artifacts {
            ArtifactMode::Online => ArtifactBundle::online(&self.config.k3s_version),
            ArtifactMode::Fetch => ArtifactBundle::offline(
                &self.config.k3s_version,
                self.config.bundle_dir.join(&self.config.k3s_version),
            ),
            ArtifactMode::PreStaged => {
                ArtifactBundle::offline(&self.config.k3s_version, &self.config.bundle_dir)
            }
        }
    }
}
