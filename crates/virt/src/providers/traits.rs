//! Hypervisor trait and common types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during hypervisor operations.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// VM not found.
    #[error("VM not found: {0}")]
    NotFound(String),

    /// A hypervisor task finished unsuccessfully.
    #[error("task {upid} failed: {status}")]
    TaskFailed { upid: String, status: String },

    /// Operation timed out.
    #[error("operation timed out after {0} seconds")]
    Timeout(u64),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// VM power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    /// VM is running.
    Running,
    /// VM is stopped.
    Stopped,
    /// Unknown state.
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Handle to a provisioned (or pre-existing) VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmHandle {
    /// Numeric VM identifier on the hypervisor.
    pub vmid: u32,
    /// VM name (the idempotency key).
    pub name: String,
    /// Hypervisor node hosting the VM.
    pub node: String,
}

/// Request to clone a VM from a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneRequest {
    /// Name of the template VM to clone from.
    pub template: String,
    /// Name for the new VM.
    pub name: String,
    /// CPU cores for the clone.
    pub cores: u32,
    /// Memory in MiB for the clone.
    pub memory_mb: u64,
}

impl CloneRequest {
    /// Create a clone request with lab-default sizing.
    #[must_use]
    pub fn new(template: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            name: name.into(),
            cores: 4,
            memory_mb: 8192,
        }
    }

    /// Set CPU cores.
    #[must_use]
    pub fn with_cores(mut self, cores: u32) -> Self {
        self.cores = cores;
        self
    }

    /// Set memory in MiB.
    #[must_use]
    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = memory_mb;
        self
    }
}

/// Trait for hypervisor management interfaces.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Look up a VM by name.
    async fn find_vm(&self, name: &str) -> Result<Option<VmHandle>, HypervisorError>;

    /// Clone a new VM from a template and wait for the clone to finish.
    async fn clone_from_template(&self, req: &CloneRequest) -> Result<VmHandle, HypervisorError>;

    /// Current power state.
    async fn power_state(&self, vm: &VmHandle) -> Result<PowerState, HypervisorError>;

    /// Start the VM.
    async fn power_on(&self, vm: &VmHandle) -> Result<(), HypervisorError>;

    /// Stop the VM.
    async fn power_off(&self, vm: &VmHandle) -> Result<(), HypervisorError>;

    /// Addresses reported by the guest agent (may be empty until boot).
    async fn guest_addresses(&self, vm: &VmHandle) -> Result<Vec<String>, HypervisorError>;

    /// Destroy the VM.
    async fn destroy(&self, vm: &VmHandle) -> Result<(), HypervisorError>;
}
