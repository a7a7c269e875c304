//! Hypervisor provider implementations.

pub mod proxmox;
pub mod traits;

pub use traits::{CloneRequest, Hypervisor, HypervisorError, PowerState, VmHandle};
