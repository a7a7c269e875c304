//! VM provisioning for Forge Lab.
//!
//! This crate provides abstractions for cloning lab VMs from a hypervisor
//! template, managing their power state, and discovering their guest
//! addresses. Provisioning is idempotent by VM name: the name is the
//! idempotency key against the shared hypervisor datastore, substituting for
//! a lock.
//!
//! # Example
//!
//! ```rust,ignore
//! use virt::providers::proxmox::Proxmox;
//! use virt::{provision, discover_address, CloneRequest};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let hv = Proxmox::new("https://pve.lab:8006", "pve", "forgelab@pam!deploy", "secret", true)?;
//!
//!     let vm = provision(&hv, &CloneRequest::new("ubuntu-gpu-template", "lab-server")).await?;
//!     let ip = discover_address(&hv, &vm, "10.30.0.", 300, 10).await?;
//!     println!("{} is at {ip}", vm.name);
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod fleet;
pub mod providers;

pub use fleet::{discover_address, ensure_power_off, ensure_power_on, provision};
pub use providers::proxmox::Proxmox;
pub use providers::{CloneRequest, Hypervisor, HypervisorError, PowerState, VmHandle};
