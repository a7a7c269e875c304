//! Remote execution for Forge Lab provisioning.
//!
//! This crate provides authenticated command and file execution against
//! remote hosts over SSH, plus the readiness-polling primitives every other
//! component builds its wait loops on.
//!
//! # Example
//!
//! ```rust,ignore
//! use remote::{RemoteCommand, SshAuth, SshSession, wait_for_reachable};
//! use std::time::Duration;
//!
//! fn main() -> anyhow::Result<()> {
//!     wait_for_reachable("10.30.0.11", 22, Duration::from_secs(180), Duration::from_secs(5))?;
//!
//!     let session = SshSession::new(
//!         "10.30.0.11",
//!         SshAuth::key("ops", "/home/ops/.ssh/id_ed25519"),
//!     );
//!     let out = session.execute(&RemoteCommand::new("systemctl").args(["is-active", "k3s"]))?;
//!     println!("k3s unit: {}", out.stdout.trim());
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod command;
pub mod exec;
pub mod poll;

pub use command::RemoteCommand;
pub use exec::{wait_for_reachable, ExecOutput, Executor, RemoteError, SshAuth, SshSession, SSH_PORT};
pub use poll::{poll_until, PollTimeout};
