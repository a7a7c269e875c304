//! Proxmox VE provider.

mod client;
mod models;

pub use client::Proxmox;
