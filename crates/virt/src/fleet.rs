//! Idempotent VM lifecycle operations on top of a [`Hypervisor`].
//!
//! Mutations against the hypervisor datastore are keyed by VM name: a name
//! collision means the VM is already provisioned and the existing handle is
//! returned unchanged.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::providers::{CloneRequest, Hypervisor, HypervisorError, PowerState, VmHandle};

/// Clone a VM from a template, or return the existing VM of the same name.
///
/// Never clones twice: calling this again with identical arguments yields
/// exactly one VM identity.
///
/// # Errors
///
/// Returns an error if the template is missing or the clone task fails.
pub async fn provision(
    hv: &dyn Hypervisor,
    req: &CloneRequest,
) -> Result<VmHandle, HypervisorError> {
    if let Some(existing) = hv.find_vm(&req.name).await? {
        info!(name = %req.name, vmid = existing.vmid, "VM already provisioned");
        return Ok(existing);
    }

    hv.clone_from_template(req).await
}

/// Power the VM on if it is not already running.
///
/// # Errors
///
/// Returns an error if the power task fails.
pub async fn ensure_power_on(hv: &dyn Hypervisor, vm: &VmHandle) -> Result<(), HypervisorError> {
    if hv.power_state(vm).await? == PowerState::Running {
        debug!(name = %vm.name, "already running");
        return Ok(());
    }
    hv.power_on(vm).await
}

/// Power the VM off if it is not already stopped.
///
/// # Errors
///
/// Returns an error if the power task fails.
pub async fn ensure_power_off(hv: &dyn Hypervisor, vm: &VmHandle) -> Result<(), HypervisorError> {
    if hv.power_state(vm).await? == PowerState::Stopped {
        debug!(name = %vm.name, "already stopped");
        return Ok(());
    }
    hv.power_off(vm).await
}

/// Pick the first non-loopback IPv4 address on the expected lab subnet.
fn pick_lab_address(addresses: &[String], subnet_prefix: &str) -> Option<String> {
    addresses
        .iter()
        .filter(|a| !a.starts_with("127."))
        .find(|a| a.starts_with(subnet_prefix))
        .cloned()
}

/// Poll the guest agent until the VM reports an address on the lab subnet.
///
/// # Errors
///
/// Returns [`HypervisorError::Timeout`] if no matching address appears in
/// the window.
pub async fn discover_address(
    hv: &dyn Hypervisor,
    vm: &VmHandle,
    subnet_prefix: &str,
    timeout_secs: u64,
    interval_secs: u64,
) -> Result<String, HypervisorError> {
    info!(
        name = %vm.name,
        subnet = subnet_prefix,
        timeout_secs,
        "waiting for guest address"
    );

    let start = Instant::now();
    let timeout = Duration::from_secs(timeout_secs);

    loop {
        let addresses = hv.guest_addresses(vm).await?;
        if let Some(address) = pick_lab_address(&addresses, subnet_prefix) {
            info!(name = %vm.name, %address, "guest address discovered");
            return Ok(address);
        }

        if start.elapsed() > timeout {
            return Err(HypervisorError::Timeout(timeout_secs));
        }

        debug!(
            name = %vm.name,
            reported = addresses.len(),
            elapsed_secs = start.elapsed().as_secs(),
            "no lab address yet"
        );
        tokio::time::sleep(Duration::from_secs(interval_secs)).await;
    }
}
