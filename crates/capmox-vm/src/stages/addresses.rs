//! Reportable machine addresses

use tracing::warn;

use capmox_common::crd::{MachineAddress, DEFAULT_NETWORK_DEVICE};
use capmox_common::Error;

use crate::scope::MachineScope;

/// Addresses the machine reports once its VM runs with assigned IPs
///
/// The hostname is the machine name; one internal IP follows for each
/// family the cluster configures, read from the default device.
pub fn machine_addresses(scope: &MachineScope) -> Result<Vec<MachineAddress>, Error> {
    let name = scope.name();
    let assigned = scope
        .proxmox_machine
        .status
        .as_ref()
        .and_then(|s| s.ip_addresses.get(DEFAULT_NETWORK_DEVICE))
        .filter(|ip| !ip.is_empty())
        .ok_or_else(|| Error::not_ready(&name, "machine does not yet have an ip address"))?;

    if !scope.is_vm_running() {
        return Err(Error::not_ready(
            &name,
            "unable to apply configuration as long as the virtual machine is not running",
        ));
    }

    let cluster = &scope.proxmox_cluster.spec;
    let families = [
        ("ipv4", cluster.ipv4_config.is_some(), &assigned.ipv4),
        ("ipv6", cluster.ipv6_config.is_some(), &assigned.ipv6),
    ];

    let mut addresses = vec![MachineAddress::hostname(&name)];
    for (family, configured, address) in families {
        if !configured {
            continue;
        }
        match address.as_deref().filter(|a| !a.is_empty()) {
            Some(address) => addresses.push(MachineAddress::internal_ip(address)),
            None => {
                return Err(Error::not_ready(
                    &name,
                    format!("no {family} address assigned to {DEFAULT_NETWORK_DEVICE} yet"),
                ))
            }
        }
    }

    Ok(addresses)
}

/// Compute and record the machine's addresses
pub fn reconcile_machine_addresses(scope: &mut MachineScope) -> Result<(), Error> {
    let addresses = machine_addresses(scope).inspect_err(|e| {
        warn!(error = %e, "failed to retrieve machine addresses");
    })?;
    scope.set_addresses(addresses);
    Ok(())
}
