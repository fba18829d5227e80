//! Network device formatting and freshness check
//!
//! Proxmox stores a NIC as a comma-separated descriptor, e.g.
//! `virtio=BC:24:11:AA:BB:CC,bridge=vmbr0,mtu=9000,tag=42`. The first
//! component is the model, optionally followed by the MAC address.

use std::collections::BTreeMap;

use capmox_common::crd::{NetworkDevice, NetworkSpec, DEFAULT_NETWORK_DEVICE};

use crate::proxmox::VirtualMachineOption;

/// Format a device descriptor as accepted by the config API
pub fn format_network_device(device: &NetworkDevice) -> String {
    let mut value = format!("{},bridge={}", device.model(), device.bridge);
    if let Some(mtu) = device.mtu {
        value.push_str(&format!(",mtu={mtu}"));
    }
    if let Some(vlan) = device.vlan {
        value.push_str(&format!(",tag={vlan}"));
    }
    value
}

/// Model of an observed device descriptor
pub fn extract_network_model(descriptor: &str) -> &str {
    descriptor
        .split(',')
        .next()
        .and_then(|first| first.split('=').next())
        .unwrap_or_default()
}

/// Bridge of an observed device descriptor
pub fn extract_network_bridge(descriptor: &str) -> &str {
    descriptor
        .split(',')
        .find_map(|part| part.strip_prefix("bridge="))
        .unwrap_or_default()
}

/// Desired devices by name: the default device first, then the additional ones
pub fn desired_devices(network: &NetworkSpec) -> Vec<(&str, &NetworkDevice)> {
    network
        .default
        .iter()
        .map(|d| (DEFAULT_NETWORK_DEVICE, d))
        .chain(
            network
                .additional_devices
                .iter()
                .map(|d| (d.name.as_str(), &d.device)),
        )
        .collect()
}

/// Whether any desired device is missing or differs in model or bridge
pub fn should_update_network_devices(
    network: &NetworkSpec,
    observed: &BTreeMap<String, String>,
) -> bool {
    desired_devices(network)
        .into_iter()
        .any(|(name, desired)| match observed.get(name) {
            Some(current) if !current.is_empty() => {
                extract_network_model(current) != desired.model()
                    || extract_network_bridge(current) != desired.bridge
            }
            _ => true,
        })
}

/// Config options for every desired device
pub fn network_options(network: &NetworkSpec) -> Vec<VirtualMachineOption> {
    desired_devices(network)
        .into_iter()
        .map(|(name, device)| VirtualMachineOption::new(name, format_network_device(device)))
        .collect()
}
