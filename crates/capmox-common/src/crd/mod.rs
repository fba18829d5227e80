//! Custom Resource Definitions used by the Proxmox machine reconciler
//!
//! `ProxmoxMachine` and `ProxmoxCluster` are owned by this provider;
//! `Machine` is a read-only view of the Cluster API object that owns a
//! ProxmoxMachine.

mod capi;
mod cluster;
pub mod conditions;
mod machine;
mod types;

pub use capi::{
    Machine, MachineSpec, MachineStatus, NodeReference, CLUSTER_NAME_LABEL, CONTROL_PLANE_LABEL,
};
pub use cluster::{
    IpPoolConfig, NodeLocation, NodeLocations, ProxmoxCluster, ProxmoxClusterSpec,
    ProxmoxClusterStatus,
};
pub use machine::{
    AdditionalNetworkDevice, DiskSize, NetworkDevice, NetworkSpec, ProxmoxMachine,
    ProxmoxMachineChecks, ProxmoxMachineSpec, ProxmoxMachineStatus, Storage,
    TargetFileStorageFormat, TemplateSelector, VmIdRange, DEFAULT_NETWORK_DEVICE,
    DEFAULT_NETWORK_MODEL, PROVIDER_ID_PREFIX,
};
pub use types::{
    Condition, ConditionSeverity, ConditionStatus, IpAddress, MachineAddress, MachineAddressType,
    MachineStatusError, VirtualMachineState, VirtualMachineView,
};
