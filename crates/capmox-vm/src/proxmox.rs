//! Proxmox VE client seam
//!
//! The reconciler talks to the hypervisor only through [`ProxmoxClient`].
//! Every call is a single round trip; asynchronous operations (clone,
//! configure) return a [`Task`] whose completion is tracked separately.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use capmox_common::Error;

/// Remote VM status string for a running guest
pub const VM_STATUS_RUNNING: &str = "running";

/// Trait abstracting the Proxmox VE API
///
/// Implementations must map a missing VM to
/// [`Error::proxmox_not_found`], a failed cloud-init run to
/// [`Error::CloudInitFailed`] and a template miss to
/// [`Error::TemplateNotFound`]; the pipeline classifies on those.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProxmoxClient: Send + Sync {
    /// Fetch a VM with its current config from a node
    async fn get_vm(&self, node: &str, vmid: u64) -> Result<VirtualMachine, Error>;

    /// Locate a VM anywhere in the cluster by VMID
    async fn find_vm_resource(&self, vmid: u64) -> Result<ClusterResource, Error>;

    /// Clone a template into a new VM
    async fn clone_vm(
        &self,
        template_id: u64,
        request: &VmCloneRequest,
    ) -> Result<VmCloneResponse, Error>;

    /// Apply config options to a VM in one call
    async fn configure_vm(
        &self,
        vm: &VirtualMachine,
        options: &[VirtualMachineOption],
    ) -> Result<Task, Error>;

    /// Resize a disk to an absolute size (e.g. "50G")
    async fn resize_disk(&self, vm: &VirtualMachine, disk: &str, size: &str)
        -> Result<(), Error>;

    /// Check whether a VMID is free cluster-wide
    async fn check_id(&self, vmid: u64) -> Result<bool, Error>;

    /// Find a template carrying all given tags; returns its node and VMID
    async fn find_vm_template_by_tags(&self, tags: &[String]) -> Result<(String, u64), Error>;

    /// Succeeds once the QEMU guest agent answers
    async fn qemu_agent_status(&self, vm: &VirtualMachine) -> Result<(), Error>;

    /// Whether cloud-init is still running in the guest
    async fn cloud_init_status(&self, vm: &VirtualMachine) -> Result<bool, Error>;

    /// Eject the cloud-init ISO from the given device
    async fn unmount_cloud_init_iso(&self, vm: &VirtualMachine, device: &str)
        -> Result<(), Error>;

    /// Fetch the state of an asynchronous task
    async fn get_task(&self, upid: &str) -> Result<Task, Error>;
}

/// A VM as returned by the Proxmox API
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct VirtualMachine {
    /// VM name
    pub name: String,
    /// VMID
    pub vmid: u64,
    /// Node the VM lives on
    pub node: String,
    /// Power status ("running", "stopped")
    pub status: String,
    /// Current config
    pub config: VirtualMachineConfig,
}

impl VirtualMachine {
    /// Whether the guest is powered on
    pub fn is_running(&self) -> bool {
        self.status == VM_STATUS_RUNNING
    }
}

/// The subset of the VM config the reconciler converges
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct VirtualMachineConfig {
    /// CPU sockets
    #[serde(default)]
    pub sockets: u32,
    /// CPU cores per socket
    #[serde(default)]
    pub cores: u32,
    /// Memory in MiB
    #[serde(default)]
    pub memory: u32,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Semicolon-separated tags
    #[serde(default)]
    pub tags: String,
    /// SMBIOS settings, e.g. "uuid=...,manufacturer=..."
    #[serde(default)]
    pub smbios1: String,
    /// Network devices by name (net0, net1, ...)
    #[serde(default)]
    pub nets: BTreeMap<String, String>,
}

impl VirtualMachineConfig {
    /// Tags as a list, dropping empty entries
    pub fn split_tags(&self) -> Vec<String> {
        self.tags
            .split(';')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect()
    }
}

/// A cluster resource entry for a VM
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ClusterResource {
    /// VM name
    pub name: String,
    /// VMID
    pub vmid: u64,
    /// Node the VM lives on
    pub node: String,
}

/// Parameters of a clone call
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct VmCloneRequest {
    /// Node holding the template
    pub node: String,
    /// VMID for the clone; the remote picks one when None
    pub new_id: Option<u64>,
    /// Name of the clone
    pub name: String,
    /// Description
    pub description: Option<String>,
    /// Target disk format
    pub format: Option<String>,
    /// Full clone flag
    pub full: Option<bool>,
    /// Resource pool
    pub pool: Option<String>,
    /// Template snapshot
    pub snap_name: Option<String>,
    /// Target storage
    pub storage: Option<String>,
    /// Target node
    pub target: Option<String>,
}

/// Result of a clone call
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct VmCloneResponse {
    /// VMID of the new VM
    pub new_id: u64,
    /// The clone task
    pub task: Task,
}

/// Lifecycle of a remote task
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum TaskState {
    /// Still running
    #[default]
    Running,
    /// Finished with exit status OK
    Succeeded,
    /// Finished with any other exit status
    Failed,
}

/// An asynchronous remote operation
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Task {
    /// Unique process identifier
    pub upid: String,
    /// Current state
    pub state: TaskState,
    /// Exit status as reported by the node, once finished
    pub exit_status: Option<String>,
}

impl Task {
    /// A freshly started task
    pub fn running(upid: impl Into<String>) -> Self {
        Self {
            upid: upid.into(),
            state: TaskState::Running,
            exit_status: None,
        }
    }
}

/// One config field to set on a VM
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualMachineOption {
    /// Config key (e.g., "cores")
    pub name: String,
    /// Config value as sent to the API
    pub value: String,
}

impl VirtualMachineOption {
    /// Build an option from any displayable value
    pub fn new(name: impl Into<String>, value: impl ToString) -> Self {
        Self {
            name: name.into(),
            value: value.to_string(),
        }
    }
}
