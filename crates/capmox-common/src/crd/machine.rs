//! ProxmoxMachine CRD
//!
//! The infrastructure machine backing one Cluster API `Machine`. Its spec is
//! the desired VM shape; its status records how far the VM has come (VMID
//! and node, pending remote task, addresses, failure state).

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, IpAddress, MachineAddress, MachineStatusError};

/// Name of the default network device
pub const DEFAULT_NETWORK_DEVICE: &str = "net0";

/// Network model used when none is configured
pub const DEFAULT_NETWORK_MODEL: &str = "virtio";

/// Prefix of provider IDs written to the machine spec
pub const PROVIDER_ID_PREFIX: &str = "proxmox://";

/// ProxmoxMachine describes one VM on a Proxmox VE cluster.
///
/// Example:
/// ```yaml
/// apiVersion: infrastructure.cluster.x-k8s.io/v1alpha1
/// kind: ProxmoxMachine
/// metadata:
///   name: workload-cp-0
///   labels:
///     cluster.x-k8s.io/cluster-name: workload
/// spec:
///   sourceNode: pve1
///   templateID: 9000
///   vmIDRange: { start: 1000, end: 1099 }
///   numCores: 4
///   memoryMiB: 8192
///   disks:
///     bootVolume: { disk: scsi0, sizeGb: 50 }
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1alpha1",
    kind = "ProxmoxMachine",
    namespaced,
    status = "ProxmoxMachineStatus",
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".status.proxmoxNode"}"#,
    printcolumn = r#"{"name":"VMID","type":"integer","jsonPath":".spec.virtualMachineID"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProxmoxMachineSpec {
    /// Provider identity, derived from the VM's BIOS UUID once it exists
    #[serde(default, rename = "providerID", skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// VMID of the backing VM, recorded once the clone was issued
    #[serde(default, rename = "virtualMachineID", skip_serializing_if = "Option::is_none")]
    pub virtual_machine_id: Option<u64>,

    // ==========================================================================
    // Template Source
    // ==========================================================================
    /// Proxmox node holding the template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_node: Option<String>,

    /// Template VMID to clone from
    #[serde(default, rename = "templateID", skip_serializing_if = "Option::is_none")]
    pub template_id: Option<u64>,

    /// Select the template by tags when no template ID is given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_selector: Option<TemplateSelector>,

    /// Snapshot of the template to clone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snap_name: Option<String>,

    // ==========================================================================
    // Clone Options
    // ==========================================================================
    /// VM description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Target disk format for full clones
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<TargetFileStorageFormat>,

    /// Full clone instead of a linked clone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full: Option<bool>,

    /// Resource pool for the new VM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,

    /// Target storage for full clones
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,

    /// Node to place the VM on, bypassing the scheduler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Nodes the scheduler may place the VM on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_nodes: Vec<String>,

    /// Range to allocate the VMID from; the remote picks one when unset
    #[serde(default, rename = "vmIDRange", skip_serializing_if = "Option::is_none")]
    pub vmid_range: Option<VmIdRange>,

    // ==========================================================================
    // Hardware
    // ==========================================================================
    /// CPU sockets
    #[serde(default)]
    pub num_sockets: u32,

    /// CPU cores per socket
    #[serde(default)]
    pub num_cores: u32,

    /// Memory in MiB
    #[serde(default, rename = "memoryMiB")]
    pub memory_mib: u32,

    /// Disks to converge before first boot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disks: Option<Storage>,

    /// Network devices
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkSpec>,

    /// Tags added to the VM; existing remote tags are never removed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Readiness checks to skip
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checks: Option<ProxmoxMachineChecks>,
}

/// Template lookup by tags
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSelector {
    /// All of these tags must be present on the template
    pub match_tags: Vec<String>,
}

/// Disk format of cloned volumes
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TargetFileStorageFormat {
    /// Raw disk image
    Raw,
    /// QEMU copy-on-write image
    Qcow2,
    /// VMware disk image
    Vmdk,
}

impl TargetFileStorageFormat {
    /// Proxmox API spelling of the format
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetFileStorageFormat::Raw => "raw",
            TargetFileStorageFormat::Qcow2 => "qcow2",
            TargetFileStorageFormat::Vmdk => "vmdk",
        }
    }
}

/// Inclusive VMID range
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct VmIdRange {
    /// First VMID
    pub start: u64,
    /// Last VMID
    pub end: u64,
}

impl VmIdRange {
    /// A range only counts as configured when both bounds are set
    pub fn is_configured(&self) -> bool {
        self.start != 0 && self.end != 0
    }
}

/// Disk configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Storage {
    /// The volume the VM boots from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_volume: Option<DiskSize>,
}

/// Desired size of one disk
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiskSize {
    /// Device name (e.g., "scsi0")
    pub disk: String,
    /// Size in GiB
    pub size_gb: u32,
}

impl DiskSize {
    /// Size as accepted by the Proxmox resize API
    pub fn format_size(&self) -> String {
        format!("{}G", self.size_gb)
    }
}

/// Network configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    /// The default device (`net0`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<NetworkDevice>,

    /// Devices beyond `net0`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_devices: Vec<AdditionalNetworkDevice>,
}

/// One virtual NIC
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkDevice {
    /// Bridge the NIC attaches to
    pub bridge: String,

    /// NIC model (default: virtio)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// MTU
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u16>,

    /// VLAN tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<u16>,
}

impl NetworkDevice {
    /// The NIC model, falling back to virtio
    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_NETWORK_MODEL)
    }
}

/// A named NIC beyond the default one
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalNetworkDevice {
    /// Device name (e.g., "net1")
    pub name: String,

    /// Device settings
    #[serde(flatten)]
    pub device: NetworkDevice,
}

/// Readiness checks that can be skipped
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxmoxMachineChecks {
    /// Skip waiting for cloud-init (e.g., Flatcar)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_cloud_init_status: Option<bool>,

    /// Skip waiting for the QEMU guest agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_qemu_guest_agent: Option<bool>,
}

/// Observed state of a ProxmoxMachine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxmoxMachineStatus {
    /// The VM is provisioned and running
    #[serde(default)]
    pub ready: bool,

    /// Reportable addresses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,

    /// Assigned IP addresses per network device
    #[serde(default, rename = "ipAddresses", skip_serializing_if = "BTreeMap::is_empty")]
    pub ip_addresses: BTreeMap<String, IpAddress>,

    /// Node the VM lives on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxmox_node: Option<String>,

    /// Remote task still in flight (a Proxmox UPID)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_ref: Option<String>,

    /// Terminal failure reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<MachineStatusError>,

    /// Terminal failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,

    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ProxmoxMachine {
    /// Status, created on first use
    pub fn status_mut(&mut self) -> &mut ProxmoxMachineStatus {
        self.status.get_or_insert_with(Default::default)
    }

    /// Recorded VMID, ignoring unset or zero values
    pub fn virtual_machine_id(&self) -> Option<u64> {
        self.spec.virtual_machine_id.filter(|id| *id > 0)
    }

    /// Node the VM lives on, or the template's node before placement is known
    pub fn node(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.proxmox_node.as_deref())
            .or(self.spec.source_node.as_deref())
            .filter(|n| !n.is_empty())
    }

    /// Explicit template VMID, if any
    pub fn template_id(&self) -> Option<u64> {
        self.spec.template_id
    }

    /// Tags used to look up the template when no template ID is given
    pub fn template_selector_tags(&self) -> Vec<String> {
        self.spec
            .template_selector
            .as_ref()
            .map(|s| s.match_tags.clone())
            .unwrap_or_default()
    }

    /// Pending remote task, if any
    pub fn task_ref(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.task_ref.as_deref())
    }

    /// Whether the machine was marked ready
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.ready)
    }

    /// Whether the cloud-init completion check is disabled
    pub fn skip_cloud_init_check(&self) -> bool {
        self.spec
            .checks
            .as_ref()
            .and_then(|c| c.skip_cloud_init_status)
            .unwrap_or(false)
    }

    /// Whether the guest agent check is disabled
    pub fn skip_qemu_guest_check(&self) -> bool {
        self.spec
            .checks
            .as_ref()
            .and_then(|c| c.skip_qemu_guest_agent)
            .unwrap_or(false)
    }
}
