//! Shared types used across the CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a condition
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

/// Severity of a false condition
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionSeverity {
    /// The machine cannot make progress without intervention
    Error,
    /// Something went wrong but a later reconciliation may fix it
    Warning,
    /// Informational, e.g. an operation is in progress
    Info,
}

/// Condition represents an observation of an object's state
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., VMProvisioned)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Severity, only meaningful when status is False
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<ConditionSeverity>,

    /// Machine-readable reason for the condition
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            severity: None,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Attach a severity to the condition
    pub fn with_severity(mut self, severity: ConditionSeverity) -> Self {
        self.severity = Some(severity);
        self
    }
}

/// Kind of a reportable machine address
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MachineAddressType {
    /// The machine's hostname
    Hostname,
    /// An address reachable from inside the cluster network
    InternalIP,
    /// An address reachable from outside the cluster network
    ExternalIP,
}

/// An address reported for a machine
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct MachineAddress {
    /// Address kind
    #[serde(rename = "type")]
    pub type_: MachineAddressType,
    /// The address itself
    pub address: String,
}

impl MachineAddress {
    /// Hostname address
    pub fn hostname(address: impl Into<String>) -> Self {
        Self {
            type_: MachineAddressType::Hostname,
            address: address.into(),
        }
    }

    /// Internal IP address
    pub fn internal_ip(address: impl Into<String>) -> Self {
        Self {
            type_: MachineAddressType::InternalIP,
            address: address.into(),
        }
    }
}

/// IP addresses assigned to one network device
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IpAddress {
    /// Assigned IPv4 address
    #[serde(default, rename = "ipv4", skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,
    /// Assigned IPv6 address
    #[serde(default, rename = "ipv6", skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,
}

impl IpAddress {
    /// True when neither family has an address
    pub fn is_empty(&self) -> bool {
        self.ipv4.as_deref().unwrap_or_default().is_empty()
            && self.ipv6.as_deref().unwrap_or_default().is_empty()
    }
}

/// Lifecycle state of a reconciled virtual machine
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum VirtualMachineState {
    /// The VM still needs work before it can serve the machine
    #[default]
    Pending,
    /// The VM is running and provisioned
    Ready,
}

/// Result of a VM reconciliation, consumed by the machine controller
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VirtualMachineView {
    /// Name of the VM (equal to the machine name)
    pub name: String,
    /// Observed lifecycle state
    pub state: VirtualMachineState,
}

impl VirtualMachineView {
    /// A pending view for the given machine
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: VirtualMachineState::Pending,
        }
    }

    /// True once the VM reached the Ready state
    pub fn is_ready(&self) -> bool {
        self.state == VirtualMachineState::Ready
    }
}

/// Standardized machine failure reasons (Cluster API `MachineStatusError`)
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MachineStatusError {
    /// Not enough capacity to create the machine
    InsufficientResources,
    /// No VM template matched the template selector
    #[serde(rename = "VMTemplateNotFound")]
    VmTemplateNotFound,
    /// The guest failed its first-boot provisioning
    BootstrapFailed,
}

impl fmt::Display for MachineStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MachineStatusError::InsufficientResources => "InsufficientResources",
            MachineStatusError::VmTemplateNotFound => "VMTemplateNotFound",
            MachineStatusError::BootstrapFailed => "BootstrapFailed",
        };
        f.write_str(s)
    }
}
