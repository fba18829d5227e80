//! Read-only view of the Cluster API `Machine` that owns a ProxmoxMachine
//!
//! Only the fields the VM reconciler reads are modelled; everything else
//! is ignored on deserialization.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label carrying the owning cluster's name
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Label present on control-plane machines
pub const CONTROL_PLANE_LABEL: &str = "cluster.x-k8s.io/control-plane";

/// Cluster API Machine (subset)
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Machine",
    namespaced,
    status = "MachineStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Name of the cluster this machine belongs to
    pub cluster_name: String,

    /// Kubernetes version of the node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Observed state of a Machine (subset)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Bootstrap data has been generated
    #[serde(default)]
    pub bootstrap_ready: bool,

    /// The workload cluster Node backing this machine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<NodeReference>,
}

/// Reference to a workload cluster Node
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct NodeReference {
    /// Node name
    pub name: String,
}

impl Machine {
    /// Control-plane machines carry the control-plane label
    pub fn is_control_plane(&self) -> bool {
        self.labels().contains_key(CONTROL_PLANE_LABEL)
    }

    /// Bootstrap data is ready
    pub fn is_bootstrap_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.bootstrap_ready)
    }

    /// The machine joined the workload cluster as a Node
    pub fn has_node_ref(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.node_ref.is_some())
    }
}
