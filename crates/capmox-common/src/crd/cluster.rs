//! ProxmoxCluster CRD
//!
//! Cluster-wide infrastructure settings and the node-location table that
//! records which Proxmox node every machine of the cluster was placed on.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// ProxmoxCluster holds the infrastructure settings of one workload cluster.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1alpha1",
    kind = "ProxmoxCluster",
    namespaced,
    status = "ProxmoxClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ProxmoxClusterSpec {
    /// Nodes VMs of this cluster may be placed on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_nodes: Vec<String>,

    /// IPv4 addressing; machines report an IPv4 internal address when set
    #[serde(default, rename = "ipv4Config", skip_serializing_if = "Option::is_none")]
    pub ipv4_config: Option<IpPoolConfig>,

    /// IPv6 addressing; machines report an IPv6 internal address when set
    #[serde(default, rename = "ipv6Config", skip_serializing_if = "Option::is_none")]
    pub ipv6_config: Option<IpPoolConfig>,
}

/// IP pool handed to the address allocator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IpPoolConfig {
    /// Addresses or ranges in the pool
    pub addresses: Vec<String>,
    /// Network prefix length
    pub prefix: u8,
    /// Gateway address
    pub gateway: String,
}

/// Observed state of a ProxmoxCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxmoxClusterStatus {
    /// Where each machine's VM lives
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_locations: Option<NodeLocations>,

    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Node locations split by machine role
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeLocations {
    /// Control-plane machines
    #[serde(default)]
    pub control_plane: Vec<NodeLocation>,
    /// Worker machines
    #[serde(default)]
    pub workers: Vec<NodeLocation>,
}

/// Which node a machine's VM was placed on
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeLocation {
    /// Name of the machine
    pub machine: String,
    /// Proxmox node
    pub node: String,
}

impl NodeLocations {
    fn list(&self, control_plane: bool) -> &Vec<NodeLocation> {
        if control_plane {
            &self.control_plane
        } else {
            &self.workers
        }
    }

    fn list_mut(&mut self, control_plane: bool) -> &mut Vec<NodeLocation> {
        if control_plane {
            &mut self.control_plane
        } else {
            &mut self.workers
        }
    }
}

impl ProxmoxCluster {
    /// Location recorded for a machine, if any
    pub fn node_location(&self, machine: &str, control_plane: bool) -> Option<&NodeLocation> {
        self.status
            .as_ref()
            .and_then(|s| s.node_locations.as_ref())
            .and_then(|l| l.list(control_plane).iter().find(|loc| loc.machine == machine))
    }

    /// Record where a machine was placed
    ///
    /// Returns false when the machine already has a location.
    pub fn add_node_location(&mut self, location: NodeLocation, control_plane: bool) -> bool {
        if self.node_location(&location.machine, control_plane).is_some() {
            return false;
        }
        self.locations_mut().list_mut(control_plane).push(location);
        true
    }

    /// Move a machine's recorded location to another node, adding it if missing
    ///
    /// Returns false when the recorded node already matches.
    pub fn update_node_location(&mut self, machine: &str, node: &str, control_plane: bool) -> bool {
        let list = self.locations_mut().list_mut(control_plane);
        match list.iter_mut().find(|loc| loc.machine == machine) {
            Some(loc) if loc.node == node => false,
            Some(loc) => {
                loc.node = node.to_string();
                true
            }
            None => {
                list.push(NodeLocation {
                    machine: machine.to_string(),
                    node: node.to_string(),
                });
                true
            }
        }
    }

    /// Drop a machine's recorded location
    ///
    /// Returns false when nothing was recorded.
    pub fn remove_node_location(&mut self, machine: &str, control_plane: bool) -> bool {
        let list = self.locations_mut().list_mut(control_plane);
        let before = list.len();
        list.retain(|loc| loc.machine != machine);
        list.len() != before
    }

    fn locations_mut(&mut self) -> &mut NodeLocations {
        self.status
            .get_or_insert_with(Default::default)
            .node_locations
            .get_or_insert_with(Default::default)
    }
}
