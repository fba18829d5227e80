//! Per-reconciliation machine scope
//!
//! A [`MachineScope`] is built by the caller for one reconciliation call and
//! handed to every stage by `&mut`. Field ownership per stage:
//!
//! | field              | read by          | written by                                  |
//! |--------------------|------------------|---------------------------------------------|
//! | `machine`          | all              | never                                       |
//! | `proxmox_machine`  | all              | resolver, differ, addresses, cloud-init     |
//! | `proxmox_cluster`  | creation, addrs  | creation and relocation (node locations)    |
//! | virtual machine    | stages 3 onwards | resolver                                    |
//!
//! The caller persists `proxmox_machine` after the call returns, whatever
//! the outcome.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::{Resource, ResourceExt};

use capmox_common::crd::{
    conditions, Condition, ConditionSeverity, Machine, MachineAddress, MachineStatusError,
    ProxmoxCluster, ProxmoxMachine, CLUSTER_NAME_LABEL, PROVIDER_ID_PREFIX,
};
use capmox_common::Error;

use crate::proxmox::VirtualMachine;

/// Everything one VM reconciliation reads and mutates
#[derive(Clone, Debug)]
pub struct MachineScope {
    /// Owning Cluster API machine
    pub machine: Machine,
    /// Infrastructure machine being reconciled
    pub proxmox_machine: ProxmoxMachine,
    /// Infrastructure cluster the machine belongs to
    pub proxmox_cluster: ProxmoxCluster,
    virtual_machine: Option<VirtualMachine>,
}

impl MachineScope {
    /// Build a scope for one reconciliation
    pub fn new(
        machine: Machine,
        proxmox_machine: ProxmoxMachine,
        proxmox_cluster: ProxmoxCluster,
    ) -> Self {
        Self {
            machine,
            proxmox_machine,
            proxmox_cluster,
            virtual_machine: None,
        }
    }

    /// Name of the machine, also used as the VM name
    pub fn name(&self) -> String {
        self.proxmox_machine.name_any()
    }

    /// Namespace of the machine
    pub fn namespace(&self) -> Result<String, Error> {
        self.proxmox_machine.namespace().ok_or_else(|| {
            Error::validation_for(self.name(), "ProxmoxMachine has no namespace")
        })
    }

    /// Name of the owning cluster
    pub fn cluster_name(&self) -> Result<String, Error> {
        if !self.machine.spec.cluster_name.is_empty() {
            return Ok(self.machine.spec.cluster_name.clone());
        }
        self.proxmox_machine
            .labels()
            .get(CLUSTER_NAME_LABEL)
            .cloned()
            .ok_or_else(|| Error::validation_for(self.name(), "machine has no cluster name"))
    }

    /// Whether the owning machine is part of the control plane
    pub fn is_control_plane(&self) -> bool {
        self.machine.is_control_plane()
    }

    /// The VM resolved earlier in this reconciliation
    pub fn virtual_machine(&self) -> Result<&VirtualMachine, Error> {
        self.virtual_machine.as_ref().ok_or_else(|| {
            Error::internal_with_context("scope", format!("no vm resolved for {}", self.name()))
        })
    }

    /// Attach the resolved VM
    pub fn set_virtual_machine(&mut self, vm: VirtualMachine) {
        self.virtual_machine = Some(vm);
    }

    /// Whether the resolved VM is running; false when none was resolved
    pub fn is_vm_running(&self) -> bool {
        self.virtual_machine.as_ref().is_some_and(|vm| vm.is_running())
    }

    /// Recorded VMID
    pub fn virtual_machine_id(&self) -> Option<u64> {
        self.proxmox_machine.virtual_machine_id()
    }

    /// Record the VMID
    pub fn set_virtual_machine_id(&mut self, vmid: u64) {
        self.proxmox_machine.spec.virtual_machine_id = Some(vmid);
    }

    /// Drop the recorded VMID and node so the next pass allocates and clones again
    pub fn forget_virtual_machine(&mut self) {
        self.proxmox_machine.spec.virtual_machine_id = None;
        if let Some(status) = self.proxmox_machine.status.as_mut() {
            status.proxmox_node = None;
        }
        self.virtual_machine = None;
    }

    /// Record the provider ID derived from the BIOS UUID
    pub fn set_provider_id(&mut self, bios_uuid: &str) {
        if bios_uuid.is_empty() {
            return;
        }
        self.proxmox_machine.spec.provider_id = Some(format!("{PROVIDER_ID_PREFIX}{bios_uuid}"));
    }

    /// Record a pending remote task
    pub fn set_task_ref(&mut self, upid: impl Into<String>) {
        self.proxmox_machine.status_mut().task_ref = Some(upid.into());
    }

    /// Record the terminal failure reason
    pub fn set_failure_reason(&mut self, reason: MachineStatusError) {
        self.proxmox_machine.status_mut().failure_reason = Some(reason);
    }

    /// Record the terminal failure message
    pub fn set_failure_message(&mut self, err: &Error) {
        self.proxmox_machine.status_mut().failure_message = Some(err.to_string());
    }

    /// Record a terminal failure: reason, message and a False condition
    pub fn record_failure(
        &mut self,
        reason: MachineStatusError,
        err: &Error,
        condition_reason: Option<&str>,
    ) {
        self.set_failure_reason(reason);
        self.set_failure_message(err);
        if let Some(condition_reason) = condition_reason {
            self.mark_provisioned_false(condition_reason, ConditionSeverity::Error, err.to_string());
        }
    }

    /// Set the VMProvisioned condition to False
    pub fn mark_provisioned_false(
        &mut self,
        reason: &str,
        severity: ConditionSeverity,
        message: impl Into<String>,
    ) -> bool {
        conditions::mark_false(
            &mut self.proxmox_machine.status_mut().conditions,
            conditions::VM_PROVISIONED_CONDITION,
            reason,
            severity,
            message,
        )
    }

    /// Conditions of the machine
    pub fn conditions(&self) -> &[Condition] {
        self.proxmox_machine
            .status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    /// Replace the reportable addresses
    pub fn set_addresses(&mut self, addresses: Vec<MachineAddress>) {
        self.proxmox_machine.status_mut().addresses = addresses;
    }

    /// Reference to the ProxmoxMachine for events
    pub fn object_ref(&self) -> ObjectReference {
        self.proxmox_machine.object_ref(&())
    }
}
