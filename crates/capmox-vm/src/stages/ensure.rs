//! Existence and creation of the backing VM
//!
//! The lookup outcome decides what happens on this tick:
//!
//! | lookup              | action                                         |
//! |---------------------|------------------------------------------------|
//! | found               | record provider ID, attach VM, proceed         |
//! | `VmNotFound`        | re-resolve the VM's node, return the error     |
//! | `VmNotFound`, no node | forget VMID and node, return the error        |
//! | `VmNotInitialized`  | requeue                                        |
//! | `VmNotCreated`      | allocate, place and clone; requeue             |
//!
//! A clone is asynchronous: the task reference is recorded and the pipeline
//! stops until the task tracker reports it finished.

use kube::runtime::events::EventType;
use tracing::{debug, info, warn};

use capmox_common::crd::{conditions, ConditionSeverity, MachineStatusError, NodeLocation};
use capmox_common::events::{actions, reasons};
use capmox_common::{metrics, Error};

use crate::context::Context;
use crate::proxmox::{VirtualMachine, VmCloneRequest, VmCloneResponse};
use crate::scope::MachineScope;
use crate::stages::vmid::allocate_vmid;
use crate::stages::StageOutcome;

/// Make sure the machine has a VM, creating one when none was recorded
pub async fn ensure_virtual_machine(
    scope: &mut MachineScope,
    ctx: &Context,
) -> Result<StageOutcome, Error> {
    if scope.proxmox_machine.task_ref().is_some() {
        return Ok(StageOutcome::Requeue);
    }

    let lookup = find_vm(scope, ctx).await;
    match lookup {
        Ok(vm) => {
            if let Some(uuid) = extract_uuid(&vm.config.smbios1) {
                scope.set_provider_id(uuid);
            }
            scope.set_virtual_machine(vm);
            Ok(StageOutcome::Proceed)
        }
        Err(err) if matches!(err.root(), Error::VmNotFound { .. }) => {
            let located = update_vm_location(scope, ctx).await;
            match located {
                Ok(()) => Err(err),
                // nothing pending and no node has it, so the clone never landed
                Err(lost) if matches!(lost.root(), Error::Proxmox { not_found: true, .. }) => {
                    forget_lost_vm(scope, ctx).await?;
                    Err(err)
                }
                Err(lost) => Err(lost.wrap("error trying to locate vm")),
            }
        }
        Err(err) if matches!(err.root(), Error::VmNotInitialized { .. }) => {
            debug!("vm not initialized yet");
            Ok(StageOutcome::Requeue)
        }
        Err(err) if matches!(err.root(), Error::VmNotCreated { .. }) => {
            create_virtual_machine(scope, ctx).await
        }
        Err(err) => Err(err),
    }
}

/// Look up the machine's VM on its node
pub async fn find_vm(scope: &MachineScope, ctx: &Context) -> Result<VirtualMachine, Error> {
    let name = scope.name();
    let vmid = scope
        .virtual_machine_id()
        .ok_or_else(|| Error::VmNotCreated {
            machine: name.clone(),
        })?;
    let node = scope
        .proxmox_machine
        .node()
        .ok_or_else(|| Error::VmNotInitialized {
            machine: name.clone(),
        })?;

    let vm = ctx.proxmox.get_vm(node, vmid).await.map_err(|e| {
        if e.is_not_found() {
            Error::VmNotFound {
                machine: name.clone(),
                vmid,
            }
        } else {
            e.wrap(format!("unable to get vm {vmid} on node {node}"))
        }
    })?;

    if vm.name != name {
        return Err(Error::validation_for(
            &name,
            format!("expected vm name to match {name} but it was {}", vm.name),
        ));
    }

    Ok(vm)
}

/// Find the VM anywhere in the cluster and record the node it lives on
async fn update_vm_location(scope: &mut MachineScope, ctx: &Context) -> Result<(), Error> {
    let name = scope.name();
    let vmid = scope
        .virtual_machine_id()
        .ok_or_else(|| Error::VmNotCreated {
            machine: name.clone(),
        })?;

    let resource = ctx.proxmox.find_vm_resource(vmid).await?;
    if resource.name != name {
        return Err(Error::validation_for(
            &name,
            format!(
                "vm {vmid} belongs to {} instead of {name}",
                resource.name
            ),
        ));
    }

    info!(vmid, node = %resource.node, "vm found on another node");
    scope.proxmox_machine.status_mut().proxmox_node = Some(resource.node.clone());

    let control_plane = scope.is_control_plane();
    if scope
        .proxmox_cluster
        .update_node_location(&name, &resource.node, control_plane)
    {
        ctx.kube.patch_cluster_status(&scope.proxmox_cluster).await?;
        ctx.events
            .publish(
                &scope.object_ref(),
                EventType::Normal,
                reasons::VM_RELOCATED,
                actions::RECONCILE,
                Some(format!("VM {vmid} is on node {}", resource.node)),
            )
            .await;
    }

    Ok(())
}

/// Drop a VM that exists on no node so the next tick allocates a fresh VMID
async fn forget_lost_vm(scope: &mut MachineScope, ctx: &Context) -> Result<(), Error> {
    let name = scope.name();
    let vmid = scope.virtual_machine_id().unwrap_or_default();
    warn!(vmid, "vm missing from every node, forgetting it");
    metrics::record_vm_lost();

    scope.forget_virtual_machine();
    let control_plane = scope.is_control_plane();
    if scope.proxmox_cluster.remove_node_location(&name, control_plane) {
        ctx.kube
            .patch_cluster_status(&scope.proxmox_cluster)
            .await
            .map_err(|e| e.wrap("failed to persist node location"))?;
    }

    ctx.events
        .publish(
            &scope.object_ref(),
            EventType::Warning,
            reasons::VM_LOST,
            actions::RECONCILE,
            Some(format!("VM {vmid} was not found on any node")),
        )
        .await;
    Ok(())
}

async fn create_virtual_machine(
    scope: &mut MachineScope,
    ctx: &Context,
) -> Result<StageOutcome, Error> {
    // only set when absent so repeated clone errors don't move the transition time
    if !conditions::has(scope.conditions(), conditions::VM_PROVISIONED_CONDITION) {
        scope.mark_provisioned_false(conditions::CLONING_REASON, ConditionSeverity::Info, "");
    }

    let created = create_vm(scope, ctx).await;
    let (response, node) = match created {
        Ok(created) => created,
        Err(err) => {
            if !matches!(err.root(), Error::TemplateNotFound { .. }) {
                scope.mark_provisioned_false(
                    conditions::CLONING_FAILED_REASON,
                    ConditionSeverity::Warning,
                    err.to_string(),
                );
            }
            warn!(error = %err, "failed to clone vm");
            ctx.events
                .publish(
                    &scope.object_ref(),
                    EventType::Warning,
                    reasons::CLONE_FAILED,
                    actions::PROVISION,
                    Some(err.to_string()),
                )
                .await;
            return Err(err);
        }
    };

    info!(
        vmid = response.new_id,
        node = %node,
        task = %response.task.upid,
        "clone task created"
    );

    metrics::record_clone_started(&node);

    // recorded before the cluster patch so a failed patch never leads to a second clone
    scope.set_task_ref(response.task.upid.clone());
    scope.set_virtual_machine_id(response.new_id);
    scope.proxmox_machine.status_mut().proxmox_node = Some(node.clone());

    let control_plane = scope.is_control_plane();
    scope.proxmox_cluster.add_node_location(
        NodeLocation {
            machine: scope.name(),
            node: node.clone(),
        },
        control_plane,
    );

    ctx.events
        .publish(
            &scope.object_ref(),
            EventType::Normal,
            reasons::CLONE_STARTED,
            actions::PROVISION,
            Some(format!("Cloning VM {} on node {node}", response.new_id)),
        )
        .await;

    ctx.kube
        .patch_cluster_status(&scope.proxmox_cluster)
        .await
        .map_err(|e| e.wrap("failed to persist node location"))?;

    Ok(StageOutcome::Requeue)
}

/// Allocate, place and clone; returns the clone response and the VM's node
async fn create_vm(
    scope: &mut MachineScope,
    ctx: &Context,
) -> Result<(VmCloneResponse, String), Error> {
    let allocated = allocate_vmid(scope, ctx).await;
    let new_id = match allocated {
        Ok(vmid) => vmid,
        Err(err) => {
            if err.is_resource_exhausted() {
                record_terminal_failure(
                    scope,
                    ctx,
                    MachineStatusError::InsufficientResources,
                    reasons::INSUFFICIENT_RESOURCES,
                    &err,
                    None,
                )
                .await;
            }
            return Err(err);
        }
    };

    let spec = &scope.proxmox_machine.spec;
    let mut request = VmCloneRequest {
        node: spec.source_node.clone().unwrap_or_default(),
        new_id,
        name: scope.name(),
        description: spec.description.clone(),
        format: spec.format.map(|f| f.as_str().to_string()),
        full: spec.full,
        pool: spec.pool.clone(),
        snap_name: spec.snap_name.clone(),
        storage: spec.storage.clone(),
        target: spec.target.clone(),
    };

    let wants_scheduling = spec.target.is_none()
        && (!scope.proxmox_cluster.spec.allowed_nodes.is_empty() || !spec.allowed_nodes.is_empty());
    if wants_scheduling {
        let scheduled = select_next_node(scope, ctx).await;
        match scheduled {
            Ok(node) => {
                debug!(node = %node, "scheduled vm");
                request.target = Some(node);
            }
            Err(err) => {
                if err.is_resource_exhausted() {
                    record_terminal_failure(
                        scope,
                        ctx,
                        MachineStatusError::InsufficientResources,
                        reasons::INSUFFICIENT_RESOURCES,
                        &err,
                        None,
                    )
                    .await;
                }
                return Err(err);
            }
        }
    }

    let template_id = match scope.proxmox_machine.template_id() {
        Some(id) => id,
        None => {
            let tags = scope.proxmox_machine.template_selector_tags();
            match ctx.proxmox.find_vm_template_by_tags(&tags).await {
                Ok((node, id)) => {
                    request.node = node;
                    id
                }
                Err(err) => {
                    if matches!(err.root(), Error::TemplateNotFound { .. }) {
                        record_terminal_failure(
                            scope,
                            ctx,
                            MachineStatusError::VmTemplateNotFound,
                            reasons::TEMPLATE_NOT_FOUND,
                            &err,
                            Some(conditions::VM_PROVISION_FAILED_REASON),
                        )
                        .await;
                    }
                    return Err(err);
                }
            }
        }
    };

    if request.node.is_empty() {
        return Err(Error::validation_for(
            scope.name(),
            "no source node configured for the template",
        ));
    }

    let response = ctx
        .proxmox
        .clone_vm(template_id, &request)
        .await
        .map_err(|e| e.wrap(format!("failed to clone template {template_id}")))?;

    let node = request.target.unwrap_or(request.node);
    Ok((response, node))
}

async fn select_next_node(scope: &MachineScope, ctx: &Context) -> Result<String, Error> {
    let scheduler = ctx.scheduler.as_ref().ok_or_else(|| {
        Error::validation_for(
            scope.name(),
            "allowed nodes set but no node scheduler configured",
        )
    })?;
    scheduler.schedule_vm(scope).await
}

async fn record_terminal_failure(
    scope: &mut MachineScope,
    ctx: &Context,
    reason: MachineStatusError,
    event_reason: &str,
    err: &Error,
    condition_reason: Option<&str>,
) {
    scope.record_failure(reason, err, condition_reason);
    ctx.events
        .publish(
            &scope.object_ref(),
            EventType::Warning,
            event_reason,
            actions::PROVISION,
            Some(err.to_string()),
        )
        .await;
}

/// BIOS UUID from an SMBIOS settings string such as
/// `uuid=0b7e2d3c-...,manufacturer=QEMU`
pub fn extract_uuid(smbios1: &str) -> Option<&str> {
    smbios1
        .split(',')
        .find_map(|part| part.trim().strip_prefix("uuid="))
        .filter(|uuid| !uuid.is_empty())
}
