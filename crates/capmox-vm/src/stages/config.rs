//! Pre-boot configuration convergence

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
use tracing::{debug, info};

use capmox_common::crd::ProxmoxMachineSpec;
use capmox_common::events::{actions, reasons};
use capmox_common::Error;

use crate::context::Context;
use crate::proxmox::{VirtualMachineConfig, VirtualMachineOption};
use crate::scope::MachineScope;
use crate::stages::network::{network_options, should_update_network_devices};
use crate::stages::StageOutcome;

const OPTION_SOCKETS: &str = "sockets";
const OPTION_CORES: &str = "cores";
const OPTION_MEMORY: &str = "memory";
const OPTION_TAGS: &str = "tags";
const OPTION_DESCRIPTION: &str = "description";

/// Options needed to bring the observed config to the desired spec
///
/// Hardware values count only when set (> 0). Tags are only ever appended:
/// the result keeps the remote order and adds missing desired tags at the
/// end. An empty result means the VM is converged.
pub fn build_vm_options(
    spec: &ProxmoxMachineSpec,
    observed: &VirtualMachineConfig,
) -> Vec<VirtualMachineOption> {
    let mut options = Vec::new();

    for (name, desired, current) in [
        (OPTION_SOCKETS, spec.num_sockets, observed.sockets),
        (OPTION_CORES, spec.num_cores, observed.cores),
        (OPTION_MEMORY, spec.memory_mib, observed.memory),
    ] {
        if desired > 0 && desired != current {
            options.push(VirtualMachineOption::new(name, desired));
        }
    }

    if let Some(description) = &spec.description {
        if *description != observed.description {
            options.push(VirtualMachineOption::new(OPTION_DESCRIPTION, description));
        }
    }

    if let Some(network) = &spec.network {
        if should_update_network_devices(network, &observed.nets) {
            options.extend(network_options(network));
        }
    }

    let mut tags = observed.split_tags();
    let before = tags.len();
    for tag in &spec.tags {
        if !tags.contains(tag) {
            tags.push(tag.clone());
        }
    }
    if tags.len() > before {
        options.push(VirtualMachineOption::new(OPTION_TAGS, tags.join(";")));
    }

    options
}

/// Converge hardware, description, network and tags before first boot
///
/// Issues at most one configure call and records its task; the pipeline
/// stops until the task finished.
pub async fn reconcile_vm_config(
    scope: &mut MachineScope,
    ctx: &Context,
) -> Result<StageOutcome, Error> {
    let vm = scope.virtual_machine()?;
    if vm.is_running() || scope.proxmox_machine.is_ready() {
        return Ok(StageOutcome::Proceed);
    }

    let options = build_vm_options(&scope.proxmox_machine.spec, &vm.config);
    if options.is_empty() {
        debug!(vmid = vm.vmid, "vm config converged");
        return Ok(StageOutcome::Proceed);
    }

    let names: Vec<&str> = options.iter().map(|o| o.name.as_str()).collect();
    info!(vmid = vm.vmid, options = ?names, "reconciling virtual machine config");

    let task = ctx
        .proxmox
        .configure_vm(vm, &options)
        .await
        .map_err(|e| e.wrap(format!("failed to configure VM {}", scope.name())))?;

    let object_ref: ObjectReference = scope.object_ref();
    scope.set_task_ref(task.upid.clone());
    ctx.events
        .publish(
            &object_ref,
            EventType::Normal,
            reasons::CONFIGURE_STARTED,
            actions::CONFIGURE,
            Some(format!("Updating {}", names.join(", "))),
        )
        .await;

    Ok(StageOutcome::Requeue)
}
