//! Guest readiness: QEMU agent and cloud-init completion

use kube::runtime::events::EventType;
use tracing::{debug, warn};

use capmox_common::crd::{conditions, ConditionSeverity, MachineStatusError};
use capmox_common::events::{actions, reasons};
use capmox_common::Error;

use crate::context::Context;
use crate::scope::MachineScope;
use crate::stages::StageOutcome;

/// Device the cloud-init ISO is attached to
pub const CLOUD_INIT_ISO_DEVICE: &str = "ide0";

/// Wait for the guest agent and for cloud-init to finish
///
/// A cloud-init failure inside the guest is terminal: it is recorded on the
/// machine as `BootstrapFailed` and returned. Every other error is left to
/// the caller's retry.
pub async fn check_cloud_init_status(
    scope: &mut MachineScope,
    ctx: &Context,
) -> Result<StageOutcome, Error> {
    if !scope.is_vm_running() {
        return Ok(StageOutcome::Requeue);
    }
    let vm = scope.virtual_machine()?;

    if !scope.proxmox_machine.skip_qemu_guest_check() {
        ctx.proxmox
            .qemu_agent_status(vm)
            .await
            .map_err(|e| e.wrap("error waiting for agent"))?;
    }

    if scope.proxmox_machine.skip_cloud_init_check() {
        return Ok(StageOutcome::Proceed);
    }

    let vmid = vm.vmid;
    let status = ctx.proxmox.cloud_init_status(vm).await;
    match status {
        Ok(true) => {
            debug!(vmid, "cloud-init still running");
            Ok(StageOutcome::Requeue)
        }
        Ok(false) => Ok(StageOutcome::Proceed),
        Err(err) if matches!(err.root(), Error::CloudInitFailed { .. }) => {
            warn!(vmid, error = %err, "cloud-init failed");
            let changed = scope.mark_provisioned_false(
                conditions::VM_PROVISION_FAILED_REASON,
                ConditionSeverity::Error,
                err.to_string(),
            );
            scope.set_failure_message(&err);
            scope.set_failure_reason(MachineStatusError::BootstrapFailed);
            if changed {
                ctx.events
                    .publish(
                        &scope.object_ref(),
                        EventType::Warning,
                        reasons::BOOTSTRAP_FAILED,
                        actions::PROVISION,
                        Some(err.to_string()),
                    )
                    .await;
            }
            Err(err)
        }
        Err(err) => Err(err),
    }
}

/// Eject the cloud-init ISO
pub async fn unmount_cloud_init_iso(scope: &MachineScope, ctx: &Context) -> Result<(), Error> {
    let vm = scope.virtual_machine()?;
    ctx.proxmox
        .unmount_cloud_init_iso(vm, CLOUD_INIT_ISO_DEVICE)
        .await
}
