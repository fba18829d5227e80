//! Boot volume resize before first boot

use tracing::{debug, error};

use capmox_common::Error;

use crate::context::Context;
use crate::scope::MachineScope;

/// Grow the boot volume to its configured size
///
/// Only runs while the VM has never been started; once the guest mounted
/// the volume the resize is not repeated.
pub async fn reconcile_disks(scope: &MachineScope, ctx: &Context) -> Result<(), Error> {
    let Some(disks) = &scope.proxmox_machine.spec.disks else {
        return Ok(());
    };

    let vm = scope.virtual_machine()?;
    if vm.is_running() || scope.proxmox_machine.is_ready() {
        return Ok(());
    }

    if let Some(boot_volume) = &disks.boot_volume {
        let size = boot_volume.format_size();
        debug!(vmid = vm.vmid, disk = %boot_volume.disk, size = %size, "resizing boot volume");
        ctx.proxmox
            .resize_disk(vm, &boot_volume.disk, &size)
            .await
            .map_err(|e| {
                error!(vmid = vm.vmid, disk = %boot_volume.disk, error = %e, "unable to set disk size");
                e.wrap(format!(
                    "unable to resize disk {} of vm {}",
                    boot_volume.disk, vm.vmid
                ))
            })?;
    }

    Ok(())
}
