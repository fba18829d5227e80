//! VM reconciliation entry point
//!
//! [`reconcile_vm`] walks the pipeline once per tick. Every stage is
//! idempotent, so the whole sequence is re-run from the start on the next
//! tick; the first stage that requeues or fails ends the call.

use std::time::Duration;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use tracing::{debug, info, instrument};

use capmox_common::crd::{VirtualMachineState, VirtualMachineView};
use capmox_common::events::{actions, reasons};
use capmox_common::metrics::ReconcileTimer;
use capmox_common::Error;

use crate::context::Context;
use crate::scope::MachineScope;
use crate::stages::addresses::reconcile_machine_addresses;
use crate::stages::cloud_init::{check_cloud_init_status, unmount_cloud_init_iso};
use crate::stages::config::reconcile_vm_config;
use crate::stages::disks::reconcile_disks;
use crate::stages::ensure::ensure_virtual_machine;

/// Requeue interval while the VM is pending or after a retryable error
pub const DEFAULT_REQUEUE: Duration = Duration::from_secs(10);

/// Drive the machine's VM one step closer to its desired state
///
/// Returns a pending view while any stage is still waiting on the remote
/// side, and a ready view once the guest finished provisioning. Errors are
/// returned as-is; [`next_action`] maps the outcome to a requeue decision.
/// The caller persists `scope.proxmox_machine` afterwards in every case.
#[instrument(skip(scope, ctx), fields(machine = %scope.name()))]
pub async fn reconcile_vm(
    scope: &mut MachineScope,
    ctx: &Context,
) -> Result<VirtualMachineView, Error> {
    let timer = ReconcileTimer::start();
    let result = run_stages(scope, ctx).await;
    timer.finish(&result);
    result
}

async fn run_stages(scope: &mut MachineScope, ctx: &Context) -> Result<VirtualMachineView, Error> {
    let mut view = VirtualMachineView::pending(scope.name());

    if ctx.tasks.reconcile_in_flight_task(scope).await? {
        debug!("task in flight");
        return Ok(view);
    }

    if ensure_virtual_machine(scope, ctx).await?.is_requeue() {
        return Ok(view);
    }

    if reconcile_vm_config(scope, ctx).await?.is_requeue() {
        return Ok(view);
    }

    reconcile_disks(scope, ctx).await?;

    for sibling in [&ctx.ip_addresses, &ctx.bootstrap_data, &ctx.power_state] {
        if sibling.reconcile(scope).await?.is_requeue() {
            return Ok(view);
        }
    }

    reconcile_machine_addresses(scope)?;

    if check_cloud_init_status(scope, ctx).await?.is_requeue() {
        return Ok(view);
    }

    if scope.machine.is_bootstrap_ready() && scope.machine.has_node_ref() {
        unmount_cloud_init_iso(scope, ctx).await.map_err(|e| {
            e.wrap(format!(
                "failed to unmount cloud-init iso for vm {}",
                scope.name()
            ))
        })?;
    }

    if !scope.proxmox_machine.is_ready() {
        info!("vm ready");
        ctx.events
            .publish(
                &scope.object_ref(),
                EventType::Normal,
                reasons::VM_READY,
                actions::RECONCILE,
                None,
            )
            .await;
    }

    view.state = VirtualMachineState::Ready;
    Ok(view)
}

/// Requeue decision for a reconciliation outcome
///
/// Terminal failures wait for the machine to change: they are recorded on
/// its status and re-surface on the next spec update.
pub fn next_action(result: &Result<VirtualMachineView, Error>) -> Action {
    match result {
        Ok(view) if view.is_ready() => Action::await_change(),
        Ok(_) => Action::requeue(DEFAULT_REQUEUE),
        Err(err) if err.is_retryable() => Action::requeue(DEFAULT_REQUEUE),
        Err(_) => Action::await_change(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use capmox_common::crd::{
        IpAddress, IpPoolConfig, MachineStatus, NodeReference, ProxmoxMachineSpec, VmIdRange,
        DEFAULT_NETWORK_DEVICE,
    };

    use crate::context::{MockInFlightTaskTracker, MockMachineReconciler};
    use crate::kube_client::MockKubeClient;
    use crate::proxmox::{MockProxmoxClient, Task, TaskState, VirtualMachine, VmCloneResponse};
    use crate::stages::StageOutcome;
    use crate::test_support::{
        context, idle_reconciler, proceeding_reconciler, running_vm, scope_with, stopped_vm,
    };

    fn ready_scope() -> MachineScope {
        let mut scope = scope_with(ProxmoxMachineSpec {
            source_node: Some("pve1".into()),
            template_id: Some(9000),
            virtual_machine_id: Some(100),
            ..Default::default()
        });
        scope.proxmox_cluster.spec.ipv4_config = Some(IpPoolConfig::default());
        scope.proxmox_machine.status_mut().ip_addresses.insert(
            DEFAULT_NETWORK_DEVICE.to_string(),
            IpAddress {
                ipv4: Some("10.0.0.10".into()),
                ipv6: None,
            },
        );
        scope
    }

    fn healthy_guest(proxmox: &mut MockProxmoxClient) {
        proxmox.expect_get_vm().returning(|_, _| Ok(running_vm()));
        proxmox.expect_qemu_agent_status().returning(|_| Ok(()));
        proxmox.expect_cloud_init_status().returning(|_| Ok(false));
    }

    fn full_context(proxmox: MockProxmoxClient) -> Context {
        Context::for_testing(
            Arc::new(proxmox),
            Arc::new(MockKubeClient::new()),
            proceeding_reconciler(),
            proceeding_reconciler(),
            proceeding_reconciler(),
        )
    }

    #[tokio::test]
    async fn story_in_flight_task_short_circuits() {
        let mut tasks = MockInFlightTaskTracker::new();
        tasks.expect_reconcile_in_flight_task().returning(|_| Ok(true));
        let mut proxmox = MockProxmoxClient::new();
        proxmox.expect_get_vm().never();

        let mut ctx = context(proxmox, MockKubeClient::new());
        ctx.tasks = Arc::new(tasks);

        let mut scope = ready_scope();
        let view = reconcile_vm(&mut scope, &ctx).await.unwrap();
        assert_eq!(view.state, VirtualMachineState::Pending);
        assert_eq!(view.name, "workload-cp-0");
    }

    #[tokio::test]
    async fn story_task_tracker_error_is_returned() {
        let mut tasks = MockInFlightTaskTracker::new();
        tasks
            .expect_reconcile_in_flight_task()
            .returning(|_| Err(Error::proxmox("get_task", "unreachable")));

        let mut ctx = context(MockProxmoxClient::new(), MockKubeClient::new());
        ctx.tasks = Arc::new(tasks);

        let mut scope = ready_scope();
        assert!(reconcile_vm(&mut scope, &ctx).await.is_err());
    }

    /// Story: a fresh machine with a VMID range is cloned on the first tick
    /// and configured on the second
    #[tokio::test]
    async fn story_clone_then_configure_across_ticks() {
        let mut proxmox = MockProxmoxClient::new();
        proxmox
            .expect_check_id()
            .withf(|vmid| *vmid == 100)
            .times(1)
            .returning(|_| Ok(true));
        proxmox
            .expect_clone_vm()
            .times(1)
            .withf(|template, request| *template == 9000 && request.new_id == Some(100))
            .returning(|_, _| {
                Ok(VmCloneResponse {
                    new_id: 100,
                    task: Task::running("UPID:pve1:clone"),
                })
            });
        proxmox.expect_get_task().returning(|upid| {
            Ok(Task {
                upid: upid.to_string(),
                state: TaskState::Succeeded,
                exit_status: Some("OK".into()),
            })
        });
        proxmox
            .expect_get_vm()
            .withf(|node, vmid| node == "pve1" && *vmid == 100)
            .returning(|_, _| Ok(stopped_vm()));
        proxmox
            .expect_configure_vm()
            .times(1)
            .returning(|_, _| Ok(Task::running("UPID:pve1:config")));

        let mut kube = MockKubeClient::new();
        kube.expect_list_proxmox_machines().returning(|_, _| Ok(vec![]));
        kube.expect_patch_cluster_status().returning(|_| Ok(()));

        let ctx = context(proxmox, kube);
        let mut scope = scope_with(ProxmoxMachineSpec {
            source_node: Some("pve1".into()),
            template_id: Some(9000),
            vmid_range: Some(VmIdRange { start: 100, end: 102 }),
            num_cores: 4,
            ..Default::default()
        });

        let first = reconcile_vm(&mut scope, &ctx).await;
        assert_eq!(next_action(&first), Action::requeue(DEFAULT_REQUEUE));
        assert_eq!(first.unwrap().state, VirtualMachineState::Pending);
        assert_eq!(scope.proxmox_machine.task_ref(), Some("UPID:pve1:clone"));
        assert_eq!(scope.virtual_machine_id(), Some(100));

        let second = reconcile_vm(&mut scope, &ctx).await.unwrap();
        assert_eq!(second.state, VirtualMachineState::Pending);
        assert_eq!(scope.proxmox_machine.task_ref(), Some("UPID:pve1:config"));
    }

    /// Story: a clone task that fails remotely is retried with a fresh VMID
    /// once the lost VM has been forgotten
    #[tokio::test]
    async fn story_failed_clone_task_is_retried_with_fresh_vmid() {
        let collided = Arc::new(AtomicBool::new(false));
        let mut proxmox = MockProxmoxClient::new();

        let taken = collided.clone();
        proxmox
            .expect_check_id()
            .returning(move |vmid| Ok(!(vmid == 100 && taken.load(Ordering::SeqCst))));
        proxmox.expect_clone_vm().times(2).returning(|_, request| {
            let vmid = request.new_id.unwrap_or_default();
            Ok(VmCloneResponse {
                new_id: vmid,
                task: Task::running(format!("UPID:pve1:clone-{vmid}")),
            })
        });
        let failed = collided.clone();
        proxmox.expect_get_task().returning(move |upid| {
            if upid.ends_with("clone-100") {
                failed.store(true, Ordering::SeqCst);
                return Ok(Task {
                    upid: upid.to_string(),
                    state: TaskState::Failed,
                    exit_status: Some("VM 100 already exists".into()),
                });
            }
            Ok(Task {
                upid: upid.to_string(),
                state: TaskState::Succeeded,
                exit_status: Some("OK".into()),
            })
        });
        proxmox.expect_get_vm().returning(|node, vmid| {
            if vmid == 101 {
                Ok(VirtualMachine {
                    vmid,
                    ..stopped_vm()
                })
            } else {
                Err(Error::proxmox_not_found(
                    "get_vm",
                    format!("vm {vmid} not found on {node}"),
                ))
            }
        });
        proxmox.expect_find_vm_resource().returning(|vmid| {
            Err(Error::proxmox_not_found(
                "cluster_resources",
                format!("vm {vmid} missing"),
            ))
        });
        proxmox
            .expect_configure_vm()
            .times(1)
            .returning(|_, _| Ok(Task::running("UPID:pve1:config")));

        let mut kube = MockKubeClient::new();
        kube.expect_list_proxmox_machines().returning(|_, _| Ok(vec![]));
        kube.expect_patch_cluster_status().returning(|_| Ok(()));

        let ctx = context(proxmox, kube);
        let mut scope = scope_with(ProxmoxMachineSpec {
            source_node: Some("pve1".into()),
            template_id: Some(9000),
            vmid_range: Some(VmIdRange { start: 100, end: 102 }),
            num_cores: 4,
            ..Default::default()
        });

        let cloned = reconcile_vm(&mut scope, &ctx).await.unwrap();
        assert_eq!(cloned.state, VirtualMachineState::Pending);
        assert_eq!(scope.virtual_machine_id(), Some(100));

        let failed = reconcile_vm(&mut scope, &ctx).await;
        assert!(failed
            .as_ref()
            .unwrap_err()
            .to_string()
            .contains("VM 100 already exists"));
        assert_eq!(next_action(&failed), Action::requeue(DEFAULT_REQUEUE));
        assert_eq!(scope.proxmox_machine.task_ref(), None);

        let lost = reconcile_vm(&mut scope, &ctx).await;
        assert!(matches!(lost, Err(Error::VmNotFound { vmid: 100, .. })));
        assert_eq!(next_action(&lost), Action::requeue(DEFAULT_REQUEUE));
        assert_eq!(scope.virtual_machine_id(), None);

        let recloned = reconcile_vm(&mut scope, &ctx).await.unwrap();
        assert_eq!(recloned.state, VirtualMachineState::Pending);
        assert_eq!(scope.virtual_machine_id(), Some(101));
        assert_eq!(scope.proxmox_machine.task_ref(), Some("UPID:pve1:clone-101"));

        reconcile_vm(&mut scope, &ctx).await.unwrap();
        assert_eq!(scope.proxmox_machine.task_ref(), Some("UPID:pve1:config"));
    }

    #[tokio::test]
    async fn story_sibling_requeue_stops_the_pipeline() {
        let mut proxmox = MockProxmoxClient::new();
        proxmox.expect_get_vm().returning(|_, _| Ok(running_vm()));
        proxmox.expect_qemu_agent_status().never();

        let mut ip = MockMachineReconciler::new();
        ip.expect_reconcile().times(1).returning(|_| Ok(StageOutcome::Requeue));

        let ctx = Context::for_testing(
            Arc::new(proxmox),
            Arc::new(MockKubeClient::new()),
            Arc::new(ip),
            idle_reconciler(),
            idle_reconciler(),
        );

        let mut scope = ready_scope();
        let view = reconcile_vm(&mut scope, &ctx).await.unwrap();
        assert_eq!(view.state, VirtualMachineState::Pending);
    }

    #[tokio::test]
    async fn story_provisioned_guest_is_ready() {
        let mut proxmox = MockProxmoxClient::new();
        healthy_guest(&mut proxmox);
        proxmox.expect_unmount_cloud_init_iso().never();

        let mut scope = ready_scope();
        let result = reconcile_vm(&mut scope, &full_context(proxmox)).await;

        assert_eq!(next_action(&result), Action::await_change());
        assert!(result.unwrap().is_ready());
        assert_eq!(
            scope.proxmox_machine.status.as_ref().unwrap().addresses.len(),
            2
        );
    }

    #[tokio::test]
    async fn story_joined_node_gets_iso_unmounted() {
        let mut proxmox = MockProxmoxClient::new();
        healthy_guest(&mut proxmox);
        proxmox
            .expect_unmount_cloud_init_iso()
            .times(1)
            .returning(|_, _| Ok(()));

        let mut scope = ready_scope();
        scope.machine.status = Some(MachineStatus {
            bootstrap_ready: true,
            node_ref: Some(NodeReference {
                name: "workload-cp-0".into(),
            }),
        });

        let view = reconcile_vm(&mut scope, &full_context(proxmox)).await.unwrap();
        assert!(view.is_ready());
    }

    #[tokio::test]
    async fn story_unmount_failure_is_surfaced() {
        let mut proxmox = MockProxmoxClient::new();
        healthy_guest(&mut proxmox);
        proxmox
            .expect_unmount_cloud_init_iso()
            .returning(|_, _| Err(Error::proxmox("unmount", "device busy")));

        let mut scope = ready_scope();
        scope.machine.status = Some(MachineStatus {
            bootstrap_ready: true,
            node_ref: Some(NodeReference {
                name: "workload-cp-0".into(),
            }),
        });

        let err = reconcile_vm(&mut scope, &full_context(proxmox))
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .starts_with("failed to unmount cloud-init iso for vm workload-cp-0"));
    }

    #[tokio::test]
    async fn story_missing_address_fails_the_tick() {
        let mut proxmox = MockProxmoxClient::new();
        proxmox.expect_get_vm().returning(|_, _| Ok(running_vm()));
        proxmox.expect_qemu_agent_status().never();

        let mut scope = ready_scope();
        scope
            .proxmox_machine
            .status_mut()
            .ip_addresses
            .clear();

        let result = reconcile_vm(&mut scope, &full_context(proxmox)).await;
        assert!(matches!(result, Err(Error::NotReady { .. })));
        assert_eq!(next_action(&result), Action::requeue(DEFAULT_REQUEUE));
    }

    #[test]
    fn test_next_action_policy() {
        let pending = Ok(VirtualMachineView::pending("m1"));
        assert_eq!(next_action(&pending), Action::requeue(DEFAULT_REQUEUE));

        let ready = Ok(VirtualMachineView {
            name: "m1".into(),
            state: VirtualMachineState::Ready,
        });
        assert_eq!(next_action(&ready), Action::await_change());

        let transient = Err(Error::proxmox("clone", "connection reset"));
        assert_eq!(next_action(&transient), Action::requeue(DEFAULT_REQUEUE));

        let terminal = Err(Error::NoVmIdInRangeFree { start: 100, end: 102 });
        assert_eq!(next_action(&terminal), Action::await_change());

        let invalid = Err(Error::validation_for("m1", "vm name mismatch"));
        assert_eq!(next_action(&invalid), Action::await_change());
    }
}
