//! VMID allocation within a machine's configured range

use std::collections::BTreeSet;

use tracing::debug;

use capmox_common::crd::VmIdRange;
use capmox_common::Error;

use crate::context::Context;
use crate::scope::MachineScope;

/// Pick the VMID for a new clone
///
/// Returns `None` when no range is configured, leaving the choice to the
/// remote side. Otherwise returns the lowest ID of the range that no
/// sibling machine records and that the remote reports free.
pub async fn allocate_vmid(scope: &MachineScope, ctx: &Context) -> Result<Option<u64>, Error> {
    match scope.proxmox_machine.spec.vmid_range {
        Some(range) if range.is_configured() => {
            next_free_vmid_from_range(scope, ctx, range).await.map(Some)
        }
        _ => Ok(None),
    }
}

async fn next_free_vmid_from_range(
    scope: &MachineScope,
    ctx: &Context,
    range: VmIdRange,
) -> Result<u64, Error> {
    let used = used_vmids(scope, ctx).await?;

    for vmid in (range.start..=range.end).filter(|id| !used.contains(id)) {
        if ctx.proxmox.check_id(vmid).await? {
            debug!(vmid, "allocated vmid from range");
            return Ok(vmid);
        }
    }

    Err(Error::NoVmIdInRangeFree {
        start: range.start,
        end: range.end,
    })
}

/// VMIDs recorded by the machines of the scope's cluster
///
/// Always read from a fresh list: sibling reconciliations claim IDs
/// concurrently.
pub async fn used_vmids(scope: &MachineScope, ctx: &Context) -> Result<BTreeSet<u64>, Error> {
    let namespace = scope.namespace()?;
    let cluster_name = scope.cluster_name()?;
    let machines = ctx
        .kube
        .list_proxmox_machines(&namespace, &cluster_name)
        .await?;

    Ok(machines
        .iter()
        .filter_map(|m| m.virtual_machine_id())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube_client::MockKubeClient;
    use crate::proxmox::MockProxmoxClient;
    use crate::test_support::{context, scope_with, sibling, CLUSTER, NAMESPACE};
    use capmox_common::crd::ProxmoxMachineSpec;
    use rstest::rstest;
    use std::sync::{Arc, Mutex};

    fn ranged_scope(start: u64, end: u64) -> MachineScope {
        scope_with(ProxmoxMachineSpec {
            vmid_range: Some(VmIdRange { start, end }),
            ..Default::default()
        })
    }

    fn kube_with_used(used: Vec<Option<u64>>) -> MockKubeClient {
        let mut kube = MockKubeClient::new();
        kube.expect_list_proxmox_machines()
            .withf(|ns, cluster| ns == NAMESPACE && cluster == CLUSTER)
            .returning(move |_, _| {
                Ok(used
                    .iter()
                    .enumerate()
                    .map(|(i, id)| sibling(&format!("sibling-{i}"), *id))
                    .collect())
            });
        kube
    }

    #[rstest]
    #[case::no_range(None)]
    #[case::open_start(Some(VmIdRange { start: 0, end: 110 }))]
    #[case::open_end(Some(VmIdRange { start: 100, end: 0 }))]
    #[tokio::test]
    async fn story_unconfigured_range_leaves_choice_to_remote(#[case] range: Option<VmIdRange>) {
        let mut proxmox = MockProxmoxClient::new();
        proxmox.expect_check_id().never();
        let mut kube = MockKubeClient::new();
        kube.expect_list_proxmox_machines().never();

        let scope = scope_with(ProxmoxMachineSpec {
            vmid_range: range,
            ..Default::default()
        });
        let vmid = allocate_vmid(&scope, &context(proxmox, kube)).await.unwrap();
        assert_eq!(vmid, None);
    }

    #[rstest]
    #[case::empty_used_set(vec![], 100)]
    #[case::skips_used(vec![Some(100), Some(101)], 102)]
    #[case::ignores_unset_ids(vec![None, Some(0), Some(100)], 101)]
    #[case::gap_in_used(vec![Some(100), Some(102)], 101)]
    #[tokio::test]
    async fn story_lowest_unused_vmid_wins(#[case] used: Vec<Option<u64>>, #[case] expected: u64) {
        let mut proxmox = MockProxmoxClient::new();
        proxmox.expect_check_id().returning(|_| Ok(true));

        let scope = ranged_scope(100, 105);
        let vmid = allocate_vmid(&scope, &context(proxmox, kube_with_used(used)))
            .await
            .unwrap();
        assert_eq!(vmid, Some(expected));
    }

    #[tokio::test]
    async fn story_remotely_taken_ids_are_skipped() {
        let checked = Arc::new(Mutex::new(Vec::new()));
        let seen = checked.clone();
        let mut proxmox = MockProxmoxClient::new();
        proxmox.expect_check_id().returning(move |id| {
            seen.lock().unwrap().push(id);
            Ok(id == 103)
        });

        let scope = ranged_scope(100, 105);
        let vmid = allocate_vmid(&scope, &context(proxmox, kube_with_used(vec![Some(101)])))
            .await
            .unwrap();

        assert_eq!(vmid, Some(103));
        assert_eq!(*checked.lock().unwrap(), vec![100, 102, 103]);
    }

    #[rstest]
    #[case::all_used(vec![Some(100), Some(101), Some(102)], false)]
    #[case::none_free_remotely(vec![], false)]
    #[case::mixed(vec![Some(101)], false)]
    #[tokio::test]
    async fn story_exhausted_range_is_resource_exhaustion(
        #[case] used: Vec<Option<u64>>,
        #[case] remote_free: bool,
    ) {
        let mut proxmox = MockProxmoxClient::new();
        proxmox.expect_check_id().returning(move |_| Ok(remote_free));

        let scope = ranged_scope(100, 102);
        let err = allocate_vmid(&scope, &context(proxmox, kube_with_used(used)))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::NoVmIdInRangeFree {
                start: 100,
                end: 102
            }
        ));
        assert!(err.is_resource_exhausted());
    }

    #[tokio::test]
    async fn story_check_error_stops_the_scan() {
        let mut proxmox = MockProxmoxClient::new();
        proxmox
            .expect_check_id()
            .times(1)
            .returning(|_| Err(Error::proxmox("check_id", "connection reset")));

        let scope = ranged_scope(100, 105);
        let err = allocate_vmid(&scope, &context(proxmox, kube_with_used(vec![])))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Proxmox { .. }));
        assert!(!err.is_resource_exhausted());
    }

    #[tokio::test]
    async fn story_list_failure_propagates() {
        let mut proxmox = MockProxmoxClient::new();
        proxmox.expect_check_id().never();
        let mut kube = MockKubeClient::new();
        kube.expect_list_proxmox_machines()
            .returning(|_, _| Err(Error::internal("list failed")));

        let scope = ranged_scope(100, 105);
        assert!(allocate_vmid(&scope, &context(proxmox, kube)).await.is_err());
    }
}
