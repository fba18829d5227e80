//! Fixtures shared by the unit tests of this crate

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::api::ObjectMeta;

use capmox_common::crd::{
    Machine, MachineSpec, ProxmoxCluster, ProxmoxClusterSpec, ProxmoxMachine, ProxmoxMachineSpec,
    CLUSTER_NAME_LABEL,
};

use crate::context::{Context, MachineReconciler, MockMachineReconciler};
use crate::kube_client::KubeClient;
use crate::proxmox::{ProxmoxClient, VirtualMachine, VirtualMachineConfig};
use crate::scope::MachineScope;
use crate::stages::StageOutcome;

pub const MACHINE: &str = "workload-cp-0";
pub const NAMESPACE: &str = "default";
pub const CLUSTER: &str = "workload";

fn meta(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(NAMESPACE.to_string()),
        labels: Some(BTreeMap::from([(
            CLUSTER_NAME_LABEL.to_string(),
            CLUSTER.to_string(),
        )])),
        ..Default::default()
    }
}

pub fn proxmox_machine(spec: ProxmoxMachineSpec) -> ProxmoxMachine {
    let mut machine = ProxmoxMachine::new(MACHINE, spec);
    machine.metadata = meta(MACHINE);
    machine
}

pub fn sibling(name: &str, vmid: Option<u64>) -> ProxmoxMachine {
    let mut machine = ProxmoxMachine::new(
        name,
        ProxmoxMachineSpec {
            virtual_machine_id: vmid,
            ..Default::default()
        },
    );
    machine.metadata = meta(name);
    machine
}

pub fn scope_with(spec: ProxmoxMachineSpec) -> MachineScope {
    let mut machine = Machine::new(
        MACHINE,
        MachineSpec {
            cluster_name: CLUSTER.to_string(),
            version: None,
        },
    );
    machine.metadata = meta(MACHINE);

    let mut cluster = ProxmoxCluster::new(CLUSTER, ProxmoxClusterSpec::default());
    cluster.metadata.namespace = Some(NAMESPACE.to_string());

    MachineScope::new(machine, proxmox_machine(spec), cluster)
}

pub fn sample_scope() -> MachineScope {
    scope_with(ProxmoxMachineSpec {
        source_node: Some("pve1".into()),
        template_id: Some(9000),
        ..Default::default()
    })
}

pub fn stopped_vm() -> VirtualMachine {
    VirtualMachine {
        name: MACHINE.to_string(),
        vmid: 100,
        node: "pve1".to_string(),
        status: "stopped".to_string(),
        config: VirtualMachineConfig {
            sockets: 1,
            cores: 2,
            memory: 2048,
            smbios1: "uuid=0b7e2d3c-1111-4222-8333-944455556666".to_string(),
            ..Default::default()
        },
    }
}

pub fn running_vm() -> VirtualMachine {
    VirtualMachine {
        status: "running".to_string(),
        ..stopped_vm()
    }
}

pub fn proceeding_reconciler() -> Arc<dyn MachineReconciler> {
    let mut mock = MockMachineReconciler::new();
    mock.expect_reconcile()
        .returning(|_| Ok(StageOutcome::Proceed));
    Arc::new(mock)
}

pub fn idle_reconciler() -> Arc<dyn MachineReconciler> {
    let mut mock = MockMachineReconciler::new();
    mock.expect_reconcile().never();
    Arc::new(mock)
}

pub fn context(proxmox: impl ProxmoxClient + 'static, kube: impl KubeClient + 'static) -> Context {
    Context::for_testing(
        Arc::new(proxmox),
        Arc::new(kube),
        idle_reconciler(),
        idle_reconciler(),
        idle_reconciler(),
    )
}
