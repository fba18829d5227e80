//! Reconciliation core for ProxmoxMachine virtual machines
//!
//! Drives the VM backing a ProxmoxMachine through a fixed sequence of
//! idempotent stages: existence and creation, pre-boot configuration, disk
//! resize, IP addresses, bootstrap data, power state, reportable addresses
//! and guest readiness. Each call makes at most one step of remote progress
//! and reports whether the caller should requeue.
//!
//! The remote hypervisor, the Kubernetes object store and the sibling
//! reconcilers are reached through the traits in [`proxmox`],
//! [`kube_client`] and [`context`].

#![deny(missing_docs)]

pub mod context;
pub mod kube_client;
pub mod proxmox;
pub mod reconcile;
pub mod scope;
pub mod stages;

#[cfg(test)]
mod test_support;

pub use context::{
    Context, ContextBuilder, InFlightTaskTracker, MachineReconciler, NodeScheduler,
    ProxmoxTaskTracker,
};
pub use reconcile::{next_action, reconcile_vm, DEFAULT_REQUEUE};
pub use scope::MachineScope;
pub use stages::StageOutcome;
