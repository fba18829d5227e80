//! Controller context and the collaborator seams of the pipeline
//!
//! The context is shared across all reconciliation calls and holds the
//! clients and sibling reconcilers the stages call into. Every collaborator
//! is a trait object so tests can swap in mocks.

use std::sync::Arc;

use async_trait::async_trait;
use kube::Client;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use capmox_common::events::{EventPublisher, KubeEventPublisher};
use capmox_common::{Error, FIELD_MANAGER};

use crate::kube_client::{KubeClient, KubeClientImpl};
use crate::proxmox::{ProxmoxClient, TaskState};
use crate::scope::MachineScope;
use crate::stages::StageOutcome;

/// Tracks the asynchronous remote task recorded on a machine
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InFlightTaskTracker: Send + Sync {
    /// Returns true while the recorded task is still running remotely
    ///
    /// Implementations clear the task reference once the task finished.
    async fn reconcile_in_flight_task(&self, scope: &mut MachineScope) -> Result<bool, Error>;
}

/// Picks the node a new VM is placed on
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeScheduler: Send + Sync {
    /// Select a node; fails with [`Error::InsufficientMemory`] when no
    /// allowed node has room for the machine
    async fn schedule_vm(&self, scope: &MachineScope) -> Result<String, Error>;
}

/// A sibling reconciler run as one pipeline stage (IP addresses,
/// bootstrap data, power state)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachineReconciler: Send + Sync {
    /// Run the stage; [`StageOutcome::Requeue`] stops the pipeline for this tick
    async fn reconcile(&self, scope: &mut MachineScope) -> Result<StageOutcome, Error>;
}

/// Task tracker backed by the remote task API
pub struct ProxmoxTaskTracker {
    proxmox: Arc<dyn ProxmoxClient>,
}

impl ProxmoxTaskTracker {
    /// Create a tracker polling tasks through the given client
    pub fn new(proxmox: Arc<dyn ProxmoxClient>) -> Self {
        Self { proxmox }
    }
}

#[async_trait]
impl InFlightTaskTracker for ProxmoxTaskTracker {
    async fn reconcile_in_flight_task(&self, scope: &mut MachineScope) -> Result<bool, Error> {
        let Some(upid) = scope.proxmox_machine.task_ref().map(str::to_string) else {
            return Ok(false);
        };

        let task = self
            .proxmox
            .get_task(&upid)
            .await
            .map_err(|e| e.wrap(format!("unable to get task {upid}")))?;

        match task.state {
            TaskState::Running => {
                debug!(task = %upid, "task still running");
                Ok(true)
            }
            TaskState::Succeeded => {
                debug!(task = %upid, "task finished");
                scope.proxmox_machine.status_mut().task_ref = None;
                Ok(false)
            }
            TaskState::Failed => {
                let exit_status = task.exit_status.unwrap_or_default();
                warn!(task = %upid, exit_status = %exit_status, "task failed");
                scope.proxmox_machine.status_mut().task_ref = None;
                Err(Error::proxmox("task", exit_status).wrap(format!("task {upid} failed")))
            }
        }
    }
}

/// Shared context for the ProxmoxMachine reconciler
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client, proxmox)
///     .scheduler(scheduler)
///     .ip_addresses(ipam)
///     .bootstrap_data(bootstrap)
///     .power_state(power)
///     .build()?;
/// ```
pub struct Context {
    /// Proxmox VE API client
    pub proxmox: Arc<dyn ProxmoxClient>,
    /// Kubernetes object store (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// In-flight task tracker
    pub tasks: Arc<dyn InFlightTaskTracker>,
    /// Node scheduler; only needed when machines declare allowed nodes
    pub scheduler: Option<Arc<dyn NodeScheduler>>,
    /// IP address reconciler
    pub ip_addresses: Arc<dyn MachineReconciler>,
    /// Bootstrap data reconciler
    pub bootstrap_data: Arc<dyn MachineReconciler>,
    /// Power state reconciler
    pub power_state: Arc<dyn MachineReconciler>,
    /// Event publisher for ProxmoxMachine events
    pub events: Arc<dyn EventPublisher>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, proxmox: Arc<dyn ProxmoxClient>) -> ContextBuilder {
        ContextBuilder::new(client, proxmox)
    }

    /// Create a context for testing with mock collaborators
    ///
    /// Uses the remote client for task tracking, has no scheduler and
    /// publishes no events.
    #[cfg(test)]
    pub fn for_testing(
        proxmox: Arc<dyn ProxmoxClient>,
        kube: Arc<dyn KubeClient>,
        ip_addresses: Arc<dyn MachineReconciler>,
        bootstrap_data: Arc<dyn MachineReconciler>,
        power_state: Arc<dyn MachineReconciler>,
    ) -> Self {
        Self {
            tasks: Arc::new(ProxmoxTaskTracker::new(proxmox.clone())),
            proxmox,
            kube,
            scheduler: None,
            ip_addresses,
            bootstrap_data,
            power_state,
            events: Arc::new(capmox_common::events::NoopEventPublisher),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    proxmox: Arc<dyn ProxmoxClient>,
    kube: Option<Arc<dyn KubeClient>>,
    tasks: Option<Arc<dyn InFlightTaskTracker>>,
    scheduler: Option<Arc<dyn NodeScheduler>>,
    ip_addresses: Option<Arc<dyn MachineReconciler>>,
    bootstrap_data: Option<Arc<dyn MachineReconciler>>,
    power_state: Option<Arc<dyn MachineReconciler>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl ContextBuilder {
    fn new(client: Client, proxmox: Arc<dyn ProxmoxClient>) -> Self {
        Self {
            client,
            proxmox,
            kube: None,
            tasks: None,
            scheduler: None,
            ip_addresses: None,
            bootstrap_data: None,
            power_state: None,
            events: None,
        }
    }

    /// Override the Kubernetes object store (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the in-flight task tracker
    pub fn task_tracker(mut self, tasks: Arc<dyn InFlightTaskTracker>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    /// Set the node scheduler
    pub fn scheduler(mut self, scheduler: Arc<dyn NodeScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Set the IP address reconciler
    pub fn ip_addresses(mut self, reconciler: Arc<dyn MachineReconciler>) -> Self {
        self.ip_addresses = Some(reconciler);
        self
    }

    /// Set the bootstrap data reconciler
    pub fn bootstrap_data(mut self, reconciler: Arc<dyn MachineReconciler>) -> Self {
        self.bootstrap_data = Some(reconciler);
        self
    }

    /// Set the power state reconciler
    pub fn power_state(mut self, reconciler: Arc<dyn MachineReconciler>) -> Self {
        self.power_state = Some(reconciler);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    ///
    /// Fails with a validation error when one of the sibling reconcilers
    /// was not provided.
    pub fn build(self) -> Result<Context, Error> {
        let missing = |what: &str| Error::validation(format!("no {what} reconciler configured"));

        Ok(Context {
            tasks: self
                .tasks
                .unwrap_or_else(|| Arc::new(ProxmoxTaskTracker::new(self.proxmox.clone()))),
            proxmox: self.proxmox,
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            scheduler: self.scheduler,
            ip_addresses: self.ip_addresses.ok_or_else(|| missing("ip address"))?,
            bootstrap_data: self.bootstrap_data.ok_or_else(|| missing("bootstrap data"))?,
            power_state: self.power_state.ok_or_else(|| missing("power state"))?,
            events: self
                .events
                .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(self.client, FIELD_MANAGER))),
        })
    }
}
