//! Kubernetes Events on ProxmoxMachines
//!
//! Stages publish through [`EventPublisher`]; the reasons in [`reasons`]
//! name the transition that emitted them. Publishing never fails a
//! reconciliation: a rejected event is logged and dropped.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Sink for machine events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event about `resource_ref`
    ///
    /// `reason` is one of [`reasons`], `action` one of [`actions`]; `note`
    /// carries the human-readable detail such as the VMID or the error.
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by the Kubernetes events API
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Publisher reporting as `controller_name`, with the pod name as the
    /// reporting instance when `POD_NAME` is set
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "dropping machine event");
        }
    }
}

/// Publisher that drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons, one per pipeline transition
pub mod reasons {
    /// Creation stage issued a clone task (Normal)
    pub const CLONE_STARTED: &str = "CloneStarted";
    /// Creation stage failed to allocate, place or clone (Warning)
    pub const CLONE_FAILED: &str = "CloneFailed";
    /// Config stage issued a configure task for drifted settings (Normal)
    pub const CONFIGURE_STARTED: &str = "ConfigureStarted";
    /// Existence check found the VM on another node and recorded it (Normal)
    pub const VM_RELOCATED: &str = "VMRelocated";
    /// Existence check found the recorded VM on no node and dropped its
    /// VMID so the next pass clones again (Warning)
    pub const VM_LOST: &str = "VMLost";
    /// VMID range exhausted or the scheduler found no node with enough
    /// memory; terminal (Warning)
    pub const INSUFFICIENT_RESOURCES: &str = "InsufficientResources";
    /// No template carried the selector tags; terminal (Warning)
    pub const TEMPLATE_NOT_FOUND: &str = "VMTemplateNotFound";
    /// Guest readiness check saw cloud-init fail; terminal (Warning)
    pub const BOOTSTRAP_FAILED: &str = "BootstrapFailed";
    /// Every stage passed for a machine not yet marked ready (Normal)
    pub const VM_READY: &str = "VMReady";
}

/// Event actions
pub mod actions {
    /// Existence checks and readiness
    pub const RECONCILE: &str = "Reconcile";
    /// VMID allocation, placement and cloning
    pub const PROVISION: &str = "Provision";
    /// Pre-boot configuration changes
    pub const CONFIGURE: &str = "Configure";
}
