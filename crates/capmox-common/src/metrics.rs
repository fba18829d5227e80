//! OpenTelemetry metrics for VM reconciliation
//!
//! Instruments live on the global meter. The host process decides whether a
//! meter provider is installed; without one every record is a no-op.

use std::time::Instant;

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

use crate::crd::VirtualMachineView;
use crate::Error;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("capmox"));

/// Histogram of VM reconciliation duration
///
/// Labels:
/// - `outcome`: ready, pending, error
pub static VM_RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("capmox_vm_reconcile_duration_seconds")
        .with_description("Duration of one VM reconciliation pass in seconds")
        .with_unit("s")
        .build()
});

/// Counter of VM reconciliation errors
///
/// Labels:
/// - `error_type`: transient, terminal, invalid
pub static VM_RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("capmox_vm_reconcile_errors_total")
        .with_description("Total number of VM reconciliation errors")
        .with_unit("{errors}")
        .build()
});

/// Counter of clone tasks issued
///
/// Labels:
/// - `node`: node the VM is placed on
pub static VM_CLONES_STARTED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("capmox_vm_clones_started_total")
        .with_description("Total number of VM clone tasks issued")
        .with_unit("{clones}")
        .build()
});

/// Counter of recorded VMs that no node reported, so they were cloned again
pub static VM_LOST: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("capmox_vm_lost_total")
        .with_description("Total number of recorded VMs found on no node")
        .with_unit("{vms}")
        .build()
});

/// Label for how a reconciliation pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The guest finished provisioning
    Ready,
    /// A stage is still waiting on the remote side
    Pending,
    /// A stage failed
    Error,
}

impl ReconcileOutcome {
    /// Outcome of a reconciliation result
    pub fn of(result: &Result<VirtualMachineView, Error>) -> Self {
        match result {
            Ok(view) if view.is_ready() => Self::Ready,
            Ok(_) => Self::Pending,
            Err(_) => Self::Error,
        }
    }

    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Pending => "pending",
            Self::Error => "error",
        }
    }
}

/// Label for the kind of a reconciliation error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    /// Retried on the next requeue
    Transient,
    /// Recorded on the machine; waits for a change
    Terminal,
    /// Invalid configuration; waits for a change
    Invalid,
}

impl ErrorType {
    /// Classify an error the way the requeue policy does
    pub fn of(err: &Error) -> Self {
        if err.is_terminal() {
            Self::Terminal
        } else if err.is_retryable() {
            Self::Transient
        } else {
            Self::Invalid
        }
    }

    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Terminal => "terminal",
            Self::Invalid => "invalid",
        }
    }
}

/// Times one reconciliation pass
pub struct ReconcileTimer {
    start: Instant,
}

impl ReconcileTimer {
    /// Start timing a pass
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Record the pass duration and, on failure, the error kind
    pub fn finish(self, result: &Result<VirtualMachineView, Error>) {
        let outcome = ReconcileOutcome::of(result);
        VM_RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("outcome", outcome.as_str())],
        );
        if let Err(err) = result {
            VM_RECONCILE_ERRORS.add(1, &[KeyValue::new("error_type", ErrorType::of(err).as_str())]);
        }
    }
}

/// Record an issued clone task
pub fn record_clone_started(node: &str) {
    VM_CLONES_STARTED.add(1, &[KeyValue::new("node", node.to_string())]);
}

/// Record a recorded VM that no node reported
pub fn record_vm_lost() {
    VM_LOST.add(1, &[]);
}
