//! Error types for the Proxmox machine reconciler
//!
//! Errors are structured with fields to aid debugging in production. The
//! variants double as the classification the pipeline relies on: lookup
//! outcomes (not found / not initialized / not created), resource
//! exhaustion, terminal provisioning failures, transient preconditions, and
//! plain propagated failures from the remote or Kubernetes APIs.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for reconciler operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A call to the Proxmox API failed
    #[error("proxmox error [{operation}]: {message}")]
    Proxmox {
        /// Remote operation that failed (e.g., "clone", "configure")
        operation: String,
        /// Description of what failed
        message: String,
        /// The remote reported the addressed object as missing
        not_found: bool,
    },

    /// The VM is recorded on the machine but absent on its node
    #[error("vm {vmid} for machine {machine} not found")]
    VmNotFound {
        /// Name of the owning machine
        machine: String,
        /// VMID recorded on the machine
        vmid: u64,
    },

    /// The VM has an identity but cannot be looked up yet
    #[error("vm for machine {machine} is not initialized")]
    VmNotInitialized {
        /// Name of the owning machine
        machine: String,
    },

    /// No VM identity has been recorded for the machine
    #[error("vm for machine {machine} has not been created")]
    VmNotCreated {
        /// Name of the owning machine
        machine: String,
    },

    /// Every VMID of the configured range is taken
    #[error("no free vmid found in vmIDRange [{start}, {end}]")]
    NoVmIdInRangeFree {
        /// First VMID of the range
        start: u64,
        /// Last VMID of the range (inclusive)
        end: u64,
    },

    /// The node scheduler found no node with enough free memory
    #[error("insufficient memory: {message}")]
    InsufficientMemory {
        /// Scheduler explanation
        message: String,
    },

    /// No VM template matches the selector tags
    #[error("no vm template found with tags [{}]", .tags.join(", "))]
    TemplateNotFound {
        /// Tags the template was looked up by
        tags: Vec<String>,
    },

    /// cloud-init reported a terminal failure inside the guest
    #[error("cloud-init failed on vm {vm}: {message}")]
    CloudInitFailed {
        /// Name of the VM
        vm: String,
        /// Failure reported by the guest
        message: String,
    },

    /// A precondition of a stage is not met yet
    #[error("machine {machine} is not ready: {message}")]
    NotReady {
        /// Name of the owning machine
        machine: String,
        /// What is still missing
        message: String,
    },

    /// Validation error for machine or cluster specs
    #[error("validation error for {machine}: {message}")]
    Validation {
        /// Name of the machine with invalid configuration
        machine: String,
        /// Description of what's invalid
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "scope", "context")
        context: String,
    },

    /// Another error wrapped with the operation that produced it
    #[error("{context}: {source}")]
    Context {
        /// Operation description
        context: String,
        /// The wrapped error
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create a Proxmox API error for the given operation
    pub fn proxmox(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Proxmox {
            operation: operation.into(),
            message: msg.into(),
            not_found: false,
        }
    }

    /// Create a Proxmox API error reporting that the addressed object is missing
    pub fn proxmox_not_found(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Proxmox {
            operation: operation.into(),
            message: msg.into(),
            not_found: true,
        }
    }

    /// Create an insufficient-memory scheduling error
    pub fn insufficient_memory(msg: impl Into<String>) -> Self {
        Self::InsufficientMemory {
            message: msg.into(),
        }
    }

    /// Create a not-ready precondition error
    pub fn not_ready(machine: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::NotReady {
            machine: machine.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            machine: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error with machine context
    pub fn validation_for(machine: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            machine: machine.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Wrap this error with a description of the failed operation
    ///
    /// The wrapped variant stays reachable through [`Error::root`], so
    /// classification keeps working on wrapped errors.
    pub fn wrap(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping any context wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if the remote reported the addressed object as missing
    pub fn is_not_found(&self) -> bool {
        match self.root() {
            Error::Proxmox { not_found, .. } => *not_found,
            Error::VmNotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// Check if this error means a capacity limit was hit
    ///
    /// Covers both an exhausted VMID range and a scheduler that found no
    /// node with enough memory.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(
            self.root(),
            Error::NoVmIdInRangeFree { .. } | Error::InsufficientMemory { .. }
        )
    }

    /// Check if this error is a terminal provisioning failure
    ///
    /// Terminal failures are recorded on the owning machine's status and
    /// are not worth retrying until the machine spec changes.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.root(),
            Error::NoVmIdInRangeFree { .. }
                | Error::InsufficientMemory { .. }
                | Error::TemplateNotFound { .. }
                | Error::CloudInitFailed { .. }
        )
    }

    /// Check if this error is retryable
    ///
    /// Terminal provisioning failures and validation errors are not
    /// retryable. Kubernetes errors depend on the status code. Everything
    /// else is expected to clear up on a later reconciliation.
    pub fn is_retryable(&self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match self.root() {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
            ),
            Error::Validation { .. } => false,
            _ => true,
        }
    }

    /// Get the machine name if this error is associated with a specific machine
    pub fn machine(&self) -> Option<&str> {
        match self.root() {
            Error::VmNotFound { machine, .. }
            | Error::VmNotInitialized { machine }
            | Error::VmNotCreated { machine }
            | Error::NotReady { machine, .. }
            | Error::Validation { machine, .. } => Some(machine),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    /// Story: a wrapped error still classifies like the error it wraps
    ///
    /// Stages add operation context before returning, and the requeue
    /// policy must still see the underlying kind.
    #[test]
    fn story_wrapping_preserves_classification() {
        let err = Error::NoVmIdInRangeFree { start: 100, end: 102 }
            .wrap("failed to allocate vmid");
        assert!(err.is_resource_exhausted());
        assert!(err.is_terminal());
        assert!(!err.is_retryable());
        assert!(matches!(err.root(), Error::NoVmIdInRangeFree { .. }));
        assert!(err.to_string().starts_with("failed to allocate vmid: "));
        assert!(err.to_string().contains("[100, 102]"));
    }

    #[test]
    fn story_nested_wrappers_resolve_to_innermost() {
        let err = Error::proxmox_not_found("get_vm", "vm 100 does not exist")
            .wrap("looking up vm")
            .wrap("reconciling machine");
        assert!(err.is_not_found());
        assert!(matches!(err.root(), Error::Proxmox { .. }));
    }

    #[rstest]
    #[case(Error::NoVmIdInRangeFree { start: 1, end: 2 }, false, true)]
    #[case(Error::insufficient_memory("node pve1 has 512MiB free"), false, true)]
    #[case(Error::TemplateNotFound { tags: vec!["k8s".into()] }, false, true)]
    #[case(Error::CloudInitFailed { vm: "m1".into(), message: "status: error".into() }, false, true)]
    #[case(Error::proxmox("clone", "connection reset"), true, false)]
    #[case(Error::not_ready("m1", "no ip address yet"), true, false)]
    #[case(Error::VmNotInitialized { machine: "m1".into() }, true, false)]
    #[case(Error::validation_for("m1", "vm name mismatch"), false, false)]
    #[case(Error::internal("unexpected state"), true, false)]
    fn test_retryable_and_terminal_classification(
        #[case] err: Error,
        #[case] retryable: bool,
        #[case] terminal: bool,
    ) {
        assert_eq!(err.is_retryable(), retryable, "retryable for {err}");
        assert_eq!(err.is_terminal(), terminal, "terminal for {err}");
    }

    #[test]
    fn test_resource_exhaustion_is_distinct_from_generic_errors() {
        assert!(Error::NoVmIdInRangeFree { start: 1, end: 1 }.is_resource_exhausted());
        assert!(Error::insufficient_memory("full").is_resource_exhausted());
        assert!(!Error::proxmox("check_id", "timeout").is_resource_exhausted());
        assert!(!Error::internal("boom").is_resource_exhausted());
    }

    #[test]
    fn test_template_not_found_lists_tags() {
        let err = Error::TemplateNotFound {
            tags: vec!["ubuntu".into(), "v1.31".into()],
        };
        assert_eq!(err.to_string(), "no vm template found with tags [ubuntu, v1.31]");
    }

    #[test]
    fn test_machine_accessor() {
        assert_eq!(
            Error::VmNotCreated {
                machine: "m1".into()
            }
            .machine(),
            Some("m1")
        );
        assert_eq!(
            Error::not_ready("m2", "not running").wrap("addresses").machine(),
            Some("m2")
        );
        assert_eq!(Error::proxmox("clone", "boom").machine(), None);
    }

    #[test]
    fn test_default_contexts() {
        match Error::validation("bad") {
            Error::Validation { machine, .. } => assert_eq!(machine, UNKNOWN_CONTEXT),
            _ => panic!("Expected Validation variant"),
        }
        let err = Error::internal_with_context("scope", "no vm attached");
        assert!(err.to_string().contains("[scope]"));
    }
}
