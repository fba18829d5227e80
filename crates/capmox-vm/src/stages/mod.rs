//! Pipeline stages
//!
//! Each stage returns `Result<StageOutcome, Error>`:
//! - `Ok(Proceed)`: the stage is converged, continue with the next one
//! - `Ok(Requeue)`: the stage is waiting on the remote side, stop for this tick
//! - `Err(_)`: the stage failed, stop for this tick
//!
//! Stages never sleep or retry internally; every "try again" is a requeue
//! returned to the caller.

pub mod addresses;
pub mod cloud_init;
pub mod config;
pub mod disks;
pub mod ensure;
pub mod network;
pub mod vmid;

/// Progress signal of a single pipeline stage
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageOutcome {
    /// Converged; continue with the next stage
    Proceed,
    /// Not ready yet; stop and re-enter on the next tick
    Requeue,
}

impl StageOutcome {
    /// True when the pipeline has to stop for this tick
    pub fn is_requeue(self) -> bool {
        self == StageOutcome::Requeue
    }
}
