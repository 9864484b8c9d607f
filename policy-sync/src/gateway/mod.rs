//! Gateway side of the protocol.
//!
//! Episode workers share a [`BarrierController`] and park at safe points while
//! a round is pending. The [`GatewayAgent`] answers the trainer: it pauses the
//! workers on a version-change request, reports whether a quorum is parked,
//! and resumes everyone when the round ends.

mod agent;
mod barrier;
mod filter;

pub use agent::{GatewayAgent, GatewayStats};
pub use barrier::{
    BarrierController, BarrierSnapshot, Checkpoint, SafePoint, WorkerHandle, WorkerId,
    WorkerPauseState,
};
pub use filter::SampleFilter;
