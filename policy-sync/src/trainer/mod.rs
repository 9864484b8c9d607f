//! Trainer side: the synchronization leader.

mod coordinator;
mod discovery;
mod registry;
mod train;

pub use coordinator::{
    Coordinator, CoordinatorStats, HeartbeatSummary, RoundError, RoundOutcome,
};
pub use discovery::{Discovery, StaticDiscovery};
pub use registry::{Health, Participant, ParticipantRegistry, Reply};
pub use train::{TrainError, Trainer};
