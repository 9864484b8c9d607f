//! Synchronization round data model
//!
//! A [`SyncRound`] tracks one attempt to roll out a model version. It is
//! created by the trainer at round start and dropped when the round commits
//! or aborts; it is never partially applied.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::quorum::{QuorumRatio, QuorumTally};
use crate::traits::{ParticipantId, Role};
use crate::version::ModelVersion;

/// Round identifier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RoundId(pub u64);

impl RoundId {
    /// The identifier of the following round
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl core::fmt::Display for RoundId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Per-participant acknowledgement state within a round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    /// Notified, no answer yet
    Pending,
    /// Replied success
    Acked,
    /// Replied failure or timed out
    Failed,
    /// Channel errored; excluded from the quorum denominator
    Unreachable,
}

/// Coordinator state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Waiting for a trigger
    Idle,
    /// Running one training step
    Training,
    /// Publishing the new artifact
    Publishing,
    /// Waiting on predictors to fetch and stage the artifact
    NotifyingPredictors,
    /// Waiting on gateways to pause their workers
    NotifyingGateways,
    /// Releasing gateways and committing the version
    AwaitingResumeAck,
    /// Unwinding a failed round
    Aborting,
}

impl CoordinatorState {
    /// Stable name for logs and metrics
    pub fn as_str(self) -> &'static str {
        match self {
            CoordinatorState::Idle => "idle",
            CoordinatorState::Training => "training",
            CoordinatorState::Publishing => "publishing",
            CoordinatorState::NotifyingPredictors => "notifying-predictors",
            CoordinatorState::NotifyingGateways => "notifying-gateways",
            CoordinatorState::AwaitingResumeAck => "awaiting-resume-ack",
            CoordinatorState::Aborting => "aborting",
        }
    }
}

/// One in-progress rollout attempt
#[derive(Debug, Clone)]
pub struct SyncRound {
    /// Round identifier
    pub id: RoundId,
    /// Version being rolled out
    pub target: ModelVersion,
    /// Version every participant held when the round started
    pub previous: ModelVersion,
    /// Hard deadline for the whole round
    pub deadline: Instant,
    acks: BTreeMap<ParticipantId, (Role, AckState)>,
}

impl SyncRound {
    /// Start a round over a registry snapshot
    pub fn new(
        id: RoundId,
        previous: ModelVersion,
        target: ModelVersion,
        round_deadline: Duration,
        participants: impl IntoIterator<Item = (ParticipantId, Role)>,
    ) -> Self {
        Self {
            id,
            target,
            previous,
            deadline: Instant::now() + round_deadline,
            acks: participants
                .into_iter()
                .map(|(id, role)| (id, (role, AckState::Pending)))
                .collect(),
        }
    }

    /// Deadline for one phase: `now + per_phase`, capped by the round deadline
    pub fn phase_deadline(&self, per_phase: Duration) -> Instant {
        (Instant::now() + per_phase).min(self.deadline)
    }

    /// Whether the round deadline has passed
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Participants of a role in the snapshot
    pub fn participants(&self, role: Role) -> impl Iterator<Item = ParticipantId> + '_ {
        self.acks
            .iter()
            .filter(move |(_, (r, _))| *r == role)
            .map(|(id, _)| *id)
    }

    /// Record a participant's answer. Only the first answer per participant counts.
    pub fn record(&mut self, participant: ParticipantId, state: AckState) -> bool {
        match self.acks.get_mut(&participant) {
            Some((_, current)) if *current == AckState::Pending => {
                *current = state;
                true
            }
            _ => false,
        }
    }

    /// Current ack state of a participant
    pub fn ack_state(&self, participant: ParticipantId) -> Option<AckState> {
        self.acks.get(&participant).map(|(_, s)| *s)
    }

    /// Tally for one role; pending participants count as not yet answered
    pub fn tally(&self, role: Role) -> QuorumTally {
        let mut tally = QuorumTally::new(0);
        for (r, state) in self.acks.values() {
            if *r != role {
                continue;
            }
            tally.total += 1;
            match state {
                AckState::Acked => tally.ack(),
                AckState::Failed => tally.fail(),
                AckState::Unreachable => tally.unreachable(),
                AckState::Pending => {}
            }
        }
        tally
    }

    /// Whether every participant of `role` has answered
    pub fn all_answered(&self, role: Role) -> bool {
        self.tally(role).pending() == 0
    }

    /// Whether `role` meets `ratio` with the answers received so far
    pub fn quorum_met(&self, role: Role, ratio: QuorumRatio) -> bool {
        self.tally(role).is_met(ratio)
    }

    /// Mark every still-pending participant of `role` as failed (phase timeout)
    pub fn expire_pending(&mut self, role: Role) -> usize {
        let mut expired = 0;
        for (r, state) in self.acks.values_mut() {
            if *r == role && *state == AckState::Pending {
                *state = AckState::Failed;
                expired += 1;
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: u64) -> ParticipantId {
        ParticipantId(n)
    }

    fn round_with(predictors: u64, gateways: u64) -> SyncRound {
        let participants = (0..predictors)
            .map(|i| (pid(i), Role::Predictor))
            .chain((100..100 + gateways).map(|i| (pid(i), Role::Gateway)));
        SyncRound::new(
            RoundId(1),
            ModelVersion(4),
            ModelVersion(5),
            Duration::from_secs(30),
            participants,
        )
    }

    #[test]
    fn first_answer_wins() {
        let mut round = round_with(1, 0);
        assert!(round.record(pid(0), AckState::Acked));
        assert!(!round.record(pid(0), AckState::Failed));
        assert_eq!(round.ack_state(pid(0)), Some(AckState::Acked));
    }

    #[test]
    fn unknown_participant_is_ignored() {
        let mut round = round_with(1, 0);
        assert!(!round.record(pid(42), AckState::Acked));
    }

    #[test]
    fn tallies_are_per_role() {
        let mut round = round_with(3, 2);
        round.record(pid(0), AckState::Acked);
        round.record(pid(1), AckState::Acked);
        round.record(pid(2), AckState::Failed);
        round.record(pid(100), AckState::Acked);

        let predictors = round.tally(Role::Predictor);
        assert_eq!((predictors.acked, predictors.failed, predictors.total), (2, 1, 3));
        assert!(round.all_answered(Role::Predictor));
        assert!(!round.quorum_met(Role::Predictor, QuorumRatio::default()));

        assert!(!round.all_answered(Role::Gateway));
        assert_eq!(round.expire_pending(Role::Gateway), 1);
        assert_eq!(round.tally(Role::Gateway).failed, 1);
    }

    #[test]
    fn unreachable_shrinks_denominator() {
        let mut round = round_with(3, 0);
        round.record(pid(0), AckState::Acked);
        round.record(pid(1), AckState::Acked);
        round.record(pid(2), AckState::Unreachable);
        assert!(round.quorum_met(Role::Predictor, QuorumRatio::default()));
    }

    #[tokio::test(start_paused = true)]
    async fn phase_deadline_is_capped_by_round_deadline() {
        let round = round_with(0, 0);
        let capped = round.phase_deadline(Duration::from_secs(120));
        assert_eq!(capped, round.deadline);
        let short = round.phase_deadline(Duration::from_secs(1));
        assert!(short < round.deadline);
    }
}
