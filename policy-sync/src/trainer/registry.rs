//! Participants the trainer currently believes are reachable.

use std::collections::{BTreeMap, BTreeSet};

use futures::future;
use tokio::time::Instant;

use policy_sync_core::traits::{ParticipantId, Role};
use policy_sync_net::protocol::{Envelope, SyncMessage};
use policy_sync_net::traits::{Connector, Endpoint, HeartbeatChannel, RecvMode};

/// What came back from one participant in an exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Answered(SyncMessage),
    /// Connected, but no matching reply before the deadline
    TimedOut,
    /// Could not connect, send or receive
    Unreachable,
}

/// Result of recording a failed contact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Unhealthy { consecutive_failures: u32 },
    Removed,
}

/// One registered predictor or gateway
pub struct Participant {
    pub id: ParticipantId,
    pub role: Role,
    pub endpoint: Endpoint,
    channel: Option<Box<dyn HeartbeatChannel>>,
    consecutive_failures: u32,
}

impl std::fmt::Debug for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Participant")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("endpoint", &self.endpoint)
            .field("connected", &self.channel.is_some())
            .field("consecutive_failures", &self.consecutive_failures)
            .finish()
    }
}

impl Participant {
    /// No failure since the last successful contact
    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures == 0
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    async fn channel(&mut self, connector: &dyn Connector) -> Option<&mut Box<dyn HeartbeatChannel>> {
        if self.channel.is_none() {
            match connector.connect(&self.endpoint).await {
                Ok(channel) => {
                    tracing::info!(participant = %self.id, endpoint = %self.endpoint, "reconnected");
                    self.channel = Some(channel);
                }
                Err(e) => {
                    tracing::debug!(participant = %self.id, error = %e, "reconnect failed");
                    return None;
                }
            }
        }
        self.channel.as_mut()
    }

    /// Send `request` and wait for its answer until `deadline`
    async fn request(&mut self, connector: &dyn Connector, request: &Envelope, deadline: Instant) -> Reply {
        if self.channel(connector).await.is_none() {
            return Reply::Unreachable;
        }
        let Some(mut channel) = self.channel.take() else {
            return Reply::Unreachable;
        };
        let reply = await_reply(&mut *channel, self.id, request, deadline).await;
        if !matches!(reply, Reply::Unreachable) {
            self.channel = Some(channel);
        }
        reply
    }
}

async fn await_reply(
    channel: &mut dyn HeartbeatChannel,
    id: ParticipantId,
    request: &Envelope,
    deadline: Instant,
) -> Reply {
    if let Err(e) = channel.send(request).await {
        tracing::debug!(participant = %id, error = %e, "send failed");
        return Reply::Unreachable;
    }
    loop {
        let wait = deadline.saturating_duration_since(Instant::now());
        match channel.recv(RecvMode::Timeout(wait)).await {
            Ok(Some(env)) if request.is_answered_by(&env) => return Reply::Answered(env.message),
            Ok(Some(env)) => {
                tracing::debug!(
                    participant = %id,
                    round = env.round,
                    seq = env.sequence,
                    "discarding stale reply"
                );
            }
            Ok(None) => return Reply::TimedOut,
            Err(e) => {
                tracing::debug!(participant = %id, error = %e, "receive failed");
                return Reply::Unreachable;
            }
        }
    }
}

/// Registry of participants, mutated only by the coordinator
#[derive(Debug)]
pub struct ParticipantRegistry {
    entries: BTreeMap<ParticipantId, Participant>,
    next_id: u64,
    next_sequence: u64,
    max_failures: u32,
}

impl ParticipantRegistry {
    /// `max_failures` consecutive failed contacts remove a participant
    pub fn new(max_failures: u32) -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 0,
            next_sequence: 0,
            max_failures: max_failures.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of participants with `role`
    pub fn count(&self, role: Role) -> usize {
        self.entries.values().filter(|p| p.role == role).count()
    }

    pub fn contains_endpoint(&self, endpoint: &Endpoint) -> bool {
        self.entries.values().any(|p| &p.endpoint == endpoint)
    }

    pub fn get(&self, id: ParticipantId) -> Option<&Participant> {
        self.entries.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.entries.values()
    }

    /// Register a freshly connected participant
    pub fn add(
        &mut self,
        role: Role,
        endpoint: Endpoint,
        channel: Box<dyn HeartbeatChannel>,
    ) -> ParticipantId {
        let id = ParticipantId(self.next_id);
        self.next_id += 1;
        tracing::info!(participant = %id, %role, %endpoint, "participant registered");
        self.entries.insert(
            id,
            Participant {
                id,
                role,
                endpoint,
                channel: Some(channel),
                consecutive_failures: 0,
            },
        );
        id
    }

    pub fn remove(&mut self, id: ParticipantId) -> Option<Participant> {
        self.entries.remove(&id)
    }

    /// Every participant, in id order
    pub fn ids(&self) -> Vec<ParticipantId> {
        self.entries.keys().copied().collect()
    }

    /// `(id, role)` pairs for a round snapshot
    pub fn snapshot(&self) -> Vec<(ParticipantId, Role)> {
        self.entries.values().map(|p| (p.id, p.role)).collect()
    }

    pub fn record_success(&mut self, id: ParticipantId) {
        if let Some(p) = self.entries.get_mut(&id) {
            p.consecutive_failures = 0;
        }
    }

    /// Mark a failed contact: drop the channel, and remove the participant
    /// after too many failures in a row.
    pub fn record_failure(&mut self, id: ParticipantId) -> Option<Health> {
        let p = self.entries.get_mut(&id)?;
        p.channel = None;
        p.consecutive_failures += 1;
        if p.consecutive_failures < self.max_failures {
            return Some(Health::Unhealthy {
                consecutive_failures: p.consecutive_failures,
            });
        }
        let removed = self.entries.remove(&id)?;
        tracing::warn!(
            participant = %id,
            role = %removed.role,
            endpoint = %removed.endpoint,
            "participant removed after repeated failures"
        );
        Some(Health::Removed)
    }

    fn next_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    /// Send `message` to every participant in `ids` and collect matching
    /// replies until `deadline`.
    ///
    /// Participants are asked concurrently and each reply is taken as soon as
    /// it arrives. Replies to earlier requests are discarded. No wait outlives
    /// the deadline; every participant in `ids` gets an entry.
    pub async fn exchange(
        &mut self,
        connector: &dyn Connector,
        ids: &[ParticipantId],
        message: SyncMessage,
        round: u64,
        deadline: Instant,
    ) -> BTreeMap<ParticipantId, Reply> {
        let wanted: BTreeSet<ParticipantId> = ids.iter().copied().collect();
        let mut replies: BTreeMap<ParticipantId, Reply> = wanted
            .iter()
            .filter(|id| !self.entries.contains_key(id))
            .map(|&id| (id, Reply::Unreachable))
            .collect();

        let first_sequence = self.next_sequence + 1;
        self.next_sequence += wanted.len() as u64;
        let requests = self
            .entries
            .values_mut()
            .filter(|p| wanted.contains(&p.id))
            .zip(first_sequence..)
            .map(|(participant, sequence)| {
                let request = Envelope::new(message.clone())
                    .with_round(round)
                    .with_sequence(sequence);
                async move {
                    let reply = participant.request(connector, &request, deadline).await;
                    (participant.id, reply)
                }
            });
        replies.extend(future::join_all(requests).await);
        replies
    }

    /// Fire-and-forget `message` to `ids`. Returns those that could not be reached.
    pub async fn broadcast(
        &mut self,
        connector: &dyn Connector,
        ids: &[ParticipantId],
        message: SyncMessage,
        round: u64,
    ) -> Vec<ParticipantId> {
        let mut unreachable = Vec::new();
        for &id in ids {
            let envelope = Envelope::new(message.clone())
                .with_round(round)
                .with_sequence(self.next_sequence());
            let Some(participant) = self.entries.get_mut(&id) else {
                continue;
            };
            let sent = match participant.channel(connector).await {
                Some(channel) => channel.send(&envelope).await.is_ok(),
                None => false,
            };
            if !sent {
                participant.channel = None;
                unreachable.push(id);
            }
        }
        unreachable
    }
}
