//! Per-worker pause/resume barrier.
//!
//! Each live episode worker holds a [`WorkerHandle`] and polls it at safe
//! points. When a round is pending the worker moves itself from `running` to
//! `pause-requested`; the controller counts it as `paused` the next time the
//! state is observed and keeps it parked until [`BarrierController::resume_all`].
//!
//! Invariants:
//! - a worker is counted toward `paused` at most once per round
//! - a worker that leaves is removed from `total` (and from `paused` if counted)
//! - `resume_all` is the only operation that resets the counters

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::time::{timeout_at, Instant};

use policy_sync_core::config::TriggerMode;
use policy_sync_core::quorum::QuorumRatio;
use policy_sync_core::version::{ModelVersion, SharedVersion};

/// Pause state of one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPauseState {
    Running,
    PauseRequested,
    Paused,
}

/// Where in its loop a worker is polling the barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafePoint {
    /// Between two environment steps
    Step,
    /// After an episode finished
    EpisodeEnd,
}

/// Identifier of a registered worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

/// Counter snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierSnapshot {
    pub paused: usize,
    pub total: usize,
    /// Whether a round is pending
    pub armed: bool,
}

/// What a worker should do after [`WorkerHandle::checkpoint`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    /// No round pending; carry on
    Continue,
    /// Was paused and has been resumed; `version` is the gateway's version now
    Resumed { version: ModelVersion },
    /// Paused longer than the configured limit and released itself
    Released,
}

#[derive(Debug, Clone, Copy)]
struct ResumeSignal {
    epoch: u64,
    version: ModelVersion,
}

#[derive(Debug)]
struct BarrierState {
    workers: HashMap<WorkerId, WorkerPauseState>,
    paused: usize,
    armed: bool,
    epoch: u64,
    next_id: u64,
}

/// Gateway-side barrier shared by all episode workers
#[derive(Debug)]
pub struct BarrierController {
    state: Mutex<BarrierState>,
    mode: TriggerMode,
    ratio: QuorumRatio,
    pause_limit: Duration,
    version: SharedVersion,
    progress: Notify,
    resumed: watch::Sender<ResumeSignal>,
}

impl BarrierController {
    /// Create a controller. In boundary modes the barrier starts armed.
    pub fn new(
        mode: TriggerMode,
        ratio: QuorumRatio,
        pause_limit: Duration,
        version: SharedVersion,
    ) -> Self {
        let (resumed, _) = watch::channel(ResumeSignal {
            epoch: 0,
            version: version.current(),
        });
        Self {
            state: Mutex::new(BarrierState {
                workers: HashMap::new(),
                paused: 0,
                armed: mode.is_boundary(),
                epoch: 0,
                next_id: 0,
            }),
            mode,
            ratio,
            pause_limit,
            version,
            progress: Notify::new(),
            resumed,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new episode worker
    pub fn register(self: &Arc<Self>) -> WorkerHandle {
        let id = {
            let mut state = self.lock();
            let id = WorkerId(state.next_id);
            state.next_id += 1;
            state.workers.insert(id, WorkerPauseState::Running);
            id
        };
        tracing::debug!(worker = id.0, "worker registered");
        WorkerHandle {
            id,
            controller: Arc::clone(self),
            resumed: self.resumed.subscribe(),
        }
    }

    /// Whether a worker at `point` should stop there (polled flag)
    fn pause_wanted(&self, state: &BarrierState, point: SafePoint) -> bool {
        state.armed
            && match self.mode {
                TriggerMode::Interval | TriggerMode::StepBoundary => true,
                TriggerMode::EpisodeBoundary => point == SafePoint::EpisodeEnd,
            }
    }

    /// Called by a worker at its own safe boundary. Returns the resume epoch to
    /// wait past, or `None` if no pause is wanted.
    pub fn request_pause(&self, id: WorkerId, point: SafePoint) -> Option<u64> {
        let epoch = {
            let mut state = self.lock();
            if !self.pause_wanted(&state, point) {
                return None;
            }
            let epoch = state.epoch;
            let Some(s) = state.workers.get_mut(&id) else {
                return None;
            };
            if *s == WorkerPauseState::Running {
                *s = WorkerPauseState::PauseRequested;
            }
            epoch
        };
        self.progress.notify_waiters();
        Some(epoch)
    }

    /// Count pause requests and return `(paused, total)`.
    pub fn snapshot(&self) -> BarrierSnapshot {
        let mut state = self.lock();
        let mut promoted = 0;
        for s in state.workers.values_mut() {
            if *s == WorkerPauseState::PauseRequested {
                *s = WorkerPauseState::Paused;
                promoted += 1;
            }
        }
        state.paused += promoted;
        BarrierSnapshot {
            paused: state.paused,
            total: state.workers.len(),
            armed: state.armed,
        }
    }

    /// Mark a round as pending so workers pause at their next safe point
    pub fn arm(&self) {
        self.lock().armed = true;
    }

    /// Whether enough workers are paused for the trainer to start a round.
    ///
    /// Only meaningful in boundary modes, where workers pause on their own.
    pub fn round_pending(&self) -> bool {
        if !self.mode.is_boundary() {
            return false;
        }
        let snap = self.snapshot();
        snap.paused > 0 && self.ratio.is_met(snap.paused, snap.total)
    }

    /// Wait up to `timeout` for `paused / total` to reach the quorum ratio
    pub async fn wait_for_quorum(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.progress.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let snap = self.snapshot();
            if self.ratio.is_met(snap.paused, snap.total) {
                return true;
            }
            if timeout_at(deadline, notified).await.is_err() {
                let snap = self.snapshot();
                tracing::info!(paused = snap.paused, total = snap.total, "pause quorum not reached");
                return self.ratio.is_met(snap.paused, snap.total);
            }
        }
    }

    /// Resume every parked worker and reset the counters. Returns how many were parked.
    pub fn resume_all(&self) -> usize {
        let (released, epoch) = {
            let mut state = self.lock();
            let mut released = 0;
            for s in state.workers.values_mut() {
                if *s != WorkerPauseState::Running {
                    *s = WorkerPauseState::Running;
                    released += 1;
                }
            }
            state.paused = 0;
            state.armed = self.mode.is_boundary();
            state.epoch += 1;
            (released, state.epoch)
        };
        self.resumed.send_replace(ResumeSignal {
            epoch,
            version: self.version.current(),
        });
        tracing::debug!(released, epoch, "barrier resumed");
        released
    }

    /// Worker gave up waiting; un-count it so it can pause again later
    fn release(&self, id: WorkerId) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if let Some(s) = state.workers.get_mut(&id) {
            if *s == WorkerPauseState::Paused {
                state.paused = state.paused.saturating_sub(1);
            }
            *s = WorkerPauseState::Running;
        }
    }

    fn deregister(&self, id: WorkerId) {
        {
            let mut state = self.lock();
            if state.workers.remove(&id) == Some(WorkerPauseState::Paused) {
                state.paused = state.paused.saturating_sub(1);
            }
        }
        self.progress.notify_waiters();
        tracing::debug!(worker = id.0, "worker deregistered");
    }

    fn worker_state(&self, id: WorkerId) -> Option<WorkerPauseState> {
        self.lock().workers.get(&id).copied()
    }
}

/// A worker's handle on the barrier. Dropping it deregisters the worker.
#[derive(Debug)]
pub struct WorkerHandle {
    id: WorkerId,
    controller: Arc<BarrierController>,
    resumed: watch::Receiver<ResumeSignal>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Current pause state
    pub fn state(&self) -> WorkerPauseState {
        self.controller
            .worker_state(self.id)
            .unwrap_or(WorkerPauseState::Running)
    }

    /// Cheap poll: would [`checkpoint`](Self::checkpoint) at `point` park this worker?
    pub fn should_pause(&self, point: SafePoint) -> bool {
        let state = self.controller.lock();
        self.controller.pause_wanted(&state, point)
    }

    /// Cooperative cancellation point. Parks the worker while a round is
    /// pending and returns once resumed or the pause limit expires.
    pub async fn checkpoint(&mut self, point: SafePoint) -> Checkpoint {
        let Some(epoch) = self.controller.request_pause(self.id, point) else {
            return Checkpoint::Continue;
        };
        let deadline = Instant::now() + self.controller.pause_limit;
        loop {
            let signal = *self.resumed.borrow_and_update();
            if signal.epoch > epoch {
                return Checkpoint::Resumed {
                    version: signal.version,
                };
            }
            match timeout_at(deadline, self.resumed.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => {
                    tracing::warn!(worker = self.id.0, "pause limit reached, releasing worker");
                    self.controller.release(self.id);
                    return Checkpoint::Released;
                }
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.controller.deregister(self.id);
    }
}
