//! Debounced, retrying write scheduler.
//!
//! Mutations never wait for storage. Each one calls
//! [`WriteScheduler::notify_mutation`], which arms a debounce timer; the
//! owner drives the machine with [`WriteScheduler::poll`], passing the current
//! instant. When a timer is due and no save is in flight, the scheduler takes a
//! fresh snapshot of the store and hands it to a [`SaveExecutor`].
//!
//! ```text
//!            mutation                 debounce due
//!   Idle ───────────────▶ Pending ───────────────────▶ Saving ──ok──▶ Idle
//!    ▲                      ▲  │ mutation: re-arm        │  │          (Pending if
//!    │                      │  ▼                         │  │           mutated while
//!    │                      Pending                      │  │           saving)
//!    │                                   retryable error │  │ attempts exhausted or
//!    │                                   and attempts    │  │ permanent error
//!    │          backoff due               left           ▼  ▼
//!    │   Saving ◀─────────── Retrying ◀──────────────────┘  Failed ──▶ recovery slot
//!    │                                                         │
//!    └──────────────────────── reset (from any state) ─────────┘
//! ```
//!
//! At most one save is in flight. Snapshots are taken when a save starts, so
//! any number of mutations between two saves coalesce into one write.
//! [`WriteScheduler::reset`] cancels both timers, closes the gateway epoch and
//! forgets the in-flight save; its completion is discarded when it arrives.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use serde::{Deserialize, Serialize};

use crate::error::{DossierError, DossierResult, PersistError, ValidationError};
use crate::gateway::{PersistenceGateway, SaveOutcome};
use crate::snapshot::Snapshot;
use crate::store::RecordStore;

/// Default quiet period before a save starts.
pub const DEFAULT_DEBOUNCE_MS: u64 = 400;

/// Default delay before the first retry; doubles on each further attempt.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 500;

/// Default number of attempts per save sequence.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

const DEFAULT_STATUS_CAPACITY: usize = 64;

/// Upper bound on a single backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// How long `flush` waits for an in-flight save.
const FLUSH_WAIT: Duration = Duration::from_secs(30);

/// Scheduler timing and retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Quiet period in milliseconds before a save starts.
    pub debounce_ms: u64,
    /// Delay in milliseconds before the first retry.
    pub backoff_base_ms: u64,
    /// Attempts per save sequence, the first one included.
    pub max_attempts: u32,
    /// Buffered status events per subscriber before events are dropped.
    pub status_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            status_capacity: DEFAULT_STATUS_CAPACITY,
        }
    }
}

impl SchedulerConfig {
    /// Checks the settings.
    ///
    /// # Errors
    ///
    /// `ValidationError::InvalidConfig` for a zero debounce, backoff base or
    /// attempt count.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.debounce_ms == 0 {
            return Err(ValidationError::config("scheduler.debounce_ms", "must be greater than zero"));
        }
        if self.backoff_base_ms == 0 {
            return Err(ValidationError::config(
                "scheduler.backoff_base_ms",
                "must be greater than zero",
            ));
        }
        if self.max_attempts == 0 {
            return Err(ValidationError::config("scheduler.max_attempts", "must be at least 1"));
        }
        Ok(self)
    }

    /// The debounce window as a `Duration`.
    #[must_use]
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Delay after failed attempt number `attempt` (1-based), capped at one
    /// hour.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor)).min(MAX_BACKOFF)
    }
}

/// Where the scheduler is in its save cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerState {
    /// Nothing waiting to be saved.
    Idle,
    /// Debounce armed.
    Pending,
    /// A save is in flight.
    Saving,
    /// Waiting out a backoff before the next attempt.
    Retrying,
    /// The last sequence gave up; a recovery snapshot exists.
    Failed,
}

/// Status events published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveStatus {
    /// A mutation armed the debounce.
    Pending,
    /// Attempt number `attempt` started.
    Saving { attempt: u32 },
    /// The save finished on attempt number `attempt`.
    Saved { attempt: u32, outcome: SaveOutcome },
    /// `attempt` is the number of the attempt that will run after `delay`.
    Retrying { attempt: u32, delay: Duration, error: PersistError },
    /// The sequence gave up. The snapshot went to the recovery slot;
    /// `recovery_saved` says whether its persisted copy was written.
    Failed { attempts: u32, error: PersistError, recovery_saved: bool },
    /// The session was reset.
    Reset,
}

/// Counters since the scheduler was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Attempts started, retries included.
    pub saves_started: u64,
    /// Attempts that ended with an outcome.
    pub saves_succeeded: u64,
    /// Sequences that ended in `Failed`.
    pub saves_failed: u64,
    /// Backoff timers armed.
    pub retries: u64,
    /// Mutations absorbed by an already-scheduled save.
    pub coalesced: u64,
    /// Saves that had to evict to fit.
    pub evictions: u64,
    /// Status events lost to full subscriber buffers.
    pub dropped_events: u64,
}

/// Identifies an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

#[derive(Debug, Clone, Copy)]
struct Timer {
    handle: TimerHandle,
    deadline: Instant,
}

impl Timer {
    fn is_due(&self, now: Instant) -> bool {
        self.deadline <= now
    }
}

/// One save request.
#[derive(Debug, Clone)]
pub struct SaveJob {
    /// Gateway epoch the job belongs to.
    pub epoch: u64,
    /// Attempt number within the save sequence.
    pub attempt: u32,
    /// Document to write.
    pub snapshot: Snapshot,
}

/// The result of a [`SaveJob`].
#[derive(Debug, Clone)]
pub struct SaveCompletion {
    /// Epoch of the finished job.
    pub epoch: u64,
    /// Attempt number of the finished job.
    pub attempt: u32,
    /// What the gateway returned.
    pub result: Result<SaveOutcome, PersistError>,
}

/// Runs save jobs against the gateway.
///
/// The scheduler submits at most one job per epoch at a time and collects its
/// completion with `try_complete` or `wait_complete`.
pub trait SaveExecutor: Send + fmt::Debug {
    /// Starts `job`.
    ///
    /// # Errors
    ///
    /// `DossierError::WorkerDisconnected` if the worker is gone.
    fn submit(&mut self, job: SaveJob) -> DossierResult<()>;

    /// Returns a finished job, if any, without blocking.
    fn try_complete(&mut self) -> Option<SaveCompletion>;

    /// Waits up to `timeout` for a finished job.
    fn wait_complete(&mut self, timeout: Duration) -> Option<SaveCompletion>;
}

/// Runs each job to completion inside `submit`.
///
/// Deterministic; used by tests and by hosts whose substrate is fast.
#[derive(Debug)]
pub struct InlineExecutor {
    gateway: Arc<PersistenceGateway>,
    done: Option<SaveCompletion>,
}

impl InlineExecutor {
    /// Creates an executor saving through `gateway`.
    #[must_use]
    pub fn new(gateway: Arc<PersistenceGateway>) -> Self {
        Self { gateway, done: None }
    }
}

impl SaveExecutor for InlineExecutor {
    fn submit(&mut self, job: SaveJob) -> DossierResult<()> {
        let result = self.gateway.save_in_epoch(&job.snapshot, job.epoch);
        self.done = Some(SaveCompletion {
            epoch: job.epoch,
            attempt: job.attempt,
            result,
        });
        Ok(())
    }

    fn try_complete(&mut self) -> Option<SaveCompletion> {
        self.done.take()
    }

    fn wait_complete(&mut self, _timeout: Duration) -> Option<SaveCompletion> {
        self.done.take()
    }
}

/// Runs jobs on a dedicated writer thread so storage I/O never blocks
/// mutations.
#[derive(Debug)]
pub struct ThreadedExecutor {
    jobs: Option<Sender<SaveJob>>,
    done: Receiver<SaveCompletion>,
    worker: Option<JoinHandle<()>>,
}

impl ThreadedExecutor {
    /// Spawns the writer thread.
    #[must_use]
    pub fn start(gateway: Arc<PersistenceGateway>) -> Self {
        // Room for one current job plus one from a closed epoch.
        let (jobs_tx, jobs_rx) = bounded::<SaveJob>(2);
        let (done_tx, done_rx) = bounded::<SaveCompletion>(4);

        let worker = thread::Builder::new()
            .name("dossier-writer".to_string())
            .spawn(move || {
                while let Ok(job) = jobs_rx.recv() {
                    let result = gateway.save_in_epoch(&job.snapshot, job.epoch);
                    let completion = SaveCompletion {
                        epoch: job.epoch,
                        attempt: job.attempt,
                        result,
                    };
                    if done_tx.send(completion).is_err() {
                        break;
                    }
                }
            })
            .expect("failed to spawn dossier writer");

        Self {
            jobs: Some(jobs_tx),
            done: done_rx,
            worker: Some(worker),
        }
    }
}

impl SaveExecutor for ThreadedExecutor {
    fn submit(&mut self, job: SaveJob) -> DossierResult<()> {
        let jobs = self.jobs.as_ref().ok_or(DossierError::WorkerDisconnected)?;
        match jobs.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DossierError::internal("save queue is full")),
            Err(TrySendError::Disconnected(_)) => Err(DossierError::WorkerDisconnected),
        }
    }

    fn try_complete(&mut self) -> Option<SaveCompletion> {
        match self.done.try_recv() {
            Ok(completion) => Some(completion),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    fn wait_complete(&mut self, timeout: Duration) -> Option<SaveCompletion> {
        match self.done.recv_timeout(timeout) {
            Ok(completion) => Some(completion),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }
}

impl Drop for ThreadedExecutor {
    fn drop(&mut self) {
        // Closing the job channel ends the worker loop once its current job is done.
        drop(self.jobs.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// The write scheduler state machine.
#[derive(Debug)]
pub struct WriteScheduler {
    config: SchedulerConfig,
    gateway: Arc<PersistenceGateway>,
    executor: Box<dyn SaveExecutor>,
    state: SchedulerState,
    epoch: u64,
    /// Attempt number of the save in flight.
    in_flight: Option<u32>,
    /// Attempt number of the most recent save.
    last_attempt: u32,
    /// Mutated since the in-flight snapshot was taken.
    dirty: bool,
    debounce: Option<Timer>,
    backoff: Option<Timer>,
    next_timer: u64,
    recovery: Option<Snapshot>,
    subscribers: Vec<Sender<SaveStatus>>,
    stats: SchedulerStats,
}

impl WriteScheduler {
    /// Creates an idle scheduler in the gateway's current epoch.
    ///
    /// # Errors
    ///
    /// Fails if the gateway state lock is poisoned.
    pub fn new(
        config: SchedulerConfig,
        gateway: Arc<PersistenceGateway>,
        executor: Box<dyn SaveExecutor>,
    ) -> DossierResult<Self> {
        let epoch = gateway.epoch()?;
        Ok(Self {
            config,
            gateway,
            executor,
            state: SchedulerState::Idle,
            epoch,
            in_flight: None,
            last_attempt: 0,
            dirty: false,
            debounce: None,
            backoff: None,
            next_timer: 0,
            recovery: None,
            subscribers: Vec::new(),
            stats: SchedulerStats::default(),
        })
    }

    /// Creates a scheduler that saves inline on the caller's thread.
    ///
    /// # Errors
    ///
    /// Fails if the gateway state lock is poisoned.
    pub fn inline(config: SchedulerConfig, gateway: Arc<PersistenceGateway>) -> DossierResult<Self> {
        let executor = Box::new(InlineExecutor::new(Arc::clone(&gateway)));
        Self::new(config, gateway, executor)
    }

    /// Creates a scheduler with a background writer thread.
    ///
    /// # Errors
    ///
    /// Fails if the gateway state lock is poisoned.
    pub fn threaded(config: SchedulerConfig, gateway: Arc<PersistenceGateway>) -> DossierResult<Self> {
        let executor = Box::new(ThreadedExecutor::start(Arc::clone(&gateway)));
        Self::new(config, gateway, executor)
    }

    /// The active settings.
    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SchedulerState {
        self.state
    }

    /// Counters since creation.
    #[must_use]
    pub const fn stats(&self) -> SchedulerStats {
        self.stats
    }

    /// Gateway epoch this scheduler saves in.
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// True while a save is in flight.
    #[must_use]
    pub const fn is_saving(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Earliest armed deadline, if any timer is armed.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.debounce, self.backoff) {
            (Some(d), Some(b)) => Some(d.deadline.min(b.deadline)),
            (Some(t), None) | (None, Some(t)) => Some(t.deadline),
            (None, None) => None,
        }
    }

    /// The armed debounce timer.
    #[must_use]
    pub fn debounce_timer(&self) -> Option<TimerHandle> {
        self.debounce.map(|t| t.handle)
    }

    /// The armed backoff timer.
    #[must_use]
    pub fn backoff_timer(&self) -> Option<TimerHandle> {
        self.backoff.map(|t| t.handle)
    }

    /// Subscribes to status events.
    ///
    /// Events are dropped for a subscriber whose buffer is full; a dropped
    /// receiver is forgotten on the next event.
    pub fn subscribe(&mut self) -> Receiver<SaveStatus> {
        let (tx, rx) = bounded(self.config.status_capacity.max(1));
        self.subscribers.push(tx);
        rx
    }

    /// The manual-recovery snapshot from the last failed sequence.
    #[must_use]
    pub const fn recovery(&self) -> Option<&Snapshot> {
        self.recovery.as_ref()
    }

    /// Hands the recovery snapshot to the caller and deletes its persisted
    /// copy.
    ///
    /// # Errors
    ///
    /// Fails if the persisted copy cannot be deleted. The snapshot stays in
    /// place and the call can be retried.
    pub fn take_recovery(&mut self) -> DossierResult<Option<Snapshot>> {
        if self.recovery.is_some() {
            self.gateway.clear_recovery()?;
        }
        Ok(self.recovery.take())
    }

    /// Installs a recovery snapshot found at startup.
    pub fn adopt_recovery(&mut self, snapshot: Snapshot) {
        tracing::warn!(records = snapshot.record_count(), "recovery document from an earlier session is pending");
        self.recovery = Some(snapshot);
    }

    /// Records a mutation made at `now`.
    pub fn notify_mutation(&mut self, now: Instant) {
        match self.state {
            SchedulerState::Idle | SchedulerState::Failed => {
                self.arm_debounce(now);
                self.transition(SchedulerState::Pending);
                self.emit(SaveStatus::Pending);
            }
            SchedulerState::Pending => {
                self.arm_debounce(now);
                self.stats.coalesced += 1;
            }
            SchedulerState::Saving => {
                self.dirty = true;
                self.arm_debounce(now);
                self.stats.coalesced += 1;
            }
            SchedulerState::Retrying => {
                // The next attempt snapshots the store when it starts.
                self.stats.coalesced += 1;
            }
        }
    }

    /// Advances the machine to `now`: collects finished saves and starts the
    /// next one if a timer is due.
    ///
    /// # Errors
    /// Returns an error if the executor refuses a job. The debounce is re-armed
    /// so the save is attempted again on a later poll.
    pub fn poll(&mut self, now: Instant, store: &RecordStore) -> DossierResult<SchedulerState> {
        loop {
            while let Some(completion) = self.executor.try_complete() {
                self.complete(completion, store, now);
            }
            if self.in_flight.is_some() {
                break;
            }

            let attempt = if self.backoff.is_some_and(|t| t.is_due(now)) {
                self.backoff = None;
                self.attempts_so_far() + 1
            } else if self.debounce.is_some_and(|t| t.is_due(now)) {
                self.debounce = None;
                1
            } else {
                break;
            };
            self.dispatch(store, attempt, now)?;
        }
        Ok(self.state)
    }

    /// Blocks until the in-flight save (if any) finishes, then processes it.
    ///
    /// Returns false if the save did not finish within `timeout`.
    pub fn await_in_flight(&mut self, store: &RecordStore, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_flight.is_some() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.executor.wait_complete(remaining) {
                Some(completion) => self.complete(completion, store, Instant::now()),
                None => return false,
            }
        }
        true
    }

    /// Saves the current store contents now, bypassing the debounce.
    ///
    /// A failed flush counts as an attempt of the current sequence and
    /// follows the usual retry rules.
    ///
    /// # Errors
    ///
    /// The gateway error of this attempt, or `Internal` if an in-flight save
    /// did not finish in time.
    pub fn flush(&mut self, store: &RecordStore) -> DossierResult<SaveOutcome> {
        if !self.await_in_flight(store, FLUSH_WAIT) {
            return Err(DossierError::internal("timed out waiting for in-flight save"));
        }
        self.cancel_timers();

        let attempt = self.attempts_so_far() + 1;
        let snapshot = store.snapshot();
        self.begin(attempt);
        let result = self.gateway.save_in_epoch(&snapshot, self.epoch);
        let completion = SaveCompletion {
            epoch: self.epoch,
            attempt,
            result: result.clone(),
        };
        self.complete(completion, store, Instant::now());
        result.map_err(DossierError::from)
    }

    /// Cancels all scheduling and clears the persisted document.
    ///
    /// The in-flight save, if any, is abandoned; its completion is ignored.
    /// The recovery snapshot is kept.
    ///
    /// # Errors
    ///
    /// `StorageUnavailable` if the persisted document could not be deleted.
    /// Scheduling is cancelled and the epoch closed regardless.
    pub fn reset(&mut self) -> DossierResult<()> {
        self.cancel_timers();
        self.dirty = false;
        self.in_flight = None;
        self.last_attempt = 0;
        self.transition(SchedulerState::Idle);

        let result = self.gateway.reset();
        self.epoch = self.gateway.epoch()?;
        result?;

        tracing::info!(epoch = self.epoch, "scheduler reset");
        self.emit(SaveStatus::Reset);
        Ok(())
    }

    fn attempts_so_far(&self) -> u32 {
        match self.state {
            SchedulerState::Retrying => self.last_attempt,
            _ => 0,
        }
    }

    fn arm_debounce(&mut self, now: Instant) {
        let handle = self.next_handle();
        let deadline = now + self.config.debounce();
        if self.debounce.is_some() {
            tracing::debug!(?handle, "re-arming debounce");
        } else {
            tracing::debug!(?handle, debounce_ms = self.config.debounce_ms, "arming debounce");
        }
        self.debounce = Some(Timer { handle, deadline });
    }

    fn arm_backoff(&mut self, now: Instant, delay: Duration) {
        let handle = self.next_handle();
        self.backoff = Some(Timer {
            handle,
            deadline: now + delay,
        });
    }

    fn next_handle(&mut self) -> TimerHandle {
        self.next_timer += 1;
        TimerHandle(self.next_timer)
    }

    fn cancel_timers(&mut self) {
        self.debounce = None;
        self.backoff = None;
    }

    fn transition(&mut self, next: SchedulerState) {
        if self.state != next {
            tracing::debug!(from = ?self.state, to = ?next, "scheduler transition");
            self.state = next;
        }
    }

    fn begin(&mut self, attempt: u32) {
        self.dirty = false;
        self.last_attempt = attempt;
        self.stats.saves_started += 1;
        self.transition(SchedulerState::Saving);
        self.emit(SaveStatus::Saving { attempt });
    }

    fn dispatch(&mut self, store: &RecordStore, attempt: u32, now: Instant) -> DossierResult<()> {
        let job = SaveJob {
            epoch: self.epoch,
            attempt,
            snapshot: store.snapshot(),
        };
        self.begin(attempt);
        self.in_flight = Some(attempt);

        if let Err(err) = self.executor.submit(job) {
            tracing::error!(error = %err, "save executor refused job");
            self.in_flight = None;
            self.arm_debounce(now);
            self.transition(SchedulerState::Pending);
            return Err(err);
        }
        Ok(())
    }

    fn complete(&mut self, completion: SaveCompletion, store: &RecordStore, now: Instant) {
        if completion.epoch != self.epoch {
            tracing::debug!(
                save_epoch = completion.epoch,
                current_epoch = self.epoch,
                "discarding completion from closed epoch"
            );
            return;
        }
        if let Some(expected) = self.in_flight {
            if expected != completion.attempt {
                tracing::debug!(expected, got = completion.attempt, "unexpected completion");
            }
        }
        self.in_flight = None;
        let attempt = completion.attempt;

        match completion.result {
            Ok(outcome) => {
                self.stats.saves_succeeded += 1;
                if outcome.eviction().is_some() {
                    self.stats.evictions += 1;
                }
                self.backoff = None;
                self.emit(SaveStatus::Saved { attempt, outcome });
                if self.dirty {
                    if self.debounce.is_none() {
                        self.arm_debounce(now);
                    }
                    self.transition(SchedulerState::Pending);
                } else {
                    self.transition(SchedulerState::Idle);
                }
            }
            Err(error) if error.is_retryable() && attempt < self.config.max_attempts => {
                let delay = self.config.backoff(attempt);
                tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "save failed, retrying");
                self.stats.retries += 1;
                self.debounce = None;
                self.dirty = false;
                self.arm_backoff(now, delay);
                self.transition(SchedulerState::Retrying);
                self.emit(SaveStatus::Retrying {
                    attempt: attempt + 1,
                    delay,
                    error,
                });
            }
            Err(error) => self.fail(attempt, error, store),
        }
    }

    fn fail(&mut self, attempts: u32, error: PersistError, store: &RecordStore) {
        self.cancel_timers();
        self.dirty = false;
        self.stats.saves_failed += 1;

        let snapshot = store.snapshot();
        let recovery_saved = match self.gateway.save_recovery(&snapshot) {
            Ok(_) => true,
            Err(err) => {
                tracing::error!(error = %err, "failed to write recovery document; keeping it in memory");
                false
            }
        };
        tracing::error!(attempts, error = %error, recovery_saved, "save failed permanently");

        self.recovery = Some(snapshot);
        self.transition(SchedulerState::Failed);
        self.emit(SaveStatus::Failed {
            attempts,
            error,
            recovery_saved,
        });
    }

    fn emit(&mut self, status: SaveStatus) {
        let mut dropped = 0;
        self.subscribers.retain(|tx| match tx.try_send(status.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                dropped += 1;
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
        self.stats.dropped_events += dropped;
    }
}
