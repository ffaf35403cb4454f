//! One editing session: a record store wired to its persistence.
//!
//! [`Session`] owns the [`RecordStore`], the [`WriteScheduler`] and the
//! [`BatchCoordinator`], and routes every mutation through the store before
//! telling the scheduler. Reads never touch storage.
//!
//! ```
//! use std::time::{Duration, Instant};
//! use dossier::{EntityId, Session};
//!
//! let mut session = Session::builder().open().unwrap();
//! let id = EntityId::new("S-001").unwrap();
//! session.append_image(&id, vec![0x89, 0x50, 0x4e, 0x47], "front.png").unwrap();
//! session.tick_at(Instant::now() + Duration::from_secs(1)).unwrap();
//! assert_eq!(session.get(&id).unwrap().image_count(), 1);
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Receiver;

use crate::batch::{BatchCoordinator, TransactionResult};
use crate::config::DossierConfig;
use crate::error::{DossierResult, PersistError, StoreError};
use crate::eviction::EvictionPolicy;
use crate::gateway::{PersistenceGateway, SaveOutcome};
use crate::record::{EntityId, ImageAsset, Record};
use crate::scheduler::{SaveStatus, SchedulerState, SchedulerStats, WriteScheduler};
use crate::snapshot::Snapshot;
use crate::storage::{InMemorySubstrate, Substrate};
use crate::store::RecordStore;
use crate::time::{Clock, SystemClock};

/// Builds a [`Session`].
#[derive(Debug, Default)]
pub struct SessionBuilder {
    config: DossierConfig,
    substrate: Option<Arc<dyn Substrate>>,
    clock: Option<Arc<dyn Clock>>,
    threaded: bool,
}

impl SessionBuilder {
    /// Uses `config` instead of the defaults.
    #[must_use]
    pub fn config(mut self, config: DossierConfig) -> Self {
        self.config = config;
        self
    }

    /// Storage to persist into. Defaults to an unbounded in-memory substrate.
    #[must_use]
    pub fn substrate(mut self, substrate: Arc<dyn Substrate>) -> Self {
        self.substrate = Some(substrate);
        self
    }

    /// Wall clock for `updated_at` stamps and eviction age checks.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Run saves on a background writer thread instead of inline.
    #[must_use]
    pub const fn threaded(mut self, threaded: bool) -> Self {
        self.threaded = threaded;
        self
    }

    /// Validates the configuration, loads the persisted document and any
    /// leftover recovery document.
    ///
    /// # Errors
    /// - invalid configuration
    /// - the persisted document exists but is corrupted or of an unknown
    ///   version; the session refuses to start rather than overwrite it
    /// - the substrate cannot be read
    pub fn open(self) -> DossierResult<Session> {
        let config = self.config.validate()?;
        let substrate = self
            .substrate
            .unwrap_or_else(|| Arc::new(InMemorySubstrate::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let gateway = Arc::new(PersistenceGateway::new(
            substrate,
            EvictionPolicy::new(config.eviction.clone()),
            Arc::clone(&clock),
            config.gateway.clone(),
        ));

        let store = match gateway.load() {
            Ok(snapshot) => RecordStore::from_snapshot(config.store.clone(), clock, snapshot),
            Err(PersistError::NotFound { .. }) => RecordStore::new(config.store.clone(), clock),
            Err(err) => return Err(err.into()),
        };

        let mut scheduler = if self.threaded {
            WriteScheduler::threaded(config.scheduler.clone(), Arc::clone(&gateway))?
        } else {
            WriteScheduler::inline(config.scheduler.clone(), Arc::clone(&gateway))?
        };

        match gateway.load_recovery() {
            Ok(Some(recovery)) => scheduler.adopt_recovery(recovery),
            Ok(None) => {}
            Err(err) => tracing::warn!(error = %err, "ignoring unreadable recovery document"),
        }

        tracing::info!(records = store.len(), threaded = self.threaded, "session opened");
        Ok(Session {
            store,
            scheduler,
            gateway,
            coordinator: BatchCoordinator::new(),
            config,
        })
    }
}

/// An open session.
pub struct Session {
    store: RecordStore,
    scheduler: WriteScheduler,
    gateway: Arc<PersistenceGateway>,
    coordinator: BatchCoordinator,
    config: DossierConfig,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("records", &self.store.len())
            .field("state", &self.scheduler.state())
            .field("epoch", &self.scheduler.epoch())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Starts building a session.
    #[must_use]
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// The validated configuration.
    #[must_use]
    pub const fn config(&self) -> &DossierConfig {
        &self.config
    }

    /// Read-only view of the store.
    #[must_use]
    pub const fn store(&self) -> &RecordStore {
        &self.store
    }

    /// The gateway this session saves through.
    #[must_use]
    pub fn gateway(&self) -> &Arc<PersistenceGateway> {
        &self.gateway
    }

    /// See [`RecordStore::get`].
    ///
    /// # Errors
    ///
    /// `StoreError::NotFound` if the entity has no record.
    pub fn get(&self, entity_id: &EntityId) -> Result<&Record, StoreError> {
        self.store.get(entity_id)
    }

    fn touched(&mut self) {
        self.scheduler.notify_mutation(Instant::now());
    }

    /// See [`RecordStore::upsert`].
    pub fn upsert<F>(&mut self, entity_id: &EntityId, mutator: F) -> &Record
    where
        F: FnOnce(&mut Record),
    {
        self.touched();
        self.store.upsert(entity_id, mutator)
    }

    /// See [`RecordStore::try_upsert`]. Failed mutations do not schedule a
    /// save.
    ///
    /// # Errors
    ///
    /// Same as [`RecordStore::try_upsert`].
    pub fn try_upsert<F, E>(&mut self, entity_id: &EntityId, mutator: F) -> Result<&Record, StoreError>
    where
        F: FnOnce(&mut Record) -> Result<(), E>,
        E: fmt::Display,
    {
        self.store.try_upsert(entity_id, mutator)?;
        self.touched();
        self.store.get(entity_id)
    }

    /// See [`RecordStore::append_image`].
    ///
    /// # Errors
    ///
    /// Same as [`RecordStore::append_image`].
    pub fn append_image(
        &mut self,
        entity_id: &EntityId,
        payload: Vec<u8>,
        name: impl Into<String>,
    ) -> Result<usize, StoreError> {
        let count = self.store.append_image(entity_id, payload, name)?;
        self.touched();
        Ok(count)
    }

    /// See [`RecordStore::remove_image`].
    ///
    /// # Errors
    ///
    /// Same as [`RecordStore::remove_image`].
    pub fn remove_image(&mut self, entity_id: &EntityId, index: usize) -> Result<ImageAsset, StoreError> {
        let removed = self.store.remove_image(entity_id, index)?;
        self.touched();
        Ok(removed)
    }

    /// See [`RecordStore::restore_deleted_image`].
    ///
    /// # Errors
    ///
    /// Same as [`RecordStore::restore_deleted_image`].
    pub fn restore_deleted_image(&mut self) -> Result<EntityId, StoreError> {
        let entity_id = self.store.restore_deleted_image()?;
        self.touched();
        Ok(entity_id)
    }

    /// See [`RecordStore::delete`].
    pub fn delete(&mut self, entity_id: &EntityId) -> Option<Record> {
        let removed = self.store.delete(entity_id);
        if removed.is_some() {
            self.touched();
        }
        removed
    }

    /// See [`RecordStore::set_roster`].
    pub fn set_roster(&mut self, roster: Vec<EntityId>) {
        self.store.set_roster(roster);
        self.touched();
    }

    /// See [`RecordStore::set_active_entity`].
    pub fn set_active_entity(&mut self, entity_id: Option<EntityId>) {
        self.store.set_active_entity(entity_id);
        self.touched();
    }

    /// See [`RecordStore::import_image`].
    ///
    /// # Errors
    ///
    /// Same as [`RecordStore::import_image`].
    pub fn import_image(&mut self, payload: Vec<u8>, name: impl Into<String>) -> Result<usize, StoreError> {
        let count = self.store.import_image(payload, name)?;
        self.touched();
        Ok(count)
    }

    /// See [`RecordStore::take_imported_image`].
    pub fn take_imported_image(&mut self, index: usize) -> Option<ImageAsset> {
        let taken = self.store.take_imported_image(index);
        if taken.is_some() {
            self.touched();
        }
        taken
    }

    /// Applies `mutator` to every listed entity, all or nothing. A committed
    /// batch schedules exactly one save.
    pub fn apply_batch<F, E>(&mut self, entity_ids: &[EntityId], mutator: F) -> TransactionResult
    where
        F: FnMut(&mut Record) -> Result<(), E>,
        E: fmt::Display,
    {
        self.coordinator.apply(
            &mut self.store,
            &mut self.scheduler,
            Instant::now(),
            entity_ids,
            mutator,
        )
    }

    /// Drives the scheduler with the current instant.
    ///
    /// # Errors
    ///
    /// Same as [`WriteScheduler::poll`].
    pub fn tick(&mut self) -> DossierResult<SchedulerState> {
        self.tick_at(Instant::now())
    }

    /// Drives the scheduler as if it were `now`.
    ///
    /// # Errors
    ///
    /// Same as [`WriteScheduler::poll`].
    pub fn tick_at(&mut self, now: Instant) -> DossierResult<SchedulerState> {
        self.scheduler.poll(now, &self.store)
    }

    /// Saves immediately.
    ///
    /// # Errors
    ///
    /// Same as [`WriteScheduler::flush`].
    pub fn flush(&mut self) -> DossierResult<SaveOutcome> {
        self.scheduler.flush(&self.store)
    }

    /// Cancels pending and retrying saves, deletes the persisted document and
    /// clears the store. The recovery snapshot survives.
    ///
    /// # Errors
    ///
    /// Fails if the persisted document could not be deleted. The store is
    /// still cleared and a save of the empty store is scheduled, so the old
    /// document is replaced by the next successful save or by [`close`](Self::close).
    pub fn reset(&mut self) -> DossierResult<()> {
        let result = self.scheduler.reset();
        self.store.clear();
        if let Err(err) = &result {
            tracing::warn!(error = %err, "reset could not delete the stored document; scheduling an empty save");
            self.touched();
        }
        result
    }

    /// Current scheduler state.
    #[must_use]
    pub const fn state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    /// Scheduler counters.
    #[must_use]
    pub const fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// When [`tick`](Self::tick) next has work to do.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }

    /// Subscribes to save status events.
    pub fn subscribe(&mut self) -> Receiver<SaveStatus> {
        self.scheduler.subscribe()
    }

    /// The pending manual-recovery snapshot.
    #[must_use]
    pub const fn recovery(&self) -> Option<&Snapshot> {
        self.scheduler.recovery()
    }

    /// Hands over the recovery snapshot and deletes its persisted copy.
    ///
    /// # Errors
    ///
    /// Same as [`WriteScheduler::take_recovery`].
    pub fn take_recovery(&mut self) -> DossierResult<Option<Snapshot>> {
        self.scheduler.take_recovery()
    }

    /// Replaces the store with the recovery snapshot and saves it.
    ///
    /// The recovery copy is deleted only after the restored state has been
    /// written as the session document. Returns false if there was nothing
    /// to recover.
    ///
    /// # Errors
    ///
    /// Fails if the save or the delete fails. The store keeps the restored
    /// state, the recovery copy stays where it was and the save follows the
    /// usual retry rules.
    pub fn restore_recovery(&mut self) -> DossierResult<bool> {
        let Some(snapshot) = self.scheduler.recovery().cloned() else {
            return Ok(false);
        };
        self.store.restore(snapshot);
        self.touched();
        self.flush()?;
        self.scheduler.take_recovery()?;
        Ok(true)
    }

    /// Saves outstanding changes and ends the session.
    ///
    /// # Errors
    ///
    /// The error of the final flush.
    pub fn close(mut self) -> DossierResult<()> {
        match self.scheduler.state() {
            SchedulerState::Idle | SchedulerState::Failed => Ok(()),
            SchedulerState::Pending | SchedulerState::Saving | SchedulerState::Retrying => {
                self.flush().map(|_| ())
            }
        }
    }
}
