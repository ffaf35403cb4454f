//! All-or-nothing multi-entity mutations.
//!
//! [`BatchCoordinator::apply`] deep-copies the store, applies one mutator to
//! each listed entity in order and then either commits (one save trigger for
//! the whole batch) or restores the copy exactly. Every entity is attempted
//! even after a failure so the result lists all of them.

use std::fmt;
use std::time::Instant;

use crate::error::{DossierError, DossierResult};
use crate::record::{EntityId, Record};
use crate::scheduler::WriteScheduler;
use crate::store::RecordStore;

/// Told once per committed batch.
pub trait CommitListener {
    /// Called after the batch is kept.
    fn on_commit(&mut self, now: Instant);
}

impl CommitListener for WriteScheduler {
    fn on_commit(&mut self, now: Instant) {
        self.notify_mutation(now);
    }
}

/// Outcome of one batch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransactionResult {
    /// Entities in the batch.
    pub total: usize,
    /// Mutations that succeeded before the batch ended.
    pub success: usize,
    /// Mutations that failed.
    pub failed: usize,
    /// Entities whose mutation failed, in list order.
    pub failed_entities: Vec<EntityId>,
    /// One message per failed entity, aligned with `failed_entities`.
    pub errors: Vec<String>,
    /// True if the batch was kept; false if it was rolled back.
    pub committed: bool,
}

impl TransactionResult {
    /// True if the batch was kept.
    #[must_use]
    pub const fn is_committed(&self) -> bool {
        self.committed
    }

    /// Converts a rolled-back batch into `DossierError::TransactionFailure`.
    ///
    /// # Errors
    ///
    /// `DossierError::TransactionFailure` if the batch was rolled back.
    pub fn into_result(self) -> DossierResult<Self> {
        if self.committed {
            Ok(self)
        } else {
            Err(DossierError::TransactionFailure {
                total: self.total,
                failed: self.failed,
            })
        }
    }
}

/// Runs batches against a [`RecordStore`].
#[derive(Debug, Default)]
pub struct BatchCoordinator {
    committed: u64,
    rolled_back: u64,
}

impl BatchCoordinator {
    /// Creates a coordinator with zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Batches committed so far.
    #[must_use]
    pub const fn committed(&self) -> u64 {
        self.committed
    }

    /// Batches rolled back so far.
    #[must_use]
    pub const fn rolled_back(&self) -> u64 {
        self.rolled_back
    }

    /// Applies `mutator` to every entity in `entity_ids`, in order.
    ///
    /// Missing records are created, as with [`RecordStore::upsert`]. If any
    /// mutation fails the store is restored to its state before the call and
    /// `listener` is not told; otherwise `listener` is told exactly once. An
    /// empty list commits without telling `listener`.
    pub fn apply<F, E>(
        &mut self,
        store: &mut RecordStore,
        listener: &mut dyn CommitListener,
        now: Instant,
        entity_ids: &[EntityId],
        mut mutator: F,
    ) -> TransactionResult
    where
        F: FnMut(&mut Record) -> Result<(), E>,
        E: fmt::Display,
    {
        let mut result = TransactionResult {
            total: entity_ids.len(),
            ..TransactionResult::default()
        };
        if entity_ids.is_empty() {
            result.committed = true;
            return result;
        }

        let backup = store.snapshot();
        for entity_id in entity_ids {
            match store.try_upsert(entity_id, |record| mutator(record)) {
                Ok(_) => result.success += 1,
                Err(err) => {
                    result.failed += 1;
                    result.failed_entities.push(entity_id.clone());
                    result.errors.push(err.to_string());
                }
            }
        }

        if result.failed > 0 {
            store.restore(backup);
            self.rolled_back += 1;
            tracing::warn!(
                total = result.total,
                failed = result.failed,
                "batch rolled back"
            );
            return result;
        }

        result.committed = true;
        self.committed += 1;
        tracing::debug!(total = result.total, "batch committed");
        listener.on_commit(now);
        result
    }
}
