//! The persistence gateway.
//!
//! [`PersistenceGateway`] is the only writer of the document key and the
//! manual-recovery key on its [`Substrate`]. A save serializes the whole
//! snapshot before touching storage and hands the substrate one complete value,
//! so the persisted document is always either the previous one or the new one.
//!
//! # Quota handling
//!
//! ```text
//! write ──ok──────────────────────────────▶ Written
//!   │
//!   └─QuotaExceeded──▶ evict(budget = available)
//!                        │
//!                        ├─still over budget──▶ StorageExhausted
//!                        └─write ──ok──▶ WrittenAfterEviction
//!                                │
//!                                └─QuotaExceeded──▶ StorageExhausted
//! ```
//!
//! Eviction only shapes the persisted copy. The in-memory store keeps
//! everything; the returned [`EvictionReport`] says what the stored document
//! lacks.
//!
//! # Epochs
//!
//! Every save runs in an epoch. [`PersistenceGateway::reset`] starts a new
//! one, and a save tagged with an older epoch is dropped without writing. The
//! state mutex is held across the write itself, so a reset either waits for an
//! in-flight write and then deletes its result, or runs first and makes the
//! write stale.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{PersistError, ValidationError};
use crate::eviction::{EvictionPolicy, EvictionReport};
use crate::record::{EntityId, ImageAsset, Record};
use crate::snapshot::{DeletedImage, Snapshot};
use crate::storage::{Substrate, SubstrateError};
use crate::time::Clock;

/// Default substrate key for the session document.
pub const DEFAULT_DOCUMENT_KEY: &str = "dossier.snapshot";

/// Default substrate key for the manual-recovery copy.
pub const DEFAULT_RECOVERY_KEY: &str = "dossier.recovery";

/// Gateway settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Key the session document is written under.
    pub document_key: String,
    /// Key the manual-recovery copy is written under.
    pub recovery_key: String,
    /// Run one eviction pass when the substrate reports a quota failure.
    pub evict_on_quota: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            document_key: DEFAULT_DOCUMENT_KEY.to_string(),
            recovery_key: DEFAULT_RECOVERY_KEY.to_string(),
            evict_on_quota: true,
        }
    }
}

impl GatewayConfig {
    /// Checks the keys.
    ///
    /// # Errors
    ///
    /// `ValidationError::InvalidConfig` for an empty key or two equal keys.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.document_key.trim().is_empty() {
            return Err(ValidationError::config("gateway.document_key", "cannot be empty"));
        }
        if self.recovery_key.trim().is_empty() {
            return Err(ValidationError::config("gateway.recovery_key", "cannot be empty"));
        }
        if self.document_key == self.recovery_key {
            return Err(ValidationError::config(
                "gateway.recovery_key",
                "must differ from gateway.document_key",
            ));
        }
        Ok(self)
    }
}

/// How a save ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The full document was written.
    Written { bytes: u64 },
    /// The stored document already had this content; nothing was written.
    Unchanged { bytes: u64 },
    /// A reduced document was written after one eviction pass.
    WrittenAfterEviction { bytes: u64, report: EvictionReport },
    /// The save belonged to an epoch that a reset has since closed.
    Superseded { epoch: u64 },
}

impl SaveOutcome {
    /// True if the substrate was written.
    #[must_use]
    pub const fn wrote(&self) -> bool {
        matches!(self, Self::Written { .. } | Self::WrittenAfterEviction { .. })
    }

    /// The eviction report, if the save had to evict.
    #[must_use]
    pub const fn eviction(&self) -> Option<&EvictionReport> {
        match self {
            Self::WrittenAfterEviction { report, .. } => Some(report),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct GatewayState {
    epoch: u64,
    last_digest: Option<blake3::Hash>,
}

fn lock_err(context: &'static str) -> PersistError {
    PersistError::StorageUnavailable {
        message: format!("poisoned lock: {context}"),
    }
}

/// The parts of a snapshot that matter for skip-if-unchanged. `saved_at`
/// moves on every snapshot and is left out.
#[derive(Serialize)]
struct ContentView<'a> {
    roster: &'a [EntityId],
    active_entity: &'a Option<EntityId>,
    imported_images: &'a [ImageAsset],
    undo_history: &'a [DeletedImage],
    records: &'a std::collections::BTreeMap<EntityId, Record>,
}

fn content_digest(snapshot: &Snapshot) -> Result<blake3::Hash, PersistError> {
    let view = ContentView {
        roster: &snapshot.roster,
        active_entity: &snapshot.active_entity,
        imported_images: &snapshot.imported_images,
        undo_history: &snapshot.undo_history,
        records: &snapshot.records,
    };
    let mut hasher = blake3::Hasher::new();
    serde_json::to_writer(&mut hasher, &view).map_err(|e| PersistError::Serialization {
        message: e.to_string(),
    })?;
    Ok(hasher.finalize())
}

/// Sole owner of the persisted document.
#[derive(Debug)]
pub struct PersistenceGateway {
    substrate: Arc<dyn Substrate>,
    policy: EvictionPolicy,
    clock: Arc<dyn Clock>,
    config: GatewayConfig,
    state: Mutex<GatewayState>,
}

impl PersistenceGateway {
    /// Creates a gateway in epoch 0 owning both keys on `substrate`.
    #[must_use]
    pub fn new(
        substrate: Arc<dyn Substrate>,
        policy: EvictionPolicy,
        clock: Arc<dyn Clock>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            substrate,
            policy,
            clock,
            config,
            state: Mutex::new(GatewayState::default()),
        }
    }

    /// The active settings.
    #[must_use]
    pub const fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// The eviction policy used on quota failures.
    #[must_use]
    pub const fn policy(&self) -> &EvictionPolicy {
        &self.policy
    }

    /// The backing substrate.
    #[must_use]
    pub fn substrate(&self) -> &Arc<dyn Substrate> {
        &self.substrate
    }

    /// The current epoch.
    ///
    /// # Errors
    ///
    /// `StorageUnavailable` if the state lock is poisoned.
    pub fn epoch(&self) -> Result<u64, PersistError> {
        Ok(self.state.lock().map_err(|_| lock_err("gateway.epoch"))?.epoch)
    }

    /// Saves `snapshot` in the current epoch.
    ///
    /// # Errors
    /// - `StorageUnavailable` if the substrate failed
    /// - `StorageExhausted` if one eviction pass and one retry could not fit
    ///   the document
    /// - `QuotaExceeded` if the write did not fit and eviction is disabled
    /// - `Serialization` if the document could not be encoded
    pub fn save(&self, snapshot: &Snapshot) -> Result<SaveOutcome, PersistError> {
        let epoch = self.epoch()?;
        self.save_in_epoch(snapshot, epoch)
    }

    /// Saves `snapshot` if `epoch` is still current.
    ///
    /// A stale epoch returns [`SaveOutcome::Superseded`] without writing.
    ///
    /// # Errors
    ///
    /// Same as [`save`](Self::save).
    pub fn save_in_epoch(&self, snapshot: &Snapshot, epoch: u64) -> Result<SaveOutcome, PersistError> {
        let mut state = self.state.lock().map_err(|_| lock_err("gateway.save"))?;
        if state.epoch != epoch {
            tracing::debug!(save_epoch = epoch, current_epoch = state.epoch, "dropping save from closed epoch");
            return Ok(SaveOutcome::Superseded { epoch });
        }

        let started = Instant::now();
        let digest = content_digest(snapshot)?;
        let bytes = snapshot.to_bytes()?;
        let len = bytes.len() as u64;

        if state.last_digest == Some(digest) {
            tracing::debug!(bytes = len, "document unchanged, skipping write");
            return Ok(SaveOutcome::Unchanged { bytes: len });
        }

        match self.substrate.write(&self.config.document_key, &bytes) {
            Ok(()) => {
                state.last_digest = Some(digest);
                tracing::info!(
                    bytes = len,
                    records = snapshot.record_count(),
                    elapsed_us = started.elapsed().as_micros() as u64,
                    "saved document"
                );
                Ok(SaveOutcome::Written { bytes: len })
            }
            Err(SubstrateError::QuotaExceeded { requested, available, .. }) => {
                if !self.config.evict_on_quota {
                    return Err(PersistError::QuotaExceeded { requested, available });
                }
                let outcome = self.save_evicted(snapshot, available)?;
                // The stored document no longer matches the full snapshot.
                state.last_digest = None;
                Ok(outcome)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn save_evicted(&self, snapshot: &Snapshot, budget: u64) -> Result<SaveOutcome, PersistError> {
        let eviction = self.policy.evict(snapshot, budget, self.clock.now())?;
        if !eviction.report.within_budget() {
            tracing::warn!(size = eviction.report.size_after, budget, "document does not fit after eviction");
            return Err(PersistError::StorageExhausted {
                size: eviction.report.size_after,
                budget,
            });
        }

        let reduced = eviction.snapshot.to_bytes()?;
        let len = reduced.len() as u64;
        match self.substrate.write(&self.config.document_key, &reduced) {
            Ok(()) => {
                tracing::info!(
                    bytes = len,
                    stale_records = eviction.report.stale_records.len(),
                    images_dropped = eviction.report.images_dropped,
                    "saved evicted document"
                );
                Ok(SaveOutcome::WrittenAfterEviction {
                    bytes: len,
                    report: eviction.report,
                })
            }
            Err(SubstrateError::QuotaExceeded { available, .. }) => {
                tracing::warn!(size = len, available, "retry after eviction still over quota");
                Err(PersistError::StorageExhausted {
                    size: len,
                    budget: available,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Loads the persisted document.
    ///
    /// # Errors
    /// - `NotFound` if nothing has been saved
    /// - `Corrupted` or `UnsupportedVersion` if the stored bytes cannot be used
    /// - `StorageUnavailable` if the substrate failed
    pub fn load(&self) -> Result<Snapshot, PersistError> {
        let mut state = self.state.lock().map_err(|_| lock_err("gateway.load"))?;
        let bytes = self
            .substrate
            .read(&self.config.document_key)?
            .ok_or_else(|| PersistError::NotFound {
                key: self.config.document_key.clone(),
            })?;
        let snapshot = Snapshot::from_bytes(&bytes)?;
        state.last_digest = Some(content_digest(&snapshot)?);
        tracing::info!(bytes = bytes.len(), records = snapshot.record_count(), "loaded document");
        Ok(snapshot)
    }

    /// Writes `snapshot` to the manual-recovery key.
    ///
    /// Recovery copies are never evicted: a copy that does not fit fails with
    /// `QuotaExceeded` and the caller keeps it in memory.
    ///
    /// # Errors
    ///
    /// `QuotaExceeded` if the copy does not fit, `StorageUnavailable` if the
    /// substrate failed, `Serialization` if the document cannot be encoded.
    pub fn save_recovery(&self, snapshot: &Snapshot) -> Result<u64, PersistError> {
        let bytes = snapshot.to_bytes()?;
        self.substrate.write(&self.config.recovery_key, &bytes)?;
        tracing::info!(bytes = bytes.len(), key = %self.config.recovery_key, "wrote recovery document");
        Ok(bytes.len() as u64)
    }

    /// Reads the manual-recovery copy, if one exists.
    ///
    /// # Errors
    ///
    /// `StorageUnavailable`, `Corrupted` or `UnsupportedVersion` as for
    /// [`load`](Self::load).
    pub fn load_recovery(&self) -> Result<Option<Snapshot>, PersistError> {
        match self.substrate.read(&self.config.recovery_key)? {
            Some(bytes) => Ok(Some(Snapshot::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Deletes the manual-recovery copy. Returns true if one existed.
    ///
    /// # Errors
    ///
    /// `StorageUnavailable` if the substrate failed.
    pub fn clear_recovery(&self) -> Result<bool, PersistError> {
        Ok(self.substrate.remove(&self.config.recovery_key)?)
    }

    /// Closes the current epoch and deletes the persisted document.
    ///
    /// Returns the new epoch. The recovery copy is left alone.
    ///
    /// # Errors
    ///
    /// `StorageUnavailable` if the document could not be deleted. The epoch is
    /// closed either way, so saves started before the reset never land.
    pub fn reset(&self) -> Result<u64, PersistError> {
        let mut state = self.state.lock().map_err(|_| lock_err("gateway.reset"))?;
        state.epoch += 1;
        state.last_digest = None;
        self.substrate.remove(&self.config.document_key)?;
        tracing::info!(epoch = state.epoch, "reset persisted document");
        Ok(state.epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eviction::EvictionConfig;
    use crate::record::ImageAdjustment;
    use crate::storage::InMemorySubstrate;
    use crate::time::ManualClock;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 15, 12, 0, 0).unwrap()
    }

    fn gateway(substrate: Arc<InMemorySubstrate>) -> PersistenceGateway {
        PersistenceGateway::new(
            substrate,
            EvictionPolicy::new(EvictionConfig::default()),
            Arc::new(ManualClock::new(now())),
            GatewayConfig::default(),
        )
    }

    fn record(name: &str, age: Duration, images: usize, size: usize) -> Record {
        let mut record = Record::new(EntityId::new(name).unwrap(), now() - age);
        for n in 0..images {
            record.push_image(
                ImageAsset::new(vec![7; size], format!("{name}-{n}.png")).unwrap(),
                ImageAdjustment::default(),
            );
        }
        record
    }

    fn snapshot(records: Vec<Record>) -> Snapshot {
        let mut snapshot = Snapshot::empty(now());
        for r in records {
            snapshot.records.insert(r.entity_id().clone(), r);
        }
        snapshot
    }

    #[test]
    fn test_save_then_load() {
        let substrate = Arc::new(InMemorySubstrate::new());
        let gw = gateway(Arc::clone(&substrate));
        let doc = snapshot(vec![record("A", Duration::hours(1), 2, 32)]);

        let outcome = gw.save(&doc).unwrap();
        assert!(outcome.wrote());
        assert_eq!(gw.load().unwrap(), doc);
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let gw = gateway(Arc::new(InMemorySubstrate::new()));
        assert!(matches!(gw.load(), Err(PersistError::NotFound { .. })));
    }

    #[test]
    fn test_unchanged_content_is_not_rewritten() {
        let substrate = Arc::new(InMemorySubstrate::new());
        let gw = gateway(Arc::clone(&substrate));
        let mut doc = snapshot(vec![record("A", Duration::hours(1), 1, 8)]);

        gw.save(&doc).unwrap();
        doc.saved_at = now() + Duration::seconds(30);
        assert!(matches!(gw.save(&doc).unwrap(), SaveOutcome::Unchanged { .. }));
        assert_eq!(substrate.write_count(), 1);
    }

    #[test]
    fn test_quota_triggers_one_eviction() {
        let doc = snapshot(vec![
            record("stale", Duration::days(10), 3, 400),
            record("fresh", Duration::hours(1), 1, 16),
        ]);
        let mut expected = doc.clone();
        expected.records.remove(&EntityId::new("stale").unwrap());
        let fits = expected.encoded_len().unwrap();

        let substrate = Arc::new(InMemorySubstrate::with_capacity(fits + 10));
        let gw = gateway(Arc::clone(&substrate));

        let outcome = gw.save(&doc).unwrap();
        let report = outcome.eviction().unwrap();
        assert_eq!(report.stale_records, vec![EntityId::new("stale").unwrap()]);
        assert_eq!(gw.load().unwrap(), expected);
        assert!(substrate.used_bytes().unwrap() <= fits + 10);
    }

    #[test]
    fn test_exhausted_when_eviction_is_not_enough() {
        let substrate = Arc::new(InMemorySubstrate::with_capacity(64));
        let gw = gateway(Arc::clone(&substrate));
        let doc = snapshot(vec![record("fresh", Duration::minutes(1), 2, 200)]);

        let err = gw.save(&doc).unwrap_err();
        assert!(matches!(err, PersistError::StorageExhausted { budget: 64, .. }));
        assert!(err.is_retryable());
        assert_eq!(substrate.write_count(), 0);
    }

    /// Reports a large free budget on every refusal, so eviction finds nothing
    /// to do and the retry is refused again.
    #[derive(Debug, Default)]
    struct ShrinkingQuota {
        attempts: AtomicU32,
    }

    impl Substrate for ShrinkingQuota {
        fn read(&self, _key: &str) -> Result<Option<Vec<u8>>, SubstrateError> {
            Ok(None)
        }

        fn write(&self, key: &str, value: &[u8]) -> Result<(), SubstrateError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(SubstrateError::QuotaExceeded {
                key: key.to_string(),
                requested: value.len() as u64,
                available: 1 << 20,
            })
        }

        fn remove(&self, _key: &str) -> Result<bool, SubstrateError> {
            Ok(false)
        }

        fn used_bytes(&self) -> Result<u64, SubstrateError> {
            Ok(0)
        }

        fn capacity(&self) -> Option<u64> {
            Some(1 << 20)
        }
    }

    #[test]
    fn test_exhausted_when_retry_after_eviction_is_refused() {
        let substrate = Arc::new(ShrinkingQuota::default());
        let gw = PersistenceGateway::new(
            substrate.clone(),
            EvictionPolicy::default(),
            Arc::new(ManualClock::new(now())),
            GatewayConfig::default(),
        );
        let doc = snapshot(vec![record("A", Duration::hours(1), 1, 64)]);

        let err = gw.save(&doc).unwrap_err();
        assert!(matches!(err, PersistError::StorageExhausted { budget, .. } if budget == 1 << 20));
        assert!(err.is_retryable());
        assert_eq!(substrate.attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_quota_without_eviction() {
        let substrate = Arc::new(InMemorySubstrate::with_capacity(16));
        let gw = PersistenceGateway::new(
            substrate,
            EvictionPolicy::default(),
            Arc::new(ManualClock::new(now())),
            GatewayConfig {
                evict_on_quota: false,
                ..GatewayConfig::default()
            },
        );
        let err = gw.save(&snapshot(vec![])).unwrap_err();
        assert!(matches!(err, PersistError::QuotaExceeded { available: 16, .. }));
    }

    #[test]
    fn test_unavailable_maps_to_storage_unavailable() {
        let substrate = Arc::new(InMemorySubstrate::new());
        substrate.fail_next_writes(1);
        let gw = gateway(Arc::clone(&substrate));

        let err = gw.save(&snapshot(vec![])).unwrap_err();
        assert!(matches!(err, PersistError::StorageUnavailable { .. }));
        gw.save(&snapshot(vec![])).unwrap();
    }

    #[test]
    fn test_reset_closes_epoch() {
        let substrate = Arc::new(InMemorySubstrate::new());
        let gw = gateway(Arc::clone(&substrate));
        let doc = snapshot(vec![record("A", Duration::hours(1), 0, 0)]);
        let old_epoch = gw.epoch().unwrap();
        gw.save(&doc).unwrap();

        let new_epoch = gw.reset().unwrap();
        assert_eq!(new_epoch, old_epoch + 1);
        assert!(matches!(gw.load(), Err(PersistError::NotFound { .. })));

        let outcome = gw.save_in_epoch(&doc, old_epoch).unwrap();
        assert_eq!(outcome, SaveOutcome::Superseded { epoch: old_epoch });
        assert!(substrate.peek(DEFAULT_DOCUMENT_KEY).is_none());
    }

    #[test]
    fn test_recovery_slot() {
        let substrate = Arc::new(InMemorySubstrate::new());
        let gw = gateway(Arc::clone(&substrate));
        assert_eq!(gw.load_recovery().unwrap(), None);

        let doc = snapshot(vec![record("A", Duration::hours(1), 1, 8)]);
        gw.save_recovery(&doc).unwrap();
        gw.reset().unwrap();
        assert_eq!(gw.load_recovery().unwrap(), Some(doc));

        assert!(gw.clear_recovery().unwrap());
        assert_eq!(gw.load_recovery().unwrap(), None);
    }

    #[test]
    fn test_corrupted_document() {
        let substrate = Arc::new(InMemorySubstrate::new());
        substrate.write(DEFAULT_DOCUMENT_KEY, b"{not json").unwrap();
        let gw = gateway(substrate);
        assert!(matches!(gw.load(), Err(PersistError::Corrupted { .. })));
    }

    #[test]
    fn test_config_validation() {
        let same = GatewayConfig {
            recovery_key: DEFAULT_DOCUMENT_KEY.to_string(),
            ..GatewayConfig::default()
        };
        assert!(same.validate().is_err());
        assert!(GatewayConfig::default().validate().is_ok());
    }
}
