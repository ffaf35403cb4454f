//! Quota-driven eviction.
//!
//! When the backing substrate refuses a document for lack of space, the
//! gateway asks the [`EvictionPolicy`] for a smaller one. The policy is a pure
//! function of `(snapshot, budget, now)` and makes exactly one pass, in this
//! order:
//!
//! 1. drop records whose `updated_at` is older than `max_age`
//! 2. trim each surviving record to its newest `retained_images_per_entity`
//!    images
//! 3. trim the imported-image list and deleted-image history to their caps,
//!    keeping the newest entries
//! 4. measure the result
//!
//! It never loops. A result still over budget is reported as such and the
//! caller decides what to do; evicting harder would mean unbounded data loss.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PersistError, ValidationError};
use crate::record::{EntityId, DEFAULT_MAX_IMAGES_PER_ENTITY};
use crate::snapshot::{retain_latest, Snapshot, DEFAULT_IMPORTED_IMAGES_CAP, DEFAULT_UNDO_HISTORY_CAP};

/// Default age past which an untouched record may be evicted (7 days).
pub const DEFAULT_MAX_AGE_SECS: u64 = 7 * 24 * 60 * 60;

/// Tunables for [`EvictionPolicy`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Records not updated within this many seconds are dropped first.
    pub max_age_secs: u64,
    /// Images kept per surviving record.
    pub retained_images_per_entity: usize,
    /// Imported images kept, newest first.
    pub imported_images_cap: usize,
    /// Deleted-image history entries kept, newest first.
    pub undo_history_cap: usize,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            max_age_secs: DEFAULT_MAX_AGE_SECS,
            retained_images_per_entity: DEFAULT_MAX_IMAGES_PER_ENTITY,
            imported_images_cap: DEFAULT_IMPORTED_IMAGES_CAP,
            undo_history_cap: DEFAULT_UNDO_HISTORY_CAP,
        }
    }
}

impl EvictionConfig {
    /// Checks the thresholds.
    ///
    /// # Errors
    ///
    /// `ValidationError::InvalidConfig` for a zero or out-of-range age.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.max_age_secs == 0 {
            return Err(ValidationError::config(
                "eviction.max_age_secs",
                "must be greater than zero",
            ));
        }
        if i64::try_from(self.max_age_secs).is_err() {
            return Err(ValidationError::config("eviction.max_age_secs", "is out of range"));
        }
        Ok(self)
    }

    fn max_age(&self) -> Duration {
        i64::try_from(self.max_age_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX)
    }
}

/// What one eviction pass removed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EvictionReport {
    /// Records dropped for age, in key order.
    pub stale_records: Vec<EntityId>,
    /// Images trimmed from surviving records.
    pub images_dropped: usize,
    /// Imported images dropped.
    pub imported_dropped: usize,
    /// History entries dropped.
    pub undo_dropped: usize,
    /// Encoded size before the pass.
    pub size_before: u64,
    /// Encoded size after the pass.
    pub size_after: u64,
    /// Byte budget the pass aimed for.
    pub budget: u64,
}

impl EvictionReport {
    /// True if the evicted document fits the budget.
    #[must_use]
    pub const fn within_budget(&self) -> bool {
        self.size_after <= self.budget
    }

    /// True if nothing was removed.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.stale_records.is_empty()
            && self.images_dropped == 0
            && self.imported_dropped == 0
            && self.undo_dropped == 0
    }
}

/// The reduced document together with its report.
#[derive(Debug, Clone)]
pub struct Eviction {
    /// The reduced document.
    pub snapshot: Snapshot,
    /// What was removed.
    pub report: EvictionReport,
}

/// Deterministic single-pass eviction.
#[derive(Debug, Clone, Default)]
pub struct EvictionPolicy {
    config: EvictionConfig,
}

impl EvictionPolicy {
    /// Creates a policy with `config`.
    #[must_use]
    pub const fn new(config: EvictionConfig) -> Self {
        Self { config }
    }

    /// The active thresholds.
    #[must_use]
    pub const fn config(&self) -> &EvictionConfig {
        &self.config
    }

    /// Reduces `snapshot` toward `budget` bytes.
    ///
    /// A document already within budget comes back unchanged. Otherwise one
    /// pass runs; check [`EvictionReport::within_budget`] on the result.
    ///
    /// # Errors
    ///
    /// `PersistError::Serialization` if the document cannot be measured.
    pub fn evict(&self, snapshot: &Snapshot, budget: u64, now: DateTime<Utc>) -> Result<Eviction, PersistError> {
        let size_before = snapshot.encoded_len()?;
        if size_before <= budget {
            return Ok(Eviction {
                snapshot: snapshot.clone(),
                report: EvictionReport {
                    size_before,
                    size_after: size_before,
                    budget,
                    ..EvictionReport::default()
                },
            });
        }

        let mut reduced = snapshot.clone();
        let mut report = EvictionReport {
            size_before,
            budget,
            ..EvictionReport::default()
        };

        let cutoff = now.checked_sub_signed(self.config.max_age()).unwrap_or(DateTime::<Utc>::MIN_UTC);
        reduced.records.retain(|entity_id, record| {
            let fresh = record.updated_at() >= cutoff;
            if !fresh {
                report.stale_records.push(entity_id.clone());
            }
            fresh
        });

        for record in reduced.records.values_mut() {
            report.images_dropped += record.retain_latest_images(self.config.retained_images_per_entity);
        }

        report.imported_dropped = retain_latest(&mut reduced.imported_images, self.config.imported_images_cap);
        report.undo_dropped = retain_latest(&mut reduced.undo_history, self.config.undo_history_cap);

        report.size_after = reduced.encoded_len()?;

        tracing::warn!(
            stale_records = report.stale_records.len(),
            images_dropped = report.images_dropped,
            imported_dropped = report.imported_dropped,
            undo_dropped = report.undo_dropped,
            size_before = report.size_before,
            size_after = report.size_after,
            budget,
            "evicted snapshot to fit storage quota"
        );

        Ok(Eviction {
            snapshot: reduced,
            report,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ImageAdjustment, ImageAsset, Record};
    use crate::snapshot::DeletedImage;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 15, 12, 0, 0).unwrap()
    }

    fn record(name: &str, age: Duration, images: usize, image_size: usize) -> Record {
        let mut record = Record::new(EntityId::new(name).unwrap(), now() - age);
        for n in 0..images {
            record.push_image(
                ImageAsset::new(vec![n as u8; image_size], format!("{name}-{n}.png")).unwrap(),
                ImageAdjustment::default(),
            );
        }
        record
    }

    fn snapshot_with(records: Vec<Record>) -> Snapshot {
        let mut snapshot = Snapshot::empty(now());
        for r in records {
            snapshot.records.insert(r.entity_id().clone(), r);
        }
        snapshot
    }

    #[test]
    fn test_under_budget_is_unchanged() {
        let snapshot = snapshot_with(vec![record("old", Duration::days(30), 1, 8)]);
        let size = snapshot.encoded_len().unwrap();

        let eviction = EvictionPolicy::default().evict(&snapshot, size, now()).unwrap();
        assert_eq!(eviction.snapshot, snapshot);
        assert!(eviction.report.is_noop());
        assert!(eviction.report.within_budget());
    }

    #[test]
    fn test_drops_stale_records_first() {
        let snapshot = snapshot_with(vec![
            record("stale", Duration::days(8), 3, 512),
            record("fresh", Duration::hours(1), 1, 16),
        ]);
        let size = snapshot.encoded_len().unwrap();

        let eviction = EvictionPolicy::default().evict(&snapshot, size - 1, now()).unwrap();
        let report = &eviction.report;
        assert_eq!(report.stale_records, vec![EntityId::new("stale").unwrap()]);
        assert!(eviction.snapshot.record(&EntityId::new("fresh").unwrap()).is_some());
        assert!(report.within_budget());
        assert_eq!(report.size_after, eviction.snapshot.encoded_len().unwrap());
    }

    #[test]
    fn test_record_exactly_at_threshold_survives() {
        let snapshot = snapshot_with(vec![
            record("edge", Duration::days(7), 1, 64),
            record("past", Duration::days(7) + Duration::seconds(1), 1, 64),
        ]);
        let eviction = EvictionPolicy::default().evict(&snapshot, 1, now()).unwrap();
        assert_eq!(eviction.report.stale_records, vec![EntityId::new("past").unwrap()]);
        assert!(!eviction.report.within_budget());
    }

    #[test]
    fn test_trims_images_to_newest() {
        let config = EvictionConfig {
            retained_images_per_entity: 2,
            ..EvictionConfig::default()
        };
        let snapshot = snapshot_with(vec![record("busy", Duration::hours(2), 5, 256)]);
        let size = snapshot.encoded_len().unwrap();

        let eviction = EvictionPolicy::new(config).evict(&snapshot, size / 2, now()).unwrap();
        let busy = eviction.snapshot.record(&EntityId::new("busy").unwrap()).unwrap();
        let names: Vec<_> = busy.images().iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["busy-3.png", "busy-4.png"]);
        assert_eq!(busy.layout.image_adjustments.len(), 2);
        assert_eq!(eviction.report.images_dropped, 3);
    }

    #[test]
    fn test_trims_global_lists() {
        let config = EvictionConfig {
            imported_images_cap: 2,
            undo_history_cap: 1,
            ..EvictionConfig::default()
        };
        let mut snapshot = Snapshot::empty(now());
        for n in 0..4u8 {
            snapshot
                .imported_images
                .push(ImageAsset::new(vec![n; 64], format!("loose-{n}")).unwrap());
            snapshot.undo_history.push(DeletedImage {
                entity_id: EntityId::new("A").unwrap(),
                index: 0,
                image: ImageAsset::new(vec![n; 64], format!("gone-{n}")).unwrap(),
                adjustment: ImageAdjustment::default(),
                deleted_at: now(),
            });
        }

        let eviction = EvictionPolicy::new(config).evict(&snapshot, 10, now()).unwrap();
        let kept: Vec<_> = eviction.snapshot.imported_images.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(kept, vec!["loose-2", "loose-3"]);
        assert_eq!(eviction.snapshot.undo_history[0].image.name, "gone-3");
        assert_eq!(eviction.report.imported_dropped, 2);
        assert_eq!(eviction.report.undo_dropped, 3);
    }

    #[test]
    fn test_second_pass_is_identity() {
        let snapshot = snapshot_with(vec![
            record("stale", Duration::days(9), 4, 300),
            record("fresh", Duration::minutes(5), 10, 300),
        ]);
        let policy = EvictionPolicy::new(EvictionConfig {
            retained_images_per_entity: 4,
            ..EvictionConfig::default()
        });
        let budget = 200;

        let once = policy.evict(&snapshot, budget, now()).unwrap();
        let twice = policy.evict(&once.snapshot, budget, now()).unwrap();
        assert_eq!(twice.snapshot, once.snapshot);
        assert!(twice.report.is_noop());
    }

    #[test]
    fn test_config_validation() {
        let bad = EvictionConfig {
            max_age_secs: 0,
            ..EvictionConfig::default()
        };
        assert!(bad.validate().is_err());
        assert!(EvictionConfig::default().validate().is_ok());
    }
}
