//! The persisted document.
//!
//! A [`Snapshot`] is the complete state of a session at one instant: the
//! roster, the active entity, the global image lists and every record. It is
//! what the gateway writes, what eviction reduces and what batch rollback
//! restores.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PersistError, ValidationError};
use crate::record::{EntityId, ImageAdjustment, ImageAsset, Record};

/// Version tag written into every document.
pub const DOCUMENT_VERSION: &str = "dossier/1";

/// Default cap on the deleted-image history.
pub const DEFAULT_UNDO_HISTORY_CAP: usize = 50;

/// Default cap on miscellaneous imported images.
pub const DEFAULT_IMPORTED_IMAGES_CAP: usize = 25;

/// An image removed from an entity, kept so the user can restore it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletedImage {
    /// Entity the image was removed from.
    pub entity_id: EntityId,
    /// Position the image held before removal.
    pub index: usize,
    /// The removed image.
    pub image: ImageAsset,
    /// Its placement at the time of removal.
    #[serde(default)]
    pub adjustment: ImageAdjustment,
    /// When it was removed.
    pub deleted_at: DateTime<Utc>,
}

/// The full session document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Document format tag, see [`DOCUMENT_VERSION`].
    pub version: String,
    /// When the snapshot was taken.
    pub saved_at: DateTime<Utc>,
    /// Entity ids in roster order, as supplied by ingestion. Advisory only.
    pub roster: Vec<EntityId>,
    /// Entity the user is looking at.
    pub active_entity: Option<EntityId>,
    /// Images imported without an entity, oldest first.
    pub imported_images: Vec<ImageAsset>,
    /// Oldest first.
    pub undo_history: Vec<DeletedImage>,
    /// Every record, keyed by entity id.
    pub records: BTreeMap<EntityId, Record>,
}

impl Snapshot {
    /// An empty document stamped at `now`.
    #[must_use]
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            version: DOCUMENT_VERSION.to_string(),
            saved_at: now,
            roster: Vec::new(),
            active_entity: None,
            imported_images: Vec::new(),
            undo_history: Vec::new(),
            records: BTreeMap::new(),
        }
    }

    /// The record for `entity_id`, if present.
    #[must_use]
    pub fn record(&self, entity_id: &EntityId) -> Option<&Record> {
        self.records.get(entity_id)
    }

    /// Number of records.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Images held across all records.
    #[must_use]
    pub fn image_count(&self) -> usize {
        self.records.values().map(Record::image_count).sum()
    }

    /// True when the document holds nothing worth persisting.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.records.is_empty()
            && self.roster.is_empty()
            && self.imported_images.is_empty()
            && self.undo_history.is_empty()
            && self.active_entity.is_none()
    }

    /// Checks every float in the document, see [`Record::check_finite`].
    ///
    /// # Errors
    ///
    /// `ValidationError::NonFiniteNumber` for the first NaN or infinity.
    pub fn check_finite(&self) -> Result<(), ValidationError> {
        for record in self.records.values() {
            record.check_finite()?;
        }
        for entry in &self.undo_history {
            if let Some(part) = entry.adjustment.non_finite_part() {
                return Err(ValidationError::NonFiniteNumber {
                    entity_id: entry.entity_id.clone(),
                    path: format!("undo_history.adjustment.{part}"),
                });
            }
        }
        Ok(())
    }

    /// Serializes the document exactly as the gateway writes it.
    ///
    /// # Errors
    ///
    /// `PersistError::Serialization` if the document holds a NaN or infinity,
    /// which JSON would silently turn into `null` and make unloadable.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PersistError> {
        self.check_finite().map_err(|e| PersistError::Serialization {
            message: e.to_string(),
        })?;
        serde_json::to_vec(self).map_err(|e| PersistError::Serialization {
            message: e.to_string(),
        })
    }

    /// Parses a document, rejecting unknown versions.
    ///
    /// # Errors
    ///
    /// `UnsupportedVersion` for another format tag, `Corrupted` for anything
    /// else that does not parse.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PersistError> {
        #[derive(Deserialize)]
        struct VersionHeader {
            version: String,
        }

        let header: VersionHeader = serde_json::from_slice(bytes).map_err(|e| PersistError::Corrupted {
            message: format!("unreadable document header: {e}"),
        })?;
        if header.version != DOCUMENT_VERSION {
            return Err(PersistError::UnsupportedVersion {
                found: header.version,
                expected: DOCUMENT_VERSION.to_string(),
            });
        }

        serde_json::from_slice(bytes).map_err(|e| PersistError::Corrupted {
            message: e.to_string(),
        })
    }

    /// Size of the serialized document in bytes.
    ///
    /// # Errors
    ///
    /// Same as [`to_bytes`](Self::to_bytes).
    pub fn encoded_len(&self) -> Result<u64, PersistError> {
        Ok(self.to_bytes()?.len() as u64)
    }
}

/// Trims `list` to its newest `cap` entries, dropping from the front.
///
/// Every capped list in the crate is ordered oldest first, so this is the one
/// truncation rule: the most recently added entries survive. Returns the
/// number of entries dropped.
pub(crate) fn retain_latest<T>(list: &mut Vec<T>, cap: usize) -> usize {
    let excess = list.len().saturating_sub(cap);
    if excess > 0 {
        list.drain(..excess);
    }
    excess
}
