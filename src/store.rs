//! The in-memory record store.
//!
//! [`RecordStore`] is the authoritative, session-local map of entity records
//! plus the session-wide lists (roster, imported images, deleted-image
//! history). It never performs I/O: persistence reads it through
//! [`RecordStore::snapshot`] and batch rollback writes it back through
//! [`RecordStore::restore`].
//!
//! # Capacity policy
//!
//! Appending past a cap is refused with an error; nothing the user placed is
//! silently discarded at append time. The deleted-image history is the one
//! ring buffer: pushing into a full history drops its oldest entry.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, ValidationError};
use crate::record::{
    EntityId, ImageAdjustment, ImageAsset, Record, DEFAULT_MAX_IMAGES_PER_ENTITY,
};
use crate::snapshot::{
    retain_latest, DeletedImage, Snapshot, DEFAULT_IMPORTED_IMAGES_CAP, DEFAULT_UNDO_HISTORY_CAP,
    DOCUMENT_VERSION,
};
use crate::time::{Clock, SystemClock};

/// Caps enforced by the store at append time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum images per entity.
    pub max_images_per_entity: usize,
    /// Maximum miscellaneous imported images.
    pub imported_images_cap: usize,
    /// Maximum deleted-image history entries.
    pub undo_history_cap: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_images_per_entity: DEFAULT_MAX_IMAGES_PER_ENTITY,
            imported_images_cap: DEFAULT_IMPORTED_IMAGES_CAP,
            undo_history_cap: DEFAULT_UNDO_HISTORY_CAP,
        }
    }
}

impl StoreConfig {
    /// Checks the caps.
    ///
    /// # Errors
    ///
    /// `ValidationError::InvalidConfig` for a zero image or history cap.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.max_images_per_entity == 0 {
            return Err(ValidationError::config(
                "store.max_images_per_entity",
                "must be at least 1",
            ));
        }
        if self.undo_history_cap == 0 {
            return Err(ValidationError::config(
                "store.undo_history_cap",
                "must be at least 1",
            ));
        }
        Ok(self)
    }
}

/// Session-local store of entity records.
pub struct RecordStore {
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    records: BTreeMap<EntityId, Record>,
    roster: Vec<EntityId>,
    active_entity: Option<EntityId>,
    imported_images: Vec<ImageAsset>,
    undo_history: Vec<DeletedImage>,
}

impl fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordStore")
            .field("records", &self.records.len())
            .field("roster", &self.roster.len())
            .field("active_entity", &self.active_entity)
            .field("imported_images", &self.imported_images.len())
            .field("undo_history", &self.undo_history.len())
            .finish_non_exhaustive()
    }
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new(StoreConfig::default(), Arc::new(SystemClock))
    }
}

impl RecordStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            records: BTreeMap::new(),
            roster: Vec::new(),
            active_entity: None,
            imported_images: Vec::new(),
            undo_history: Vec::new(),
        }
    }

    /// Creates a store holding the contents of a loaded document.
    ///
    /// The document is taken as-is, including lists longer than the current
    /// caps; caps only gate new appends.
    #[must_use]
    pub fn from_snapshot(config: StoreConfig, clock: Arc<dyn Clock>, snapshot: Snapshot) -> Self {
        let mut store = Self::new(config, clock);
        store.restore(snapshot);
        store
    }

    /// The active caps.
    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when no record exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// True if the entity has a record.
    #[must_use]
    pub fn contains(&self, entity_id: &EntityId) -> bool {
        self.records.contains_key(entity_id)
    }

    /// Entity ids with a record, in key order.
    pub fn entity_ids(&self) -> impl Iterator<Item = &EntityId> {
        self.records.keys()
    }

    /// Returns the record for `entity_id`.
    ///
    /// # Errors
    ///
    /// `StoreError::NotFound` if the entity has no record.
    pub fn get(&self, entity_id: &EntityId) -> Result<&Record, StoreError> {
        self.records.get(entity_id).ok_or_else(|| StoreError::NotFound {
            entity_id: entity_id.clone(),
        })
    }

    /// Applies `mutator` to the entity's record, creating an empty record
    /// first if none exists, and stamps `updated_at`.
    ///
    /// Numbers are not checked here. A NaN or infinity written through this
    /// path makes the next save fail with `PersistError::Serialization`; use
    /// [`try_upsert`](Self::try_upsert) to reject them up front.
    pub fn upsert<F>(&mut self, entity_id: &EntityId, mutator: F) -> &Record
    where
        F: FnOnce(&mut Record),
    {
        let now = self.clock.now();
        let record = self
            .records
            .entry(entity_id.clone())
            .or_insert_with(|| Record::new(entity_id.clone(), now));
        mutator(record);
        record.align_adjustments();
        record.touch(now);
        record
    }

    /// Like [`upsert`](Self::upsert) for mutators that can fail.
    ///
    /// The mutator runs against a copy of the record; the store only changes if
    /// it returns `Ok` and the result holds no NaN or infinite numbers.
    ///
    /// # Errors
    ///
    /// - `StoreError::Mutation` carrying the mutator's error message
    /// - `ValidationError::NonFiniteNumber` if the mutated record holds a NaN
    ///   or infinity
    pub fn try_upsert<F, E>(&mut self, entity_id: &EntityId, mutator: F) -> Result<&Record, StoreError>
    where
        F: FnOnce(&mut Record) -> Result<(), E>,
        E: fmt::Display,
    {
        let now = self.clock.now();
        let mut working = self
            .records
            .get(entity_id)
            .cloned()
            .unwrap_or_else(|| Record::new(entity_id.clone(), now));

        mutator(&mut working).map_err(|e| StoreError::Mutation {
            entity_id: entity_id.clone(),
            reason: e.to_string(),
        })?;
        working.check_finite()?;

        working.align_adjustments();
        working.touch(now);
        let slot = match self.records.entry(entity_id.clone()) {
            Entry::Occupied(mut occupied) => {
                occupied.insert(working);
                occupied.into_mut()
            }
            Entry::Vacant(vacant) => vacant.insert(working),
        };
        Ok(slot)
    }

    /// Appends an image to the entity, creating its record if needed.
    /// Returns the entity's new image count.
    ///
    /// # Errors
    ///
    /// - `StoreError::Validation` for a blank name or empty payload
    /// - `StoreError::CapacityExceeded` if the entity already holds
    ///   `max_images_per_entity` images; the record is left untouched
    pub fn append_image(
        &mut self,
        entity_id: &EntityId,
        payload: Vec<u8>,
        name: impl Into<String>,
    ) -> Result<usize, StoreError> {
        let image = ImageAsset::new(payload, name)?;
        self.append_asset(entity_id, image, ImageAdjustment::default())
    }

    fn append_asset(
        &mut self,
        entity_id: &EntityId,
        image: ImageAsset,
        adjustment: ImageAdjustment,
    ) -> Result<usize, StoreError> {
        let max = self.config.max_images_per_entity;
        if self
            .records
            .get(entity_id)
            .is_some_and(|record| record.image_count() >= max)
        {
            return Err(StoreError::CapacityExceeded {
                entity_id: entity_id.clone(),
                max,
            });
        }

        let record = self.upsert(entity_id, |record| record.push_image(image, adjustment));
        Ok(record.image_count())
    }

    /// Removes the image at `index` and records it in the deleted-image
    /// history so it can be restored.
    ///
    /// # Errors
    ///
    /// `StoreError::NotFound` for an unknown entity and
    /// `ValidationError::ImageIndexOutOfRange` for a bad index.
    pub fn remove_image(&mut self, entity_id: &EntityId, index: usize) -> Result<ImageAsset, StoreError> {
        let now = self.clock.now();
        let record = self.records.get_mut(entity_id).ok_or_else(|| StoreError::NotFound {
            entity_id: entity_id.clone(),
        })?;

        let len = record.image_count();
        let (image, adjustment) = record.remove_image(index).ok_or_else(|| {
            ValidationError::ImageIndexOutOfRange {
                entity_id: entity_id.clone(),
                index,
                len,
            }
        })?;
        record.touch(now);

        self.push_deleted(DeletedImage {
            entity_id: entity_id.clone(),
            index,
            image: image.clone(),
            adjustment,
            deleted_at: now,
        });
        Ok(image)
    }

    /// Appends an entry to the deleted-image history, dropping the oldest
    /// entry once the history is full.
    pub fn push_deleted(&mut self, entry: DeletedImage) {
        self.undo_history.push(entry);
        let dropped = retain_latest(&mut self.undo_history, self.config.undo_history_cap);
        if dropped > 0 {
            tracing::debug!(dropped, cap = self.config.undo_history_cap, "deleted-image history full");
        }
    }

    /// Puts the most recently deleted image back where it was.
    ///
    /// Returns the entity that received it.
    ///
    /// # Errors
    ///
    /// - `StoreError::UndoHistoryEmpty` when there is nothing to restore
    /// - `StoreError::CapacityExceeded` if the entity is full; the history
    ///   entry is kept so the restore can be retried
    pub fn restore_deleted_image(&mut self) -> Result<EntityId, StoreError> {
        let entry = self.undo_history.last().cloned().ok_or(StoreError::UndoHistoryEmpty)?;

        let max = self.config.max_images_per_entity;
        if self
            .records
            .get(&entry.entity_id)
            .is_some_and(|record| record.image_count() >= max)
        {
            return Err(StoreError::CapacityExceeded {
                entity_id: entry.entity_id,
                max,
            });
        }

        self.undo_history.pop();
        let DeletedImage {
            entity_id,
            index,
            image,
            adjustment,
            ..
        } = entry;
        self.upsert(&entity_id, |record| record.insert_image(index, image, adjustment));
        Ok(entity_id)
    }

    /// Deleted-image history, oldest first.
    #[must_use]
    pub fn undo_history(&self) -> &[DeletedImage] {
        &self.undo_history
    }

    /// Removes the entity's record. Returns it if one existed.
    pub fn delete(&mut self, entity_id: &EntityId) -> Option<Record> {
        let removed = self.records.remove(entity_id);
        if removed.is_some() && self.active_entity.as_ref() == Some(entity_id) {
            self.active_entity = None;
        }
        removed
    }

    /// Replaces the roster. Ids are not checked against existing records.
    pub fn set_roster(&mut self, roster: Vec<EntityId>) {
        self.roster = roster;
    }

    /// The roster as last set.
    #[must_use]
    pub fn roster(&self) -> &[EntityId] {
        &self.roster
    }

    /// Points the session at an entity (or at nothing).
    pub fn set_active_entity(&mut self, entity_id: Option<EntityId>) {
        self.active_entity = entity_id;
    }

    /// The active entity, if any.
    #[must_use]
    pub const fn active_entity(&self) -> Option<&EntityId> {
        self.active_entity.as_ref()
    }

    /// Adds an image to the session-wide imported list. Returns the new list
    /// length.
    ///
    /// # Errors
    ///
    /// `StoreError::ImportCapacityExceeded` once `imported_images_cap` is
    /// reached.
    pub fn import_image(&mut self, payload: Vec<u8>, name: impl Into<String>) -> Result<usize, StoreError> {
        let image = ImageAsset::new(payload, name)?;
        let max = self.config.imported_images_cap;
        if self.imported_images.len() >= max {
            return Err(StoreError::ImportCapacityExceeded { max });
        }
        self.imported_images.push(image);
        Ok(self.imported_images.len())
    }

    /// Removes and returns an imported image.
    pub fn take_imported_image(&mut self, index: usize) -> Option<ImageAsset> {
        (index < self.imported_images.len()).then(|| self.imported_images.remove(index))
    }

    /// Imported images, oldest first.
    #[must_use]
    pub fn imported_images(&self) -> &[ImageAsset] {
        &self.imported_images
    }

    /// Copies the whole store into a document stamped with the current time.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            version: DOCUMENT_VERSION.to_string(),
            saved_at: self.clock.now(),
            roster: self.roster.clone(),
            active_entity: self.active_entity.clone(),
            imported_images: self.imported_images.clone(),
            undo_history: self.undo_history.clone(),
            records: self.records.clone(),
        }
    }

    /// Replaces the whole store with the contents of `snapshot`.
    pub fn restore(&mut self, snapshot: Snapshot) {
        let Snapshot {
            roster,
            active_entity,
            imported_images,
            undo_history,
            records,
            ..
        } = snapshot;
        self.roster = roster;
        self.active_entity = active_entity;
        self.imported_images = imported_images;
        self.undo_history = undo_history;
        self.records = records;
    }

    /// Drops every record and list.
    pub fn clear(&mut self) {
        self.records.clear();
        self.roster.clear();
        self.active_entity = None;
        self.imported_images.clear();
        self.undo_history.clear();
    }
}
