//! Entity records and their identity.
//!
//! A [`Record`] is the editable state of one tracked subject: its form fields,
//! its layout settings, the images placed on it and whatever opaque state
//! other collaborators park on it. Records are keyed by a caller-supplied
//! [`EntityId`] that never changes once issued.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::value::FieldValue;

/// Default cap on images attached to a single entity.
pub const DEFAULT_MAX_IMAGES_PER_ENTITY: usize = 10;

/// Longest accepted entity id, in bytes.
pub const MAX_ENTITY_ID_LEN: usize = 256;

/// Stable, caller-supplied entity identifier.
///
/// Ids come from the roster ingested by the host (row keys, names, codes).
/// Surrounding whitespace is trimmed; an empty id is rejected.
///
/// # Examples
///
/// ```
/// use dossier::EntityId;
///
/// let id = EntityId::new("  ACME-01 ").unwrap();
/// assert_eq!(id.as_str(), "ACME-01");
/// assert!(EntityId::new("   ").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Creates a validated entity id.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::EmptyEntityId` for blank input and
    /// `ValidationError::EntityIdTooLong` past [`MAX_ENTITY_ID_LEN`] bytes.
    pub fn new(raw: impl AsRef<str>) -> Result<Self, ValidationError> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyEntityId);
        }
        if trimmed.len() > MAX_ENTITY_ID_LEN {
            return Err(ValidationError::EntityIdTooLong {
                length: trimmed.len(),
                max_length: MAX_ENTITY_ID_LEN,
            });
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for EntityId {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<String> for EntityId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// Binary payloads travel as base64 text inside the JSON document.
pub(crate) mod payload_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// An image placed on an entity (or imported into the session).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAsset {
    /// Encoded image bytes, as produced by the image resolver.
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
    /// Display name (usually the source filename).
    pub name: String,
}

impl ImageAsset {
    /// Creates an image, rejecting blank names and empty payloads.
    ///
    /// # Errors
    ///
    /// `EmptyImageName` or `EmptyImagePayload`.
    pub fn new(payload: Vec<u8>, name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ValidationError::EmptyImageName);
        }
        if payload.is_empty() {
            return Err(ValidationError::EmptyImagePayload { name });
        }
        Ok(Self { payload, name })
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// True when the payload is empty (only possible for deserialized data).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// How images are arranged on the entity's page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutMode {
    /// Renderer picks the arrangement.
    #[default]
    Auto,
    /// Images in a grid.
    Grid,
    /// Images stacked in one column.
    Column,
    /// Images placed by their adjustments only.
    Freeform,
}

/// Per-image placement tweaks, positionally aligned with `Record::images`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAdjustment {
    /// Zoom factor, 1.0 is natural size.
    pub scale: f64,
    /// Horizontal pan.
    pub offset_x: f64,
    /// Vertical pan.
    pub offset_y: f64,
    /// Clockwise rotation in degrees.
    pub rotation_deg: i32,
}

impl ImageAdjustment {
    /// Name of the first NaN or infinite component, if any.
    pub(crate) fn non_finite_part(&self) -> Option<&'static str> {
        [
            ("scale", self.scale),
            ("offset_x", self.offset_x),
            ("offset_y", self.offset_y),
        ]
        .into_iter()
        .find(|(_, v)| !v.is_finite())
        .map(|(name, _)| name)
    }
}

impl Default for ImageAdjustment {
    fn default() -> Self {
        Self {
            scale: 1.0,
            offset_x: 0.0,
            offset_y: 0.0,
            rotation_deg: 0,
        }
    }
}

/// Layout settings for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutSettings {
    /// Arrangement of the entity's images.
    pub mode: LayoutMode,
    /// Page zoom factor.
    pub scale: f64,
    /// Horizontal page pan.
    pub offset_x: f64,
    /// Vertical page pan.
    pub offset_y: f64,
    /// Section ids the user pinned; the renderer must not reflow them.
    pub locked_sections: BTreeSet<String>,
    /// One entry per image, same order as the images.
    pub image_adjustments: Vec<ImageAdjustment>,
}

impl Default for LayoutSettings {
    fn default() -> Self {
        Self {
            mode: LayoutMode::Auto,
            scale: 1.0,
            offset_x: 0.0,
            offset_y: 0.0,
            locked_sections: BTreeSet::new(),
            image_adjustments: Vec::new(),
        }
    }
}

impl LayoutSettings {
    /// Locks a section. Returns false if it was already locked.
    pub fn lock_section(&mut self, section: impl Into<String>) -> bool {
        self.locked_sections.insert(section.into())
    }

    /// Unlocks a section. Returns false if it was not locked.
    pub fn unlock_section(&mut self, section: &str) -> bool {
        self.locked_sections.remove(section)
    }

    /// True if the section is locked.
    #[must_use]
    pub fn is_locked(&self, section: &str) -> bool {
        self.locked_sections.contains(section)
    }
}

/// The tracked, editable state of one entity.
///
/// `images` and `updated_at` are only changed through the
/// [`RecordStore`](crate::RecordStore), which enforces the image cap and keeps
/// the timestamp monotonic. Everything else is free for mutators to edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    entity_id: EntityId,
    /// Form-like settings keyed by field name.
    pub fields: BTreeMap<String, FieldValue>,
    /// Page layout.
    pub layout: LayoutSettings,
    images: Vec<ImageAsset>,
    /// Opaque state owned by external collaborators. Persisted, never read.
    #[serde(default)]
    pub auxiliary_state: serde_json::Value,
    updated_at: DateTime<Utc>,
}

impl Record {
    /// Creates an empty record stamped at `now`.
    #[must_use]
    pub fn new(entity_id: EntityId, now: DateTime<Utc>) -> Self {
        Self {
            entity_id,
            fields: BTreeMap::new(),
            layout: LayoutSettings::default(),
            images: Vec::new(),
            auxiliary_state: serde_json::Value::Null,
            updated_at: now,
        }
    }

    /// The entity this record belongs to.
    #[must_use]
    pub const fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    /// Images in placement order.
    #[must_use]
    pub fn images(&self) -> &[ImageAsset] {
        &self.images
    }

    /// Number of images held.
    #[must_use]
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Time of the last mutation.
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Returns a field value, if set.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Sets a field, returning the previous value.
    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Option<FieldValue> {
        self.fields.insert(name.into(), value.into())
    }

    /// Checks that every float in the record is finite.
    ///
    /// JSON has no NaN or infinity, so a record holding one could be saved
    /// but never loaded again.
    ///
    /// # Errors
    ///
    /// `ValidationError::NonFiniteNumber` naming the first offending value.
    pub fn check_finite(&self) -> Result<(), ValidationError> {
        let non_finite = |path: String| ValidationError::NonFiniteNumber {
            entity_id: self.entity_id.clone(),
            path,
        };
        for (name, value) in &self.fields {
            if matches!(value, FieldValue::Float(v) if !v.is_finite()) {
                return Err(non_finite(format!("fields.{name}")));
            }
        }
        let layout = [
            ("layout.scale", self.layout.scale),
            ("layout.offset_x", self.layout.offset_x),
            ("layout.offset_y", self.layout.offset_y),
        ];
        if let Some((path, _)) = layout.iter().find(|(_, v)| !v.is_finite()) {
            return Err(non_finite((*path).to_string()));
        }
        for (n, adjustment) in self.layout.image_adjustments.iter().enumerate() {
            if let Some(part) = adjustment.non_finite_part() {
                return Err(non_finite(format!("layout.image_adjustments[{n}].{part}")));
            }
        }
        Ok(())
    }

    /// Stamps the record, never moving `updated_at` backwards.
    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    pub(crate) fn push_image(&mut self, image: ImageAsset, adjustment: ImageAdjustment) {
        self.align_adjustments();
        self.images.push(image);
        self.layout.image_adjustments.push(adjustment);
    }

    pub(crate) fn insert_image(&mut self, index: usize, image: ImageAsset, adjustment: ImageAdjustment) {
        self.align_adjustments();
        let at = index.min(self.images.len());
        self.images.insert(at, image);
        self.layout.image_adjustments.insert(at, adjustment);
    }

    pub(crate) fn remove_image(&mut self, index: usize) -> Option<(ImageAsset, ImageAdjustment)> {
        if index >= self.images.len() {
            return None;
        }
        self.align_adjustments();
        let image = self.images.remove(index);
        let adjustment = self.layout.image_adjustments.remove(index);
        Some((image, adjustment))
    }

    /// Keeps the newest `keep` images (and their adjustments). Returns how many
    /// were dropped.
    pub(crate) fn retain_latest_images(&mut self, keep: usize) -> usize {
        self.align_adjustments();
        let dropped = crate::snapshot::retain_latest(&mut self.images, keep);
        crate::snapshot::retain_latest(&mut self.layout.image_adjustments, keep);
        dropped
    }

    /// Pads or trims `layout.image_adjustments` to one entry per image.
    pub(crate) fn align_adjustments(&mut self) {
        let adjustments = &mut self.layout.image_adjustments;
        if adjustments.len() != self.images.len() {
            adjustments.resize_with(self.images.len(), ImageAdjustment::default);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn image(name: &str) -> ImageAsset {
        ImageAsset::new(name.as_bytes().to_vec(), name).unwrap()
    }

    #[test]
    fn test_entity_id_validation() {
        assert_eq!(EntityId::new(""), Err(ValidationError::EmptyEntityId));
        let long = "x".repeat(MAX_ENTITY_ID_LEN + 1);
        assert!(matches!(
            EntityId::new(long),
            Err(ValidationError::EntityIdTooLong { .. })
        ));
        assert_eq!(EntityId::try_from("row-7").unwrap().to_string(), "row-7");
    }

    #[test]
    fn test_image_asset_validation() {
        assert_eq!(
            ImageAsset::new(vec![1], "  "),
            Err(ValidationError::EmptyImageName)
        );
        assert!(matches!(
            ImageAsset::new(Vec::new(), "a.png"),
            Err(ValidationError::EmptyImagePayload { .. })
        ));
    }

    #[test]
    fn test_touch_is_monotonic() {
        let mut record = Record::new(EntityId::new("A").unwrap(), t0());
        record.touch(t0() - chrono::Duration::hours(1));
        assert_eq!(record.updated_at(), t0());

        record.touch(t0() + chrono::Duration::hours(1));
        assert_eq!(record.updated_at(), t0() + chrono::Duration::hours(1));
    }

    #[test]
    fn test_adjustments_follow_images() {
        let mut record = Record::new(EntityId::new("A").unwrap(), t0());
        record.push_image(image("a"), ImageAdjustment::default());
        record.push_image(
            image("b"),
            ImageAdjustment {
                scale: 2.0,
                ..ImageAdjustment::default()
            },
        );

        let (removed, adjustment) = record.remove_image(1).unwrap();
        assert_eq!(removed.name, "b");
        assert!((adjustment.scale - 2.0).abs() < f64::EPSILON);
        assert_eq!(record.layout.image_adjustments.len(), 1);
        assert!(record.remove_image(5).is_none());
    }

    #[test]
    fn test_retain_latest_images_keeps_newest() {
        let mut record = Record::new(EntityId::new("A").unwrap(), t0());
        for name in ["a", "b", "c", "d"] {
            record.push_image(image(name), ImageAdjustment::default());
        }
        assert_eq!(record.retain_latest_images(2), 2);
        let names: Vec<_> = record.images().iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["c", "d"]);
        assert_eq!(record.layout.image_adjustments.len(), 2);
    }

    #[test]
    fn test_payload_serializes_as_base64() {
        let mut record = Record::new(EntityId::new("A").unwrap(), t0());
        record.push_image(ImageAsset::new(vec![0xff, 0x00, 0x10], "x.png").unwrap(), ImageAdjustment::default());

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["images"][0]["payload"], "/wAQ");

        let back: Record = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_locked_sections() {
        let mut layout = LayoutSettings::default();
        assert!(layout.lock_section("header"));
        assert!(!layout.lock_section("header"));
        assert!(layout.is_locked("header"));
        assert!(layout.unlock_section("header"));
        assert!(!layout.is_locked("header"));
    }

    #[test]
    fn test_check_finite_names_offending_value() {
        let mut record = Record::new(EntityId::new("A").unwrap(), t0());
        record.set_field("ratio", 0.1);
        record.layout.scale = 1.3;
        assert!(record.check_finite().is_ok());

        record.set_field("ratio", f64::NAN);
        assert!(matches!(
            record.check_finite(),
            Err(ValidationError::NonFiniteNumber { ref path, .. }) if path == "fields.ratio"
        ));

        record.set_field("ratio", 0.5);
        record.push_image(image("a"), ImageAdjustment::default());
        record.layout.image_adjustments[0].offset_y = f64::INFINITY;
        assert!(matches!(
            record.check_finite(),
            Err(ValidationError::NonFiniteNumber { ref path, .. })
                if path == "layout.image_adjustments[0].offset_y"
        ));
    }
}
