//! Scalar values held in a record's form fields.
//!
//! Fields are the form-like settings of a record: titles, toggles, counts,
//! free text. Only scalars are allowed here; nested state owned by other
//! collaborators belongs in `Record::auxiliary_state`.

use serde::{Deserialize, Serialize};

/// A single form field value.
///
/// # Examples
///
/// ```
/// use dossier::FieldValue;
///
/// let title = FieldValue::from("Quarterly review");
/// let visible = FieldValue::from(true);
///
/// assert_eq!(title.as_text(), Some("Quarterly review"));
/// assert_eq!(visible.as_bool(), Some(true));
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    /// A toggle.
    Bool(bool),
    /// A whole number.
    Int(i64),
    /// A real number.
    Float(f64),
    /// Free text.
    Text(String),
    /// Unset.
    #[default]
    Null,
}

impl FieldValue {
    /// True for `Null`.
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The value as a bool.
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as an integer.
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as a float; integers convert.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// The value as text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Returns a human-readable type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Null => "null",
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v:?}"),
            Self::Null => write!(f, "null"),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_reads_as_float() {
        let val = FieldValue::Int(42);
        assert_eq!(val.as_int(), Some(42));
        assert_eq!(val.as_float(), Some(42.0));
        assert_eq!(val.type_name(), "int");
    }

    #[test]
    fn test_type_mismatch_is_none() {
        let val = FieldValue::Bool(true);
        assert!(val.as_int().is_none());
        assert!(val.as_float().is_none());
        assert!(val.as_text().is_none());
    }

    #[test]
    fn test_option_conversion() {
        let none: Option<&str> = None;
        assert!(FieldValue::from(none).is_null());
        assert_eq!(FieldValue::from(Some(7)), FieldValue::Int(7));
    }

    #[test]
    fn test_display() {
        assert_eq!(FieldValue::Text("hi".into()).to_string(), "\"hi\"");
        assert_eq!(FieldValue::Null.to_string(), "null");
    }

    #[test]
    fn test_tagged_serialization() {
        let json = serde_json::to_value(FieldValue::Float(1.5)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "float", "value": 1.5}));

        let back: FieldValue = serde_json::from_value(json).unwrap();
        assert_eq!(back, FieldValue::Float(1.5));
    }
}
