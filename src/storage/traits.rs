//! Abstract backing substrate.
//!
//! A substrate is a capacity-bounded key/value area, the way browser storage
//! or a quota-limited directory behaves. The persistence gateway is its only
//! writer. By using a trait, we enable:
//! - An in-memory fake with a configurable byte budget for tests
//! - A file-backed substrate for real sessions

use std::fmt;

use thiserror::Error;

/// Errors reported by a substrate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubstrateError {
    /// The write would push usage past capacity.
    ///
    /// `available` is the largest value this key could hold right now, i.e.
    /// capacity minus the bytes held by every other key.
    #[error("Quota exceeded writing '{key}': {requested} bytes requested, {available} available")]
    QuotaExceeded {
        /// Key being written.
        key: String,
        /// Size of the value.
        requested: u64,
        /// Bytes the key could hold.
        available: u64,
    },

    /// The substrate cannot be read or written at the moment.
    #[error("Substrate unavailable: {0}")]
    Unavailable(String),

    /// Stored bytes failed an integrity check.
    #[error("Stored value is corrupted: {0}")]
    Corrupted(String),
}

/// Storage trait for the backing key/value area.
///
/// # Contract
/// - `write` replaces the value atomically: after a failure or a crash the
///   key holds either the previous value or the new one, never a mix
/// - a failed `write` leaves usage unchanged
pub trait Substrate: Send + Sync + fmt::Debug {
    /// Reads the value under `key`.
    ///
    /// # Errors
    ///
    /// `Unavailable` or `Corrupted`.
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, SubstrateError>;

    /// Replaces the value under `key`.
    ///
    /// # Errors
    ///
    /// `QuotaExceeded` if the value does not fit, otherwise `Unavailable`.
    fn write(&self, key: &str, value: &[u8]) -> Result<(), SubstrateError>;

    /// Removes `key`. Returns true if it existed.
    ///
    /// # Errors
    ///
    /// `Unavailable` if the key could not be removed.
    fn remove(&self, key: &str) -> Result<bool, SubstrateError>;

    /// Bytes currently held across all keys.
    ///
    /// # Errors
    ///
    /// `Unavailable` if usage cannot be measured.
    fn used_bytes(&self) -> Result<u64, SubstrateError>;

    /// Total capacity in bytes, if bounded.
    fn capacity(&self) -> Option<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test: ensure the trait is object-safe
    fn _assert_substrate_object_safe(_: &dyn Substrate) {}

    #[test]
    fn test_substrate_error_display() {
        let err = SubstrateError::QuotaExceeded {
            key: "dossier.snapshot".to_string(),
            requested: 6,
            available: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("dossier.snapshot"));
        assert!(msg.contains("6 bytes"));

        let err = SubstrateError::Unavailable("read-only filesystem".to_string());
        assert!(err.to_string().contains("read-only filesystem"));
    }
}
