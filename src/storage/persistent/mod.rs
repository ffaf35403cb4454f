//! File-backed substrate.
//!
//! Provides durable storage for the persistence gateway with:
//! - one CRC32-checked frame per key
//! - temp-file, fsync, rename writes so a crash never leaves a torn value
//! - an exclusive directory lock so one process owns the keys
//!
//! ```text
//! <dir>/
//!   dossier.lock            pid of the owning process (flock / LockFileEx)
//!   dossier.snapshot.dsr    framed document
//!   dossier.recovery.dsr    framed manual-recovery copy, when present
//! ```

mod codec;
mod file;
mod file_lock;

pub use file::{FileSubstrate, FileSubstrateConfig};
pub use file_lock::{DirLock, LOCK_FILE_NAME};

use std::path::Path;

use crate::error::DossierError;

/// Opens a file substrate at `path`, validating `config` first.
///
/// # Errors
/// - the configuration is invalid
/// - the directory cannot be created or is locked by another process
///
/// # Example
/// ```rust,ignore
/// use std::sync::Arc;
/// use dossier::storage::persistent::open_directory;
/// use dossier::Session;
///
/// let substrate = open_directory("./sessions/alpha", None)?;
/// let session = Session::builder().substrate(Arc::new(substrate)).open()?;
/// ```
pub fn open_directory(
    path: impl AsRef<Path>,
    config: Option<FileSubstrateConfig>,
) -> Result<FileSubstrate, DossierError> {
    let config = config.unwrap_or_default().validate()?;
    FileSubstrate::open(path, config).map_err(|e| DossierError::Persist(e.into()))
}
