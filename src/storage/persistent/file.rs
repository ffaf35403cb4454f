//! Directory-backed substrate.
//!
//! Each key is one framed file, `<dir>/<key>.dsr`. Writes go to a uniquely
//! named temp file that is fsynced and then renamed over the target, so a
//! crash leaves either the old frame or the new one. Leftover temp files from
//! an interrupted write are removed on open.

use std::fs::{self, File};
use std::io::{BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::codec::{decode_frame, encode_frame, FRAME_OVERHEAD};
use super::file_lock::DirLock;
use crate::error::ValidationError;
use crate::storage::traits::{Substrate, SubstrateError};

const VALUE_EXTENSION: &str = "dsr";
const TEMP_MARKER: &str = ".dsr.tmp.";

/// Options for [`FileSubstrate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSubstrateConfig {
    /// Byte budget across all keys (payload bytes, not counting framing).
    pub capacity: Option<u64>,
    /// Whether to fsync the temp file and directory on every write.
    pub sync_on_write: bool,
}

impl Default for FileSubstrateConfig {
    fn default() -> Self {
        Self {
            capacity: None,
            sync_on_write: true,
        }
    }
}

impl FileSubstrateConfig {
    const MIN_CAPACITY: u64 = 1024;

    /// Checks the budget.
    ///
    /// # Errors
    ///
    /// `ValidationError::InvalidConfig` for a budget under 1 KiB.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if let Some(capacity) = self.capacity {
            if capacity < Self::MIN_CAPACITY {
                return Err(ValidationError::config(
                    "storage.capacity",
                    format!("must be at least {} bytes (got {capacity})", Self::MIN_CAPACITY),
                ));
            }
        }
        Ok(self)
    }
}

fn io_err(context: &str, err: &std::io::Error) -> SubstrateError {
    SubstrateError::Unavailable(format!("{context}: {err}"))
}

fn lock_err(context: &'static str) -> SubstrateError {
    SubstrateError::Unavailable(format!("poisoned lock: {context}"))
}

fn validate_key(key: &str) -> Result<(), SubstrateError> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(SubstrateError::Unavailable(format!("invalid storage key '{key}'")))
    }
}

/// Substrate storing one framed file per key in a locked directory.
#[derive(Debug)]
pub struct FileSubstrate {
    dir: PathBuf,
    config: FileSubstrateConfig,
    _lock: DirLock,
    write_guard: Mutex<()>,
}

impl FileSubstrate {
    /// Opens (creating if needed) the directory at `dir`.
    ///
    /// # Errors
    /// - the directory cannot be created
    /// - another handle holds the directory lock
    pub fn open(dir: impl AsRef<Path>, config: FileSubstrateConfig) -> Result<Self, SubstrateError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| io_err("create storage dir", &e))?;
        let lock = DirLock::acquire(&dir).map_err(|e| io_err("lock storage dir", &e))?;

        let substrate = Self {
            dir,
            config,
            _lock: lock,
            write_guard: Mutex::new(()),
        };
        substrate.remove_stale_temps()?;
        Ok(substrate)
    }

    /// Directory this substrate owns.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn value_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{VALUE_EXTENSION}"))
    }

    fn remove_stale_temps(&self) -> Result<(), SubstrateError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| io_err("scan storage dir", &e))?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().contains(TEMP_MARKER) {
                tracing::warn!(path = %entry.path().display(), "removing temp file from interrupted write");
                if let Err(e) = fs::remove_file(entry.path()) {
                    tracing::warn!(path = %entry.path().display(), error = %e, "failed to remove temp file");
                }
            }
        }
        Ok(())
    }

    /// Payload bytes per stored key.
    fn usage(&self) -> Result<Vec<(String, u64)>, SubstrateError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| io_err("scan storage dir", &e))?;
        let mut usage = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != VALUE_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };
            let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
            usage.push((stem, len.saturating_sub(FRAME_OVERHEAD)));
        }
        Ok(usage)
    }

    fn write_atomic(&self, path: &Path, framed: &[u8]) -> std::io::Result<()> {
        let temp_path = path.with_extension(format!("{VALUE_EXTENSION}.tmp.{}", Uuid::new_v4()));
        let result = self.write_and_rename(&temp_path, path, framed);
        if result.is_err() {
            let _ = fs::remove_file(&temp_path);
        }
        result
    }

    fn write_and_rename(&self, temp_path: &Path, path: &Path, framed: &[u8]) -> std::io::Result<()> {
        let mut file = File::create(temp_path)?;
        file.write_all(framed)?;
        if self.config.sync_on_write {
            file.sync_all()?;
        }
        drop(file);
        fs::rename(temp_path, path)?;
        if self.config.sync_on_write {
            sync_dir(&self.dir);
        }
        Ok(())
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

impl Substrate for FileSubstrate {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, SubstrateError> {
        validate_key(key)?;
        let file = match File::open(self.value_path(key)) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err("open value", &e)),
        };
        match decode_frame(&mut BufReader::new(file)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if matches!(e.kind(), ErrorKind::InvalidData | ErrorKind::UnexpectedEof) => {
                Err(SubstrateError::Corrupted(format!("{key}: {e}")))
            }
            Err(e) => Err(io_err("read value", &e)),
        }
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<(), SubstrateError> {
        validate_key(key)?;
        let _guard = self.write_guard.lock().map_err(|_| lock_err("file.write"))?;

        if let Some(capacity) = self.config.capacity {
            let others: u64 = self
                .usage()?
                .into_iter()
                .filter(|(k, _)| k != key)
                .map(|(_, len)| len)
                .sum();
            let requested = value.len() as u64;
            if others.saturating_add(requested) > capacity {
                return Err(SubstrateError::QuotaExceeded {
                    key: key.to_string(),
                    requested,
                    available: capacity.saturating_sub(others),
                });
            }
        }

        let framed = encode_frame(value).map_err(|e| io_err("encode value", &e))?;
        self.write_atomic(&self.value_path(key), &framed)
            .map_err(|e| io_err("write value", &e))
    }

    fn remove(&self, key: &str) -> Result<bool, SubstrateError> {
        validate_key(key)?;
        let _guard = self.write_guard.lock().map_err(|_| lock_err("file.remove"))?;
        match fs::remove_file(self.value_path(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err("remove value", &e)),
        }
    }

    fn used_bytes(&self) -> Result<u64, SubstrateError> {
        Ok(self.usage()?.into_iter().map(|(_, len)| len).sum())
    }

    fn capacity(&self) -> Option<u64> {
        self.config.capacity
    }
}
