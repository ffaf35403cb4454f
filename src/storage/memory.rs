//! In-memory substrate.
//!
//! Behaves like a browser storage area: one shared byte budget across all
//! keys, whole-value replacement on write. Failures can be injected so the
//! gateway and scheduler can be exercised against quota and outage paths.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::storage::traits::{Substrate, SubstrateError};

fn lock_err(context: &'static str) -> SubstrateError {
    SubstrateError::Unavailable(format!("poisoned lock: {context}"))
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<String, Vec<u8>>,
    failing_writes: u32,
    offline: bool,
    writes: u64,
}

impl MemoryState {
    fn used_total(&self) -> u64 {
        self.entries.values().map(|v| v.len() as u64).sum()
    }

    fn used_except(&self, key: &str) -> u64 {
        self.entries
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(_, v)| v.len() as u64)
            .sum()
    }
}

/// Thread-safe in-memory substrate with an optional byte budget.
#[derive(Debug, Default)]
pub struct InMemorySubstrate {
    capacity: Option<u64>,
    state: RwLock<MemoryState>,
}

impl InMemorySubstrate {
    /// Creates an unbounded substrate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a substrate that holds at most `bytes` across all keys.
    #[must_use]
    pub fn with_capacity(bytes: u64) -> Self {
        Self {
            capacity: Some(bytes),
            state: RwLock::new(MemoryState::default()),
        }
    }

    /// Makes the next `count` writes fail with `Unavailable`.
    pub fn fail_next_writes(&self, count: u32) {
        if let Ok(mut state) = self.state.write() {
            state.failing_writes = count;
        }
    }

    /// Takes the substrate offline (every read and write fails) or back online.
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut state) = self.state.write() {
            state.offline = offline;
        }
    }

    /// Number of successful writes so far.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.state.read().map(|s| s.writes).unwrap_or(0)
    }

    /// Raw bytes under `key`, bypassing the offline switch.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<Vec<u8>> {
        self.state.read().ok()?.entries.get(key).cloned()
    }
}

impl Substrate for InMemorySubstrate {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, SubstrateError> {
        let state = self.state.read().map_err(|_| lock_err("memory.read"))?;
        if state.offline {
            return Err(SubstrateError::Unavailable("substrate offline".to_string()));
        }
        Ok(state.entries.get(key).cloned())
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<(), SubstrateError> {
        let mut state = self.state.write().map_err(|_| lock_err("memory.write"))?;
        if state.offline {
            return Err(SubstrateError::Unavailable("substrate offline".to_string()));
        }
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(SubstrateError::Unavailable("injected write failure".to_string()));
        }

        if let Some(capacity) = self.capacity {
            let others = state.used_except(key);
            let requested = value.len() as u64;
            if others.saturating_add(requested) > capacity {
                return Err(SubstrateError::QuotaExceeded {
                    key: key.to_string(),
                    requested,
                    available: capacity.saturating_sub(others),
                });
            }
        }

        state.entries.insert(key.to_string(), value.to_vec());
        state.writes += 1;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, SubstrateError> {
        let mut state = self.state.write().map_err(|_| lock_err("memory.remove"))?;
        if state.offline {
            return Err(SubstrateError::Unavailable("substrate offline".to_string()));
        }
        Ok(state.entries.remove(key).is_some())
    }

    fn used_bytes(&self) -> Result<u64, SubstrateError> {
        let state = self.state.read().map_err(|_| lock_err("memory.used_bytes"))?;
        Ok(state.used_total())
    }

    fn capacity(&self) -> Option<u64> {
        self.capacity
    }
}
