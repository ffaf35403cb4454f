//! Session configuration.
//!
//! [`DossierConfig`] groups the per-component settings. Every field has a
//! default, so a host can deserialize a partial JSON object and get the rest
//! filled in.
//!
//! ```
//! use dossier::DossierConfig;
//!
//! let config = DossierConfig::from_json_str(r#"{ "scheduler": { "debounce_ms": 250 } }"#).unwrap();
//! assert_eq!(config.scheduler.debounce_ms, 250);
//! assert_eq!(config.store.max_images_per_entity, 10);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{DossierError, ValidationError};
use crate::eviction::EvictionConfig;
use crate::gateway::GatewayConfig;
use crate::scheduler::SchedulerConfig;
use crate::store::StoreConfig;

/// Settings for every component of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DossierConfig {
    /// Record store caps.
    pub store: StoreConfig,
    /// Eviction thresholds.
    pub eviction: EvictionConfig,
    /// Debounce and retry timing.
    pub scheduler: SchedulerConfig,
    /// Storage keys and quota handling.
    pub gateway: GatewayConfig,
}

impl DossierConfig {
    /// Validates every section.
    ///
    /// # Errors
    /// `ValidationError::InvalidConfig` naming the first offending field.
    pub fn validate(self) -> Result<Self, ValidationError> {
        let Self {
            store,
            eviction,
            scheduler,
            gateway,
        } = self;
        Ok(Self {
            store: store.validate()?,
            eviction: eviction.validate()?,
            scheduler: scheduler.validate()?,
            gateway: gateway.validate()?,
        })
    }

    /// Parses and validates a JSON configuration.
    ///
    /// # Errors
    ///
    /// `DossierError::Validation` for malformed JSON or invalid settings.
    pub fn from_json_str(json: &str) -> Result<Self, DossierError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ValidationError::config("config", e.to_string()))?;
        Ok(config.validate()?)
    }
}
