//! # Dossier - session record store with quota-aware persistence
//!
//! Dossier keeps per-entity records (scalar fields, layout settings and a
//! bounded list of images) for a single editing session and persists them to a
//! capacity-limited storage area without ever blocking the user.
//!
//! ## Core Concepts
//!
//! - **RecordStore**: the authoritative in-memory map of entity records
//! - **PersistenceGateway**: sole writer of the stored document; evicts once on quota
//! - **EvictionPolicy**: one deterministic pass that shrinks a document to a budget
//! - **WriteScheduler**: debounce, retry with backoff, manual-recovery slot
//! - **BatchCoordinator**: all-or-nothing mutations across many entities
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use dossier::{EntityId, InMemorySubstrate, Session};
//!
//! let substrate = Arc::new(InMemorySubstrate::with_capacity(5 * 1024 * 1024));
//! let mut session = Session::builder().substrate(substrate).open()?;
//!
//! let id = EntityId::new("S-014")?;
//! session.upsert(&id, |record| {
//!     record.set_field("name", "Ada");
//! });
//! session.append_image(&id, png_bytes, "portrait.png")?;
//!
//! // Call from the host's event loop; saves happen once the debounce elapses.
//! session.tick()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod error;
pub mod record;
pub mod snapshot;
pub mod time;
pub mod value;

// Store and persistence
pub mod eviction;
pub mod gateway;
pub mod storage;
pub mod store;

// Scheduling and sessions
pub mod batch;
pub mod config;
pub mod scheduler;
pub mod session;

// Re-export primary types at crate root for convenience
pub use batch::{BatchCoordinator, CommitListener, TransactionResult};
pub use config::DossierConfig;
pub use error::{DossierError, DossierResult, PersistError, StoreError, ValidationError};
pub use eviction::{EvictionConfig, EvictionPolicy, EvictionReport};
pub use gateway::{GatewayConfig, PersistenceGateway, SaveOutcome};
pub use record::{EntityId, ImageAdjustment, ImageAsset, LayoutMode, LayoutSettings, Record};
pub use scheduler::{
    InlineExecutor, SaveExecutor, SaveStatus, SchedulerConfig, SchedulerState, SchedulerStats,
    ThreadedExecutor, WriteScheduler,
};
pub use session::{Session, SessionBuilder};
pub use snapshot::{DeletedImage, Snapshot};
pub use storage::{InMemorySubstrate, Substrate, SubstrateError};
pub use store::{RecordStore, StoreConfig};
pub use time::{Clock, ManualClock, SystemClock};
pub use value::FieldValue;
