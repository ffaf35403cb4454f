//! Backing substrates for the persistence gateway.
//!
//! [`Substrate`] is the abstract capacity-bounded key/value area. The
//! in-memory implementation is always available; the file-backed one lives in
//! [`persistent`] behind the `persistent` feature.

mod memory;
mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::InMemorySubstrate;
pub use traits::{Substrate, SubstrateError};
