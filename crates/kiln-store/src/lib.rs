//! On-disk content-addressed store for compilation artifacts.
//!
//! Entries live under `<cache_root>/objects/<2-hex>/<30-hex>`, named by their
//! fingerprint. Capacity is bounded: inserts go through a reservation that
//! evicts least-recently-used entries until the new artifact fits. The store
//! directory is owned by exactly one process, enforced with an advisory file
//! lock taken at startup.

pub mod error;
pub mod index;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use index::EvictionIndex;
pub use store::{ArtifactStore, ReadHandle, Reservation};
