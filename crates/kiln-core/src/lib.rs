//! Core types for the kiln compile cache.
//!
//! This crate holds everything the other kiln crates agree on: the 128-bit
//! compilation digest, the structured compiler flag set, the fingerprint
//! function that maps a compile job onto a digest, the daemon configuration,
//! and the monotonic clock abstraction.

pub mod clock;
pub mod config;
pub mod digest;
pub mod fingerprint;
pub mod flags;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, DaemonConfig};
pub use digest::{Digest, DigestParseError};
pub use fingerprint::{fingerprint, FingerprintBuilder};
pub use flags::{Action, CompilerId, Invocation};
