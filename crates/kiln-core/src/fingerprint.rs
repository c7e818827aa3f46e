//! Fingerprinting: mapping a compile job onto a [`Digest`].
//!
//! The fingerprint covers the preprocessed source bytes, the lexically
//! sorted cacheable flag subset, the source language, and the compiler
//! identity. Output paths and `non_cached` flags never reach the hasher, so
//! two jobs that differ only in those produce the same digest.

use xxhash_rust::xxh3::Xxh3;

use crate::digest::Digest;
use crate::flags::Invocation;

/// Streaming fingerprint hasher.
///
/// Accepts the preprocessed source as a chunked sequence, then folds in the
/// flag set and compiler identity on [`finish`](Self::finish). Every field is
/// written with a length prefix so that adjacent fields cannot alias.
pub struct FingerprintBuilder {
    hasher: Xxh3,
    source_len: u64,
}

impl FingerprintBuilder {
    pub fn new() -> Self {
        Self {
            hasher: Xxh3::new(),
            source_len: 0,
        }
    }

    /// Feeds one chunk of preprocessed source bytes.
    pub fn source_chunk(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.source_len += chunk.len() as u64;
    }

    /// Folds in the cacheable parts of the flag set and produces the digest.
    pub fn finish(mut self, invocation: &Invocation) -> Digest {
        // Close off the variable-length source stream before any flag bytes.
        let source_len = self.source_len;
        self.hasher.update(&source_len.to_le_bytes());

        for flag in invocation.cacheable_flags_sorted() {
            self.field(flag.as_bytes());
        }
        self.field(
            invocation
                .language
                .as_deref()
                .unwrap_or_default()
                .as_bytes(),
        );
        self.field(invocation.compiler.path.as_bytes());
        self.field(invocation.compiler.version.as_bytes());

        Digest::from_raw(self.hasher.digest128())
    }

    fn field(&mut self, bytes: &[u8]) {
        self.hasher.update(&(bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
    }
}

impl Default for FingerprintBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot fingerprint of a complete preprocessed source buffer.
pub fn fingerprint(source: &[u8], invocation: &Invocation) -> Digest {
    let mut builder = FingerprintBuilder::new();
    builder.source_chunk(source);
    builder.finish(invocation)
}
