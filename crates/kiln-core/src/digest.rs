//! 128-bit compilation digests.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A 128-bit digest identifying one compilation, computed with XXH3-128.
///
/// Two compile jobs with the same `Digest` are assumed to produce identical
/// artifacts. The digest covers the preprocessed source, the cacheable flag
/// subset, and the compiler identity; it never covers output paths.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest([u8; 16]);

/// Number of characters in the lowercase-hex rendering of a [`Digest`].
pub const DIGEST_HEX_LEN: usize = 32;

impl Digest {
    /// Computes a digest from a byte slice in one shot.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(xxhash_rust::xxh3::xxh3_128(data).to_le_bytes())
    }

    /// Wraps a raw 128-bit value produced by a streaming hasher.
    pub fn from_raw(raw: u128) -> Self {
        Self(raw.to_le_bytes())
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// First two hex characters. The artifact store shards entries into
    /// `objects/<prefix>/` directories keyed by this value.
    pub fn shard_prefix(&self) -> String {
        format!("{:02x}", self.0[0])
    }

    /// Hex rendering of everything after the shard prefix.
    pub fn shard_rest(&self) -> String {
        let mut s = String::with_capacity(DIGEST_HEX_LEN - 2);
        for byte in &self.0[1..] {
            s.push_str(&format!("{byte:02x}"));
        }
        s
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

/// Error produced when parsing a digest from its hex rendering.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DigestParseError {
    /// The input was not exactly [`DIGEST_HEX_LEN`] characters.
    #[error("digest hex must be {DIGEST_HEX_LEN} characters, got {0}")]
    BadLength(usize),

    /// The input contained a non-hex character.
    #[error("digest hex contains a non-hex character")]
    BadCharacter,
}

impl FromStr for Digest {
    type Err = DigestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != DIGEST_HEX_LEN {
            return Err(DigestParseError::BadLength(s.len()));
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
            let hi = hex_val(chunk[0]).ok_or(DigestParseError::BadCharacter)?;
            let lo = hex_val(chunk[1]).ok_or(DigestParseError::BadCharacter)?;
            bytes[i] = (hi << 4) | lo;
        }
        Ok(Self(bytes))
    }
}

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}
