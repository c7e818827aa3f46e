//! Binary container for cached compilation artifacts.
//!
//! The store holds opaque payloads; this module defines their shape: a small
//! validated header followed by the captured stderr and the object bytes.
//! The header carries a checksum of the payload so that a just-written entry
//! can be verified on read-back and a corrupted one detected on a hit.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use kiln_core::Digest;

/// Magic bytes identifying a kiln artifact container.
const ARTIFACT_MAGIC: [u8; 4] = *b"KOBJ";

/// Current container format version. Increment on breaking layout changes.
const ARTIFACT_FORMAT_VERSION: u32 = 1;

/// Header prepended to every stored artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArtifactHeader {
    magic: [u8; 4],
    format_version: u32,
    stderr_len: u64,
    object_len: u64,
    /// Checksum over stderr followed by object bytes.
    checksum: Digest,
}

/// Errors produced while decoding an artifact container.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact container truncated")]
    Truncated,

    #[error("bad artifact magic")]
    BadMagic,

    #[error("unsupported artifact format version {actual}, expected {expected}")]
    Version { expected: u32, actual: u32 },

    #[error("artifact checksum mismatch")]
    ChecksumMismatch,

    #[error("artifact header malformed: {reason}")]
    Header { reason: String },
}

/// Decoded artifact: the object file and the compiler's stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub object: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl Artifact {
    pub fn new(object: Vec<u8>, stderr: Vec<u8>) -> Self {
        Self { object, stderr }
    }

    /// Serializes the container: `u32` header length, bincode header,
    /// stderr, object.
    pub fn encode(&self) -> Result<Vec<u8>, ArtifactError> {
        encode_parts(&self.object, &self.stderr)
    }

    /// Parses and validates a container, verifying the payload checksum.
    pub fn decode(bytes: &[u8]) -> Result<Self, ArtifactError> {
        if bytes.len() < 4 {
            return Err(ArtifactError::Truncated);
        }
        let header_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let rest = &bytes[4..];
        if rest.len() < header_len {
            return Err(ArtifactError::Truncated);
        }

        let (header, consumed): (ArtifactHeader, usize) =
            bincode::serde::decode_from_slice(&rest[..header_len], bincode::config::standard())
                .map_err(|e| ArtifactError::Header {
                    reason: e.to_string(),
                })?;
        if consumed != header_len {
            return Err(ArtifactError::Header {
                reason: "trailing bytes in header".into(),
            });
        }
        if header.magic != ARTIFACT_MAGIC {
            return Err(ArtifactError::BadMagic);
        }
        if header.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(ArtifactError::Version {
                expected: ARTIFACT_FORMAT_VERSION,
                actual: header.format_version,
            });
        }

        let payload = &rest[header_len..];
        let stderr_len = header.stderr_len as usize;
        let object_len = header.object_len as usize;
        if payload.len() != stderr_len + object_len {
            return Err(ArtifactError::Truncated);
        }
        let stderr = payload[..stderr_len].to_vec();
        let object = payload[stderr_len..].to_vec();

        if payload_checksum(&stderr, &object) != header.checksum {
            return Err(ArtifactError::ChecksumMismatch);
        }

        Ok(Self { object, stderr })
    }
}

/// Serializes a container without requiring owned buffers.
pub fn encode_parts(object: &[u8], stderr: &[u8]) -> Result<Vec<u8>, ArtifactError> {
    let header = ArtifactHeader {
        magic: ARTIFACT_MAGIC,
        format_version: ARTIFACT_FORMAT_VERSION,
        stderr_len: stderr.len() as u64,
        object_len: object.len() as u64,
        checksum: payload_checksum(stderr, object),
    };
    let header_bytes = bincode::serde::encode_to_vec(&header, bincode::config::standard())
        .map_err(|e| ArtifactError::Header {
            reason: e.to_string(),
        })?;

    let mut out = Vec::with_capacity(4 + header_bytes.len() + stderr.len() + object.len());
    out.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(stderr);
    out.extend_from_slice(object);
    Ok(out)
}

fn payload_checksum(stderr: &[u8], object: &[u8]) -> Digest {
    let mut buf = Vec::with_capacity(stderr.len() + object.len());
    buf.extend_from_slice(stderr);
    buf.extend_from_slice(object);
    Digest::from_bytes(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let artifact = Artifact::new(b"object bytes".to_vec(), b"warning: x\n".to_vec());
        let encoded = artifact.encode().unwrap();
        assert_eq!(Artifact::decode(&encoded).unwrap(), artifact);
    }

    #[test]
    fn empty_stderr_roundtrip() {
        let artifact = Artifact::new(b"obj".to_vec(), Vec::new());
        let encoded = artifact.encode().unwrap();
        let decoded = Artifact::decode(&encoded).unwrap();
        assert_eq!(decoded.object, b"obj");
        assert!(decoded.stderr.is_empty());
    }

    #[test]
    fn truncated_rejected() {
        let encoded = Artifact::new(b"obj".to_vec(), b"err".to_vec()).encode().unwrap();
        let err = Artifact::decode(&encoded[..encoded.len() - 1]).unwrap_err();
        assert!(matches!(err, ArtifactError::Truncated));
        assert!(matches!(Artifact::decode(&[]).unwrap_err(), ArtifactError::Truncated));
    }

    #[test]
    fn flipped_payload_byte_fails_checksum() {
        let mut encoded = Artifact::new(vec![1, 2, 3, 4], Vec::new()).encode().unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        let err = Artifact::decode(&encoded).unwrap_err();
        assert!(matches!(err, ArtifactError::ChecksumMismatch));
    }

    #[test]
    fn bad_magic_rejected() {
        let good = Artifact::new(b"obj".to_vec(), Vec::new()).encode().unwrap();
        // Corrupt the magic inside the bincode header region.
        let mut bad = good.clone();
        bad[4] ^= 0xff;
        let err = Artifact::decode(&bad).unwrap_err();
        assert!(matches!(
            err,
            ArtifactError::BadMagic | ArtifactError::Header { .. }
        ));
    }
}
