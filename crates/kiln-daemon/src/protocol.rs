//! Wire protocol: framed build requests and responses.
//!
//! Messages are JSON payloads behind a `u32` little-endian length prefix.
//! Binary fields (preprocessed source, artifact bytes) travel base64-encoded.
//! The dispatcher itself consumes the deserialized structs; this module is
//! the only place that touches raw frames.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use kiln_core::Invocation;

/// Upper bound on a single frame. Large enough for any object file this
/// system is expected to move, small enough to bound a hostile peer.
pub const MAX_FRAME_BYTES: u32 = 256 * 1024 * 1024;

/// Errors produced by the frame codec.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {got} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { got: u32, limit: u32 },

    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Outcome status carried on a [`RemoteResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Ok,
    BuildFailed,
    Internal,
}

/// A build request as it crosses the wire to a remote builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRequest {
    /// Shared secret; checked for equality by the serving daemon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    /// The parsed flag set.
    pub flags: Invocation,

    /// Preprocessed translation unit.
    #[serde(with = "base64_bytes")]
    pub source: Vec<u8>,
}

/// A build response as it crosses the wire back to the requesting daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteResponse {
    pub status: BuildStatus,

    /// Compiler exit status; meaningful when `status` is `BuildFailed`.
    #[serde(default)]
    pub exit_status: i32,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_base64_bytes"
    )]
    pub artifact: Option<Vec<u8>>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_base64_bytes"
    )]
    pub stderr: Option<Vec<u8>>,
}

impl RemoteResponse {
    pub fn ok(artifact: Vec<u8>, stderr: Vec<u8>) -> Self {
        Self {
            status: BuildStatus::Ok,
            exit_status: 0,
            artifact: Some(artifact),
            stderr: Some(stderr),
        }
    }

    pub fn build_failed(exit_status: i32, stderr: Vec<u8>) -> Self {
        Self {
            status: BuildStatus::BuildFailed,
            exit_status,
            artifact: None,
            stderr: Some(stderr),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: BuildStatus::Internal,
            exit_status: 0,
            artifact: None,
            stderr: Some(message.into().into_bytes()),
        }
    }
}

/// Writes one length-prefixed JSON frame.
pub async fn write_frame<W, T>(io: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge {
            got: len,
            limit: MAX_FRAME_BYTES,
        });
    }
    io.write_all(&len.to_le_bytes()).await?;
    io.write_all(&payload).await?;
    io.flush().await?;
    Ok(())
}

/// Reads one length-prefixed JSON frame.
pub async fn read_frame<R, T>(io: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    io.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge {
            got: len,
            limit: MAX_FRAME_BYTES,
        });
    }
    let mut payload = vec![0u8; len as usize];
    io.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}

mod base64_bytes {
    use base64::prelude::{Engine as _, BASE64_STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        BASE64_STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

mod opt_base64_bytes {
    use base64::prelude::{Engine as _, BASE64_STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, ser: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => ser.serialize_some(&BASE64_STANDARD.encode(b)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Vec<u8>>, D::Error> {
        let s: Option<String> = Option::deserialize(de)?;
        s.map(|s| BASE64_STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::CompilerId;

    fn request() -> RemoteRequest {
        RemoteRequest {
            secret: Some("s3cret".into()),
            flags: Invocation::from_args(
                CompilerId::new("/usr/bin/clang", "3.4"),
                ["-cc1", "-emit-obj", "-o", "a.o", "a.cc"],
            ),
            source: b"int main(){return 0;}\n".to_vec(),
        }
    }

    #[tokio::test]
    async fn request_frame_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &request()).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let back: RemoteRequest = read_frame(&mut cursor).await.unwrap();
        assert_eq!(back.source, request().source);
        assert_eq!(back.secret.as_deref(), Some("s3cret"));
        assert_eq!(back.flags.output.as_deref(), Some("a.o"));
    }

    #[tokio::test]
    async fn response_frame_roundtrip() {
        let mut buf = Vec::new();
        let resp = RemoteResponse::ok(vec![0x7f, b'E', b'L', b'F'], b"warn\n".to_vec());
        write_frame(&mut buf, &resp).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let back: RemoteResponse = read_frame(&mut cursor).await.unwrap();
        assert_eq!(back.status, BuildStatus::Ok);
        assert_eq!(back.artifact.unwrap(), vec![0x7f, b'E', b'L', b'F']);
    }

    #[tokio::test]
    async fn oversized_frame_rejected_on_read() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_BYTES + 1).to_le_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame::<_, RemoteResponse>(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn truncated_frame_is_io_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &RemoteResponse::internal("x")).await.unwrap();
        buf.truncate(buf.len() - 2);
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame::<_, RemoteResponse>(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Io(_)));
    }

    #[test]
    fn build_failed_constructor_keeps_status() {
        let resp = RemoteResponse::build_failed(1, b"a.cc:1: error\n".to_vec());
        assert_eq!(resp.status, BuildStatus::BuildFailed);
        assert_eq!(resp.exit_status, 1);
        assert!(resp.artifact.is_none());
    }
}
