//! Length-prefixed frame codec
//!
//! Format: `[length: u32 BE][payload: bincode serialized record]`
//!
//! A frame may arrive across any number of socket reads; the reader keeps
//! going until the announced payload is complete.

use bincode::Options;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length header
pub const HEADER_LEN: usize = 4;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Frame too large: {0} bytes (limit {1})")]
    FrameTooLarge(usize, usize),

    #[error("Stream ended inside a frame")]
    UnexpectedEof,

    #[error("Invalid record: {0}")]
    Invalid(String),
}

/// Bincode settings for every payload: fixed-width integers, and a payload
/// must be exactly one record with nothing after it
fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// Decode a payload that must hold exactly one `T`
pub fn decode_exact<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T, CodecError> {
    Ok(wire_options().deserialize(payload)?)
}

/// Frame codec with a payload size limit
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Encode a record into a complete frame
    pub fn encode<T: Serialize>(&self, msg: &T) -> Result<Bytes, CodecError> {
        let payload = wire_options().serialize(msg)?;

        if payload.len() > self.max_payload {
            return Err(CodecError::FrameTooLarge(payload.len(), self.max_payload));
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Read one frame's payload into `buf`.
    ///
    /// Returns `Ok(Some(n))` with the payload in `buf[..n]`, or `Ok(None)` if
    /// the stream ended before a header was complete. Only the header and the
    /// announced payload are consumed from `reader`.
    pub async fn read_frame<R>(
        &self,
        reader: &mut R,
        buf: &mut [u8],
    ) -> Result<Option<usize>, CodecError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut header = [0u8; HEADER_LEN];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let length = u32::from_be_bytes(header) as usize;
        let limit = self.max_payload.min(buf.len());
        if length > limit {
            return Err(CodecError::FrameTooLarge(length, limit));
        }

        match reader.read_exact(&mut buf[..length]).await {
            Ok(_) => Ok(Some(length)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(CodecError::UnexpectedEof)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Encode `msg` and write it as one frame
    pub async fn write_frame<W, T>(&self, writer: &mut W, msg: &T) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin + ?Sized,
        T: Serialize,
    {
        let frame = self.encode(msg)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(crate::MAX_CREDENTIAL_FRAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::CredentialRecord;

    fn credential() -> CredentialRecord {
        CredentialRecord {
            id: "u1".to_string(),
            secret: "s1".to_string(),
        }
    }

    #[test]
    fn test_encode_prefixes_length() {
        let codec = FrameCodec::default();
        let frame = codec.encode(&credential()).unwrap();

        let length = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(length, frame.len() - HEADER_LEN);
    }

    #[test]
    fn test_decode_exact_rejects_trailing_bytes() {
        let mut payload = bincode::serialize(&credential()).unwrap();
        assert_eq!(decode_exact::<CredentialRecord>(&payload).unwrap(), credential());

        payload.extend_from_slice(b"GARBAGE");
        assert!(matches!(
            decode_exact::<CredentialRecord>(&payload),
            Err(CodecError::Serialization(_))
        ));
    }

    #[test]
    fn test_encode_rejects_oversize() {
        let codec = FrameCodec::new(8);
        let result = codec.encode(&credential());
        assert!(matches!(result, Err(CodecError::FrameTooLarge(_, 8))));
    }

    #[tokio::test]
    async fn test_read_frame_across_reads() {
        let codec = FrameCodec::default();
        let frame = codec.encode(&credential()).unwrap();
        let (mut client, mut server) = tokio::io::duplex(64);

        let writer = tokio::spawn(async move {
            // Dribble the frame out one byte at a time
            for byte in frame.iter() {
                client.write_all(&[*byte]).await.unwrap();
                tokio::task::yield_now().await;
            }
            client
        });

        let mut buf = vec![0u8; 256];
        let n = codec.read_frame(&mut server, &mut buf).await.unwrap().unwrap();
        let _client = writer.await.unwrap();

        let decoded: CredentialRecord = bincode::deserialize(&buf[..n]).unwrap();
        assert_eq!(decoded, credential());
    }

    #[tokio::test]
    async fn test_read_frame_leaves_trailing_bytes() {
        let codec = FrameCodec::default();
        let mut wire = codec.encode(&credential()).unwrap().to_vec();
        wire.extend_from_slice(b"hello");

        let mut reader = wire.as_slice();
        let mut buf = vec![0u8; 256];
        codec.read_frame(&mut reader, &mut buf).await.unwrap().unwrap();

        assert_eq!(reader, b"hello");
    }

    #[tokio::test]
    async fn test_read_frame_clean_eof() {
        let codec = FrameCodec::default();
        let mut reader: &[u8] = &[];
        let mut buf = vec![0u8; 16];
        assert!(codec.read_frame(&mut reader, &mut buf).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_frame_truncated_payload() {
        let codec = FrameCodec::default();
        let frame = codec.encode(&credential()).unwrap();
        let mut reader = &frame[..frame.len() - 1];
        let mut buf = vec![0u8; 256];

        let result = codec.read_frame(&mut reader, &mut buf).await;
        assert!(matches!(result, Err(CodecError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn test_read_frame_limited_by_buffer() {
        let codec = FrameCodec::new(1024);
        let mut wire = 100u32.to_be_bytes().to_vec();
        wire.extend_from_slice(&[0u8; 100]);
        let mut reader = wire.as_slice();
        let mut buf = vec![0u8; 64];

        let result = codec.read_frame(&mut reader, &mut buf).await;
        assert!(matches!(result, Err(CodecError::FrameTooLarge(100, 64))));
    }
}
