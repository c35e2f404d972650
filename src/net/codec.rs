//! Length-prefixed envelope framing: `[u32 big-endian length][postcard bytes]`
//!
//! The reader rejects oversized frames before allocating, and enforces the
//! per-command size caps after decoding. Reader and writer operate on boxed
//! halves so plain TCP and TLS streams are interchangeable.

use super::envelope::Envelope;
use super::serde_safe::{from_bytes, to_bytes};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("{command} envelope of {len} bytes exceeds its {max} byte cap")]
    CommandTooLarge {
        command: &'static str,
        len: usize,
        max: usize,
    },

    #[error("encode error: {0}")]
    Encode(postcard::Error),

    #[error("decode error: {0}")]
    Decode(postcard::Error),
}

impl CodecError {
    /// Peer closed the connection cleanly between frames.
    pub fn is_eof(&self) -> bool {
        matches!(self, CodecError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// Serialize an envelope into a complete frame (length prefix included).
pub fn encode(env: &Envelope, max_frame: usize) -> Result<Vec<u8>, CodecError> {
    let payload = to_bytes(env).map_err(CodecError::Encode)?;
    if payload.len() > max_frame {
        return Err(CodecError::FrameTooLarge {
            len: payload.len(),
            max: max_frame,
        });
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode a frame payload (length prefix already stripped).
pub fn decode(payload: &[u8]) -> Result<Envelope, CodecError> {
    let env: Envelope = from_bytes(payload).map_err(CodecError::Decode)?;
    let max = env.command.max_size();
    if payload.len() > max {
        return Err(CodecError::CommandTooLarge {
            command: env.command.name(),
            len: payload.len(),
            max,
        });
    }
    Ok(env)
}

pub struct FrameReader {
    inner: BoxedReader,
    max_frame: usize,
}

impl FrameReader {
    pub fn new(inner: BoxedReader, max_frame: usize) -> Self {
        Self { inner, max_frame }
    }

    pub async fn read_envelope(&mut self) -> Result<Envelope, CodecError> {
        let mut len_bytes = [0u8; 4];
        self.inner.read_exact(&mut len_bytes).await?;
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len > self.max_frame {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_frame,
            });
        }

        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload).await?;
        decode(&payload)
    }
}

pub struct FrameWriter {
    inner: BoxedWriter,
    max_frame: usize,
}

impl FrameWriter {
    pub fn new(inner: BoxedWriter, max_frame: usize) -> Self {
        Self { inner, max_frame }
    }

    pub async fn write_envelope(&mut self, env: &Envelope) -> Result<(), CodecError> {
        let frame = encode(env, self.max_frame)?;
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::envelope::{Command, Payload};
    use crate::types::{Address, NodeClass};

    fn sample() -> Envelope {
        Envelope::new(
            Address::new(NodeClass::Streamer, "127.0.0.1", 65432),
            Command::TopicMessage(Payload::new(vec![7u8; 128]).unwrap()),
        )
        .with_topic("topic1")
    }

    #[test]
    fn frame_round_trip() {
        let env = sample();
        let frame = encode(&env, 64 * 1024 * 1024).unwrap();
        let len = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - 4);
        let back = decode(&frame[4..]).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn encode_rejects_oversized_frame() {
        let env = sample();
        let err = encode(&env, 16).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { .. }));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode(&[0xff, 0xee, 0xdd]).is_err());
    }

    #[tokio::test]
    async fn reader_rejects_oversized_length_prefix() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&u32::MAX.to_be_bytes());
        frame.extend_from_slice(&[0u8; 8]);

        let mut reader = FrameReader::new(Box::new(std::io::Cursor::new(frame)), 1024);
        let err = reader.read_envelope().await.unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn reader_round_trip_over_duplex() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (read_half, _w) = tokio::io::split(server);
        let (_r, write_half) = tokio::io::split(client);

        let env = sample();
        let mut writer = FrameWriter::new(Box::new(write_half), 1024 * 1024);
        writer.write_envelope(&env).await.unwrap();

        let mut reader = FrameReader::new(Box::new(read_half), 1024 * 1024);
        let back = reader.read_envelope().await.unwrap();
        assert_eq!(env, back);
    }
}
