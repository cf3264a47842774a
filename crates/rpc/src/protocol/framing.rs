//! Length-prefixed framing for the byte stream.
//!
//! A frame is a little-endian `u32` length followed by that many bytes of
//! envelope.

use crate::config::MAX_FRAME_SIZE;
use crate::error::TransportError;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, timeout_at};
use tokio_util::codec::{Decoder, Encoder};

/// Frame header size (4 bytes length).
pub const FRAME_HEADER_SIZE: usize = 4;

/// Codec for encoding/decoding frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a new frame codec.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with custom max frame size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Total frame length announced by a (possibly partial) buffer.
    fn announced_len(buf: &[u8]) -> usize {
        if buf.len() < FRAME_HEADER_SIZE {
            return FRAME_HEADER_SIZE;
        }
        let mut header = &buf[..FRAME_HEADER_SIZE];
        FRAME_HEADER_SIZE + header.get_u32_le() as usize
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = TransportError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &buf[..FRAME_HEADER_SIZE];
        let payload_len = header.get_u32_le() as usize;

        if payload_len > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                size: payload_len,
                max: self.max_frame_size,
            });
        }

        let frame_len = FRAME_HEADER_SIZE + payload_len;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        Ok(Some(buf.split_to(payload_len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, payload: Bytes, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len = payload.len();
        if payload_len > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                size: payload_len,
                max: self.max_frame_size,
            });
        }

        buf.reserve(FRAME_HEADER_SIZE + payload_len);
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32_le(payload_len as u32);
        buf.put(payload);

        Ok(())
    }
}

/// Reads whole frames from a byte stream.
///
/// Waiting for the first byte of a frame is unbounded. Once a frame has
/// started, the rest of it must arrive within `body_timeout`.
#[derive(Debug)]
pub struct FrameReader<R> {
    reader: R,
    codec: FrameCodec,
    buffer: BytesMut,
    body_timeout: Duration,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a reader.
    pub fn new(reader: R, codec: FrameCodec, body_timeout: Duration) -> Self {
        Self {
            reader,
            codec,
            buffer: BytesMut::with_capacity(8 * 1024),
            body_timeout,
        }
    }

    /// Read the next frame payload.
    ///
    /// # Errors
    ///
    /// Every error is fatal to the stream: the peer closed it, closed it in
    /// the middle of a frame, stalled, or announced an oversized frame.
    pub async fn read_frame(&mut self) -> Result<Bytes, TransportError> {
        let mut deadline: Option<Instant> = None;

        loop {
            if let Some(frame) = self.codec.decode(&mut self.buffer)? {
                return Ok(frame);
            }

            let read = if self.buffer.is_empty() {
                self.reader.read_buf(&mut self.buffer).await?
            } else {
                let until =
                    *deadline.get_or_insert_with(|| Instant::now() + self.body_timeout);
                match timeout_at(until, self.reader.read_buf(&mut self.buffer)).await {
                    Ok(read) => read?,
                    Err(_) => return Err(TransportError::Stalled(self.body_timeout)),
                }
            };

            if read == 0 {
                if self.buffer.is_empty() {
                    return Err(TransportError::PeerClosed);
                }
                return Err(TransportError::Truncated {
                    expected: FrameCodec::announced_len(&self.buffer),
                    received: self.buffer.len(),
                });
            }
        }
    }
}

/// Writes whole frames to a byte stream.
#[derive(Debug)]
pub struct FrameWriter<W> {
    writer: W,
    codec: FrameCodec,
    buffer: BytesMut,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap a writer.
    pub fn new(writer: W, codec: FrameCodec) -> Self {
        Self {
            writer,
            codec,
            buffer: BytesMut::new(),
        }
    }

    /// Write one frame: header and payload go out in a single write.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is too large or the write fails.
    pub async fn write_frame(&mut self, payload: Bytes) -> Result<(), TransportError> {
        self.buffer.clear();
        self.codec.encode(payload, &mut self.buffer)?;
        self.writer.write_all(&self.buffer).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Shut down the write side.
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown fails.
    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_frame_roundtrip() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        codec.encode(Bytes::from("Hello, World!"), &mut buf).unwrap();
        assert_eq!(&buf[..4], &13u32.to_le_bytes());

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Bytes::from("Hello, World!"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        buf.put_u32_le(100);
        buf.put_slice(b"only a little");

        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_frame_too_large() {
        let mut codec = FrameCodec::new().with_max_frame_size(8);
        let mut buf = BytesMut::new();

        assert!(matches!(
            codec.encode(Bytes::from("way too long"), &mut buf),
            Err(TransportError::FrameTooLarge { size: 12, max: 8 })
        ));

        buf.put_u32_le(9);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(TransportError::FrameTooLarge { size: 9, max: 8 })
        ));
    }

    #[tokio::test]
    async fn test_reader_splits_stream_into_frames() {
        let (client, server) = duplex(64);
        let mut writer = FrameWriter::new(client, FrameCodec::new());
        let mut reader = FrameReader::new(server, FrameCodec::new(), Duration::from_secs(8));

        let send = tokio::spawn(async move {
            writer.write_frame(Bytes::from("first")).await.unwrap();
            writer.write_frame(Bytes::from(vec![7u8; 200])).await.unwrap();
            writer
        });

        assert_eq!(reader.read_frame().await.unwrap(), Bytes::from("first"));
        assert_eq!(reader.read_frame().await.unwrap().len(), 200);

        drop(send.await.unwrap());
        assert!(matches!(
            reader.read_frame().await,
            Err(TransportError::PeerClosed)
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_fatal() {
        let (mut client, server) = duplex(64);
        let mut reader = FrameReader::new(server, FrameCodec::new(), Duration::from_secs(8));

        client.write_all(&10u32.to_le_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);

        assert!(matches!(
            reader.read_frame().await,
            Err(TransportError::Truncated {
                expected: 14,
                received: 7
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_body_is_fatal() {
        let (mut client, server) = duplex(64);
        let mut reader = FrameReader::new(server, FrameCodec::new(), Duration::from_secs(8));

        client.write_all(&10u32.to_le_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();

        assert!(matches!(
            reader.read_frame().await,
            Err(TransportError::Stalled(d)) if d == Duration::from_secs(8)
        ));
        drop(client);
    }
}
