//! Length-prefixed frame codec for async streams
//!
//! One frame carries exactly one message: a 4-byte big-endian length followed by
//! the encoded envelope.

use crate::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

/// Frame codec for encoding/decoding frames over async streams
#[derive(Debug)]
pub struct FrameCodec {
    /// Read buffer for incoming data
    read_buf: BytesMut,
    /// Maximum frame size allowed
    max_frame_size: usize,
    /// Body bytes of a rejected frame still to be skipped
    discard: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a new frame codec with default settings
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Create a new frame codec with custom max frame size
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            read_buf: BytesMut::with_capacity(8192),
            max_frame_size,
            discard: 0,
        }
    }

    /// Maximum payload size accepted by this codec
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a payload to bytes with length prefix
    pub fn encode_frame(&self, payload: &[u8]) -> Result<Bytes, ProtocolError> {
        if payload.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: self.max_frame_size,
            });
        }

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);

        Ok(buf.freeze())
    }

    /// Write a frame to an async writer
    pub async fn write_frame<W>(&self, writer: &mut W, payload: &[u8]) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let encoded = self.encode_frame(payload)?;
        writer
            .write_all(&encoded)
            .await
            .map_err(|source| ProtocolError::Io { op: "write", source })?;
        writer
            .flush()
            .await
            .map_err(|source| ProtocolError::Io { op: "flush", source })?;
        Ok(())
    }

    /// Read a frame from an async reader.
    ///
    /// Returns `Ok(None)` when the stream ends on a frame boundary. A
    /// [`ProtocolError::FrameTooLarge`] is recoverable: the body of the
    /// rejected frame is skipped and the next call resumes with the frame
    /// after it.
    pub async fn read_frame<R>(&mut self, reader: &mut R) -> Result<Option<Bytes>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(frame) = self.try_decode_frame()? {
                return Ok(Some(frame));
            }

            let n = reader
                .read_buf(&mut self.read_buf)
                .await
                .map_err(|source| ProtocolError::Io { op: "read", source })?;

            if n == 0 {
                if self.read_buf.is_empty() && self.discard == 0 {
                    return Ok(None);
                } else {
                    return Err(ProtocolError::InvalidFrame);
                }
            }
        }
    }

    /// Try to decode a frame from the internal buffer
    pub fn try_decode_frame(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        if self.discard > 0 {
            let skipped = self.discard.min(self.read_buf.len());
            self.read_buf.advance(skipped);
            self.discard -= skipped;
            if self.discard > 0 {
                return Ok(None);
            }
        }

        if self.read_buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        // Peek the length prefix without consuming it
        let frame_len = (&self.read_buf[..LENGTH_PREFIX]).get_u32() as usize;

        if frame_len > self.max_frame_size {
            self.read_buf.advance(LENGTH_PREFIX);
            self.discard = frame_len;
            return Err(ProtocolError::FrameTooLarge {
                size: frame_len,
                max: self.max_frame_size,
            });
        }

        if self.read_buf.len() < LENGTH_PREFIX + frame_len {
            self.read_buf.reserve(LENGTH_PREFIX + frame_len - self.read_buf.len());
            return Ok(None);
        }

        self.read_buf.advance(LENGTH_PREFIX);
        Ok(Some(self.read_buf.split_to(frame_len).freeze()))
    }

    /// Get the current buffer size
    pub fn buffer_size(&self) -> usize {
        self.read_buf.len()
    }

    /// Whether the codec is skipping the body of a rejected frame
    pub fn is_discarding(&self) -> bool {
        self.discard > 0
    }

    /// Clear the internal buffer
    pub fn clear_buffer(&mut self) {
        self.read_buf.clear();
        self.discard = 0;
    }
}
