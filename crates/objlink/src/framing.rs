//! Frame codec for the object link wire format
//!
//! Frames are UTF-8 text terminated by a fixed multi-byte delimiter.
//! Compact JSON never contains raw control characters and aliases reject
//! them, so the delimiter cannot occur inside a well-formed frame. No frame
//! length limit is enforced; the receive buffer grows with the largest
//! in-flight frame.

use crate::error::{LinkError, Result};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Terminates every frame on the wire.
pub const FRAME_DELIMITER: &[u8] = b"\r\n\r\n";

const READ_CHUNK: usize = 8192;

/// Stateful decoder: a growable receive buffer scanned for the delimiter.
#[derive(Debug, Default)]
pub struct FrameCodec {
    buf: BytesMut,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Encode one frame: UTF-8 text plus the trailing delimiter.
    pub fn encode(frame: &str) -> Bytes {
        let mut out = BytesMut::with_capacity(frame.len() + FRAME_DELIMITER.len());
        out.extend_from_slice(frame.as_bytes());
        out.extend_from_slice(FRAME_DELIMITER);
        out.freeze()
    }

    /// Append received bytes and extract every complete frame.
    ///
    /// Partial data at the end of the buffer is retained for the next call.
    /// Zero-length frames are yielded as empty strings; callers decide
    /// whether to ignore them (they are tolerated as keepalive padding).
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<String>> {
        self.buf.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(pos) = find_delimiter(&self.buf) {
            let frame = self.buf.split_to(pos);
            let _ = self.buf.split_to(FRAME_DELIMITER.len());
            let text = std::str::from_utf8(&frame)
                .map_err(|e| LinkError::MalformedFrame(format!("invalid UTF-8: {}", e)))?;
            frames.push(text.to_owned());
        }
        Ok(frames)
    }

    /// Bytes currently buffered without a terminating delimiter.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

fn find_delimiter(buf: &[u8]) -> Option<usize> {
    if buf.len() < FRAME_DELIMITER.len() {
        return None;
    }
    buf.windows(FRAME_DELIMITER.len())
        .position(|w| w == FRAME_DELIMITER)
}

/// Reads delimited frames from the read half of a connection.
pub struct FrameReader<T> {
    inner: T,
    codec: FrameCodec,
    ready: VecDeque<String>,
}

impl<T: AsyncRead + Unpin> FrameReader<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            codec: FrameCodec::new(),
            ready: VecDeque::new(),
        }
    }

    /// Read the next complete frame.
    ///
    /// Returns `LinkError::ConnectionClosed` on clean EOF. EOF with a
    /// partial frame still buffered is an I/O error, not a silent drop.
    pub async fn next_frame(&mut self) -> Result<String> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(frame);
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                if self.codec.pending_len() > 0 {
                    return Err(LinkError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed mid-frame",
                    )));
                }
                return Err(LinkError::ConnectionClosed);
            }

            self.ready.extend(self.codec.feed(&chunk[..n])?);
        }
    }
}

/// Writes delimited frames to the write half of a connection.
pub struct FrameWriter<T> {
    inner: T,
}

impl<T: AsyncWrite + Unpin> FrameWriter<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    pub async fn write_frame(&mut self, frame: &str) -> Result<()> {
        let encoded = FrameCodec::encode(frame);
        self.inner.write_all(&encoded).await?;
        self.inner.flush().await?;
        Ok(())
    }
}
