//! JSON-RPC framing codec.
//!
//! The wire format is `Content-Length: N\r\n\r\n{json}` over the server's
//! stdin/stdout. This module provides [`FrameReader`] and [`FrameWriter`]
//! for async reading and writing of framed messages. No retry logic lives
//! here; callers decide what to do with errors.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::TransportError;

/// Maximum frame size (16 MiB) to prevent unbounded memory allocation.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Reads JSON-RPC frames from an async reader.
///
/// Parses `Content-Length` headers and reads exactly that many bytes,
/// then deserializes the body as JSON.
pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on EOF at a frame boundary (clean shutdown).
    /// Returns [`TransportError::Frame`] on malformed headers, truncated
    /// bodies, oversized frames, or unparseable JSON.
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>, TransportError> {
        let content_length = match self.read_headers().await? {
            Some(len) => len,
            None => return Ok(None),
        };

        if content_length > MAX_FRAME_BYTES {
            return Err(TransportError::Frame(format!(
                "Content-Length {content_length} exceeds maximum {MAX_FRAME_BYTES}"
            )));
        }

        let mut body = vec![0u8; content_length];
        self.reader
            .read_exact(&mut body)
            .await
            .map_err(|e| TransportError::Frame(format!("reading frame body: {e}")))?;

        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| TransportError::Frame(format!("parsing frame payload: {e}")))
    }

    /// Read the next frame, failing with [`TransportError::Timeout`] if no
    /// complete frame arrives within `timeout`.
    pub async fn read_frame_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<serde_json::Value>, TransportError> {
        tokio::time::timeout(timeout, self.read_frame())
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    /// Parse headers until the empty line separator.
    ///
    /// Returns the `Content-Length` value, or `None` on EOF.
    async fn read_headers(&mut self) -> Result<Option<usize>, TransportError> {
        let mut content_length: Option<usize> = None;
        let mut line = String::new();
        let mut saw_any_header_bytes = false;

        loop {
            line.clear();
            let bytes_read = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(|e| TransportError::Frame(format!("reading header line: {e}")))?;

            if bytes_read == 0 {
                // EOF is clean only at a frame boundary. EOF after a partial
                // header block (e.g. only Content-Type) is a broken frame.
                if !saw_any_header_bytes {
                    return Ok(None);
                }
                return Err(TransportError::Frame(
                    "unexpected EOF while reading headers".to_string(),
                ));
            }
            saw_any_header_bytes = true;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                break;
            }

            // The header is defined as "Content-Length" but parse
            // case-insensitively for robustness against sloppy servers.
            if let Some(colon_pos) = trimmed.find(':') {
                let key = &trimmed[..colon_pos];
                if key.eq_ignore_ascii_case("Content-Length") {
                    let len: usize = trimmed[colon_pos + 1..].trim().parse().map_err(|_| {
                        TransportError::Frame(format!("invalid Content-Length: {trimmed}"))
                    })?;
                    content_length = Some(len);
                }
            }
            // Other headers (e.g. Content-Type) are ignored.
        }

        match content_length {
            Some(len) => Ok(Some(len)),
            None => Err(TransportError::Frame(
                "missing Content-Length header".to_string(),
            )),
        }
    }
}

/// Writes JSON-RPC frames to an async writer.
///
/// Serializes JSON and prepends the `Content-Length` header; flushes after
/// every frame.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_frame(&mut self, msg: &serde_json::Value) -> Result<(), TransportError> {
        let body = serde_json::to_string(msg)
            .map_err(|e| TransportError::Frame(format!("serializing frame: {e}")))?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());

        self.writer
            .write_all(header.as_bytes())
            .await
            .map_err(|_| TransportError::Closed)?;
        self.writer
            .write_all(body.as_bytes())
            .await
            .map_err(|_| TransportError::Closed)?;
        self.writer.flush().await.map_err(|_| TransportError::Closed)?;

        Ok(())
    }
}
