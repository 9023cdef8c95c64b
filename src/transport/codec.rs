//! Content-Length framing
//!
//! Frames look like `Content-Length: <N>\r\n\r\n<N bytes of JSON>`. The
//! decoder accumulates raw reads and yields complete frames regardless of
//! how the underlying stream chunked them.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use super::message::Message;
use crate::{Error, Result};

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const LENGTH_HEADER: &[u8] = b"content-length";
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Longest header block accepted before the bytes are treated as garbage
pub const MAX_HEADER_SIZE: usize = 8 * 1024;

/// Largest frame body accepted; larger declared lengths are discarded
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Serialize a message into a complete frame
pub fn encode_frame(message: &Message) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(message)?;
    let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Incremental frame decoder
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes received but not yet consumed as a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append a chunk and return every message it completed.
    ///
    /// Frames whose body is not a valid message are logged and dropped.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Message> {
        self.buffer.extend_from_slice(chunk);

        let mut messages = Vec::new();
        while let Some(body) = self.next_frame() {
            match Message::from_slice(&body) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    tracing::warn!(
                        "Discarding malformed frame: {} - {}",
                        e,
                        String::from_utf8_lossy(&body)
                    );
                }
            }
        }
        messages
    }

    /// Pop the next complete frame body off the buffer
    fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            let Some(header_end) = find_subslice(&self.buffer, HEADER_TERMINATOR) else {
                if self.buffer.len() > MAX_HEADER_SIZE {
                    tracing::warn!(
                        "Discarding {} bytes without a frame header",
                        self.buffer.len()
                    );
                    self.resync(1);
                }
                return None;
            };
            let body_start = header_end + HEADER_TERMINATOR.len();

            let length = match parse_content_length(&self.buffer[..header_end]) {
                Some(length) if length <= MAX_FRAME_SIZE => length,
                Some(length) => {
                    tracing::warn!(
                        "Discarding frame declaring {} bytes (limit {})",
                        length,
                        MAX_FRAME_SIZE
                    );
                    self.resync(body_start);
                    continue;
                }
                None => {
                    tracing::warn!(
                        "Skipping header block without a valid Content-Length: {:?}",
                        String::from_utf8_lossy(&self.buffer[..header_end])
                    );
                    self.buffer.drain(..body_start);
                    continue;
                }
            };

            let body_end = body_start + length;
            if self.buffer.len() < body_end {
                return None;
            }

            let body = self.buffer[body_start..body_end].to_vec();
            self.buffer.drain(..body_end);
            return Some(body);
        }
    }

    /// Drop everything before the next `Content-Length` header at or after `from`
    fn resync(&mut self, from: usize) {
        let from = from.min(self.buffer.len());
        let cut = match find_subslice_ignore_case(&self.buffer[from..], LENGTH_HEADER) {
            Some(offset) => from + offset,
            // Keep a tail that could be the start of a header split across reads
            None => self.buffer.len() - partial_header_tail(&self.buffer[from..]),
        };
        self.buffer.drain(..cut);
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn find_subslice_ignore_case(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
}

/// Length of the longest suffix of `bytes` that begins a `Content-Length` header
fn partial_header_tail(bytes: &[u8]) -> usize {
    (1..LENGTH_HEADER.len().min(bytes.len() + 1))
        .rev()
        .find(|&n| bytes[bytes.len() - n..].eq_ignore_ascii_case(&LENGTH_HEADER[..n]))
        .unwrap_or(0)
}

fn parse_content_length(header: &[u8]) -> Option<usize> {
    let header = std::str::from_utf8(header).ok()?;
    header.split("\r\n").find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

/// Read frames until the stream ends, handing each message to `on_message`.
///
/// Returns once the stream reaches EOF or fails; consumers decide what that
/// means for outstanding work.
pub async fn read_frames<R, F>(mut reader: R, mut on_message: F) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(Message),
{
    let mut decoder = FrameDecoder::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if decoder.buffered() > 0 {
                tracing::debug!(
                    "Stream closed with {} undecoded bytes buffered",
                    decoder.buffered()
                );
            }
            return Ok(());
        }
        for message in decoder.decode(&chunk[..n]) {
            on_message(message);
        }
    }
}

/// Serializing frame writer
///
/// Callers are served in lock-acquisition order, so frames hit the stream
/// in the order `send` was called.
pub struct FrameWriter {
    inner: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl FrameWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Mutex::new(Box::new(writer)),
        }
    }

    pub async fn send(&self, message: &Message) -> Result<()> {
        let frame = encode_frame(message)?;

        let mut writer = self.inner.lock().await;
        writer
            .write_all(&frame)
            .await
            .map_err(|e| Error::Transport(format!("Failed to write frame: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::Transport(format!("Failed to flush frame: {}", e)))?;

        Ok(())
    }

    /// Close the write half (the server sees EOF on its stdin)
    pub async fn close(&self) -> Result<()> {
        let mut writer = self.inner.lock().await;
        writer
            .shutdown()
            .await
            .map_err(|e| Error::Transport(format!("Failed to close stream: {}", e)))
    }
}
