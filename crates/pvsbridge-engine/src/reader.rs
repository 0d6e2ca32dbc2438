//! Response reader: turns the engine's output stream into delimited replies

use std::sync::Arc;

use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

use crate::error::{EngineError, Result};
use crate::framing::{FrameStatus, ReplyFraming};

const READ_CHUNK: usize = 8 * 1024;

/// One delimited piece of engine output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Output up to a top-level prompt
    Reply(String),
    /// Output up to a nested break-level prompt
    Nested { text: String, level: u32 },
}

/// Owns the engine's stdout and hands out one frame at a time.
///
/// The buffer is cleared whenever a frame is handed out, so nothing read for
/// one command is ever visible to the next.
pub struct ReplyReader<R> {
    source: R,
    framing: Arc<dyn ReplyFraming>,
    buffer: String,
    carry: Vec<u8>,
}

impl<R: AsyncRead + Unpin> ReplyReader<R> {
    pub fn new(source: R, framing: Arc<dyn ReplyFraming>) -> Self {
        Self {
            source,
            framing,
            buffer: String::new(),
            carry: Vec::new(),
        }
    }

    pub fn framing(&self) -> &Arc<dyn ReplyFraming> {
        &self.framing
    }

    /// Read until the framing strategy reports a boundary.
    ///
    /// End of stream before a boundary is a crash.
    pub async fn next_frame(&mut self) -> Result<Frame> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match self.framing.scan(&self.buffer) {
                FrameStatus::Incomplete => {}
                FrameStatus::Complete { body_end } => {
                    let text = self.take(body_end);
                    return Ok(Frame::Reply(text));
                }
                FrameStatus::Nested { body_end, level } => {
                    let text = self.take(body_end);
                    return Ok(Frame::Nested { text, level });
                }
            }

            let n = self.source.read(&mut chunk).await?;
            if n == 0 {
                debug!(
                    buffered = self.buffer.len(),
                    "Engine output closed before prompt"
                );
                let tail: String = self.buffer.chars().rev().take(200).collect();
                let tail: String = tail.chars().rev().collect();
                self.buffer.clear();
                return Err(EngineError::Crashed(format!(
                    "engine output closed unexpectedly{}",
                    if tail.trim().is_empty() {
                        String::new()
                    } else {
                        format!(": {}", tail.trim())
                    }
                )));
            }
            self.push_bytes(&chunk[..n]);
            trace!(bytes = n, "Engine output chunk");
        }
    }

    /// Throw away everything the engine printed after its last prompt.
    ///
    /// Reads only what the stream can hand over without waiting; returns the
    /// number of bytes dropped. End of stream is left for `next_frame`.
    pub fn discard_pending(&mut self) -> Result<usize> {
        let mut dropped = self.buffer.len() + self.carry.len();
        self.buffer.clear();
        self.carry.clear();

        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match self.source.read(&mut chunk).now_or_never() {
                None | Some(Ok(0)) => break,
                Some(Ok(n)) => dropped += n,
                Some(Err(err)) => return Err(err.into()),
            }
        }
        if dropped > 0 {
            debug!(bytes = dropped, "Discarded engine output from a finished command");
        }
        Ok(dropped)
    }

    fn take(&mut self, body_end: usize) -> String {
        let text = self.buffer[..body_end].to_string();
        self.buffer.clear();
        text
    }

    /// Decode bytes, holding back a UTF-8 sequence split across chunks
    fn push_bytes(&mut self, bytes: &[u8]) {
        self.carry.extend_from_slice(bytes);
        loop {
            match std::str::from_utf8(&self.carry) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    self.carry.clear();
                    return;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    // valid_up_to is a char boundary by contract
                    if let Ok(text) = std::str::from_utf8(&self.carry[..valid]) {
                        self.buffer.push_str(text);
                    }
                    match err.error_len() {
                        None => {
                            self.carry.drain(..valid);
                            return;
                        }
                        Some(bad) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            self.carry.drain(..valid + bad);
                        }
                    }
                }
            }
        }
    }
}
