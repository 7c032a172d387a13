//! Incremental decoder for the engine's stdout.
//!
//! Bytes are pushed in whatever chunks the transport delivers; complete
//! frames are pulled out one at a time with [`StreamDecoder::next_event`].
//! Pulling (rather than decoding everything a chunk contains) lets the
//! caller stop after exactly the number of events it wants.

use serde_json::Value;
use tracing::trace;

use super::{LF, RS};
use crate::error::{HarnessError, Result};

#[derive(Debug, Default)]
pub struct StreamDecoder {
    /// Undecoded bytes. When `in_frame` is set the separator has already
    /// been consumed and `buf` starts at the frame payload.
    buf: Vec<u8>,
    in_frame: bool,
    /// How much of `buf` is known to contain no terminator.
    scanned: usize,
    /// Every byte ever pushed, for diagnostics.
    captured: Vec<u8>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk read from the stream.
    pub fn push(&mut self, chunk: &[u8]) {
        self.captured.extend_from_slice(chunk);
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame as JSON.
    ///
    /// Returns `Ok(None)` when the buffer holds no complete frame yet. Text
    /// outside frames is discarded as it is encountered.
    pub fn next_event(&mut self) -> Result<Option<Value>> {
        match self.next_payload() {
            Some(payload) => match serde_json::from_slice(&payload) {
                Ok(value) => Ok(Some(value)),
                Err(source) => Err(HarnessError::Decode {
                    source,
                    captured: self.captured.clone(),
                }),
            },
            None => Ok(None),
        }
    }

    fn next_payload(&mut self) -> Option<Vec<u8>> {
        if !self.in_frame {
            match self.buf.iter().position(|b| *b == RS) {
                Some(pos) => {
                    if pos > 0 {
                        trace!(bytes = pos, "discarding non-framed output");
                    }
                    self.buf.drain(..=pos);
                    self.in_frame = true;
                    self.scanned = 0;
                }
                None => {
                    // No separator anywhere: all of it is log text.
                    if !self.buf.is_empty() {
                        trace!(bytes = self.buf.len(), "discarding non-framed output");
                        self.buf.clear();
                    }
                    return None;
                }
            }
        }

        match self.buf[self.scanned..].iter().position(|b| *b == LF) {
            Some(offset) => {
                let end = self.scanned + offset;
                let payload: Vec<u8> = self.buf.drain(..=end).take(end).collect();
                self.in_frame = false;
                self.scanned = 0;
                Some(payload)
            }
            None => {
                self.scanned = self.buf.len();
                None
            }
        }
    }

    /// `true` while a frame has been opened but not terminated.
    pub fn has_partial_frame(&self) -> bool {
        self.in_frame
    }

    /// Everything pushed so far.
    pub fn captured(&self) -> &[u8] {
        &self.captured
    }
}
