//! Timed reads from an async byte source feeding a [`StreamDecoder`].

use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use super::decoder::StreamDecoder;
use crate::error::{HarnessError, Result, TimeoutKind};
use crate::harness::controller::RunPhase;

const READ_CHUNK: usize = 8 * 1024;

/// Produces decoded events from a byte stream, one at a time.
///
/// Every read is bounded by `read_timeout`. Frames already buffered are
/// always handed out before another read is issued.
#[derive(Debug)]
pub struct FrameReader<R> {
    reader: R,
    decoder: StreamDecoder,
    read_timeout: Duration,
    eof: bool,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, read_timeout: Duration) -> Self {
        Self {
            reader,
            decoder: StreamDecoder::new(),
            read_timeout,
            eof: false,
            chunk: vec![0; READ_CHUNK],
        }
    }

    /// Next event, or `Ok(None)` once the stream has ended.
    ///
    /// A frame left open at end-of-stream is dropped.
    pub async fn next_event(&mut self) -> Result<Option<Value>> {
        loop {
            if let Some(event) = self.decoder.next_event()? {
                return Ok(Some(event));
            }
            if self.eof {
                return Ok(None);
            }

            let read = tokio::time::timeout(self.read_timeout, self.reader.read(&mut self.chunk));
            match read.await {
                Ok(Ok(0)) => {
                    if self.decoder.has_partial_frame() {
                        debug!("stream closed inside an unterminated frame");
                    }
                    self.eof = true;
                }
                Ok(Ok(n)) => self.decoder.push(&self.chunk[..n]),
                Ok(Err(e)) => return Err(HarnessError::Io(e)),
                Err(_) => {
                    return Err(HarnessError::Timeout {
                        kind: TimeoutKind::Read,
                        after: self.read_timeout,
                        phase: RunPhase::Reading,
                        captured: self.decoder.captured().to_vec(),
                    });
                }
            }
        }
    }

    /// `true` once a zero-length read was observed.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn captured(&self) -> &[u8] {
        self.decoder.captured()
    }

    /// Buffer whatever the source still has, without decoding it, until
    /// end-of-stream or until `read_timeout` has passed in total.
    ///
    /// Returns the number of bytes added to [`FrameReader::captured`].
    pub async fn drain(&mut self) -> usize {
        let before = self.decoder.captured().len();
        let Self {
            reader,
            decoder,
            read_timeout,
            eof,
            chunk,
        } = self;
        let drained = tokio::time::timeout(*read_timeout, async {
            while !*eof {
                match reader.read(chunk.as_mut_slice()).await {
                    Ok(0) => *eof = true,
                    Ok(n) => decoder.push(&chunk[..n]),
                    Err(e) => {
                        debug!(error = %e, "stream failed while draining");
                        break;
                    }
                }
            }
        })
        .await;
        if drained.is_err() {
            debug!("stream still open after drain window");
        }
        self.decoder.captured().len() - before
    }
}
