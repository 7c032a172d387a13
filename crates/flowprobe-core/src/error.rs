//! Error taxonomy for a single harness invocation.
//!
//! Every variant that can be produced after the child started is returned
//! only once the child has been killed and reaped, so a caller holding an
//! `Err` never has to worry about a stray engine process.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::harness::controller::RunPhase;

/// Which bound was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// A single read of the child's stdout took too long.
    Read,
    /// The overall invocation deadline expired.
    Deadline,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutKind::Read => write!(f, "read"),
            TimeoutKind::Deadline => write!(f, "deadline"),
        }
    }
}

/// Errors that can occur while driving the engine.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("failed to launch engine {}: {source}", program.display())]
    Launch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write input to engine: {source}")]
    Write {
        #[source]
        source: std::io::Error,
        captured: Vec<u8>,
    },

    #[error("malformed JSON frame in engine output: {source}")]
    Decode {
        #[source]
        source: serde_json::Error,
        captured: Vec<u8>,
    },

    #[error("{kind} timeout after {after:?} while {phase}")]
    Timeout {
        kind: TimeoutKind,
        after: Duration,
        phase: RunPhase,
        captured: Vec<u8>,
    },

    #[error("engine did not exit within {grace:?} of the interrupt and was killed")]
    ShutdownTimeout { grace: Duration, events: Vec<Value> },

    #[error("engine closed its output after {} of {expected} expected events", events.len())]
    ShortRead { expected: usize, events: Vec<Value> },

    #[error("invocation cancelled while {phase}")]
    Cancelled { phase: RunPhase, captured: Vec<u8> },

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid runtime config: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// Raw bytes the engine wrote to stdout before the failure, if this
    /// variant carries them.
    pub fn captured(&self) -> Option<&[u8]> {
        match self {
            HarnessError::Write { captured, .. }
            | HarnessError::Decode { captured, .. }
            | HarnessError::Timeout { captured, .. }
            | HarnessError::Cancelled { captured, .. } => Some(captured),
            _ => None,
        }
    }

    /// Events collected before the failure, for the variants that keep them.
    pub fn events(&self) -> Option<&[Value]> {
        match self {
            HarnessError::ShutdownTimeout { events, .. } | HarnessError::ShortRead { events, .. } => {
                Some(events)
            }
            _ => None,
        }
    }

    /// `true` for either kind of timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, HarnessError::Timeout { .. })
    }

    /// Fill in the captured output for variants created before it was known.
    pub(crate) fn with_captured(mut self, bytes: &[u8]) -> Self {
        if let HarnessError::Write { captured, .. }
        | HarnessError::Timeout { captured, .. }
        | HarnessError::Cancelled { captured, .. } = &mut self
        {
            if captured.is_empty() {
                captured.extend_from_slice(bytes);
            }
        }
        self
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_error_exposes_captured_bytes() {
        let source = serde_json::from_str::<Value>("{oops").unwrap_err();
        let err = HarnessError::Decode {
            source,
            captured: b"log\x1e{oops\n".to_vec(),
        };
        assert_eq!(err.captured(), Some(&b"log\x1e{oops\n"[..]));
        assert!(err.to_string().contains("malformed JSON"));
    }

    #[test]
    fn with_captured_fills_only_empty_buffers() {
        let err = HarnessError::Timeout {
            kind: TimeoutKind::Read,
            after: Duration::from_secs(1),
            phase: RunPhase::Reading,
            captured: Vec::new(),
        }
        .with_captured(b"abc");
        assert_eq!(err.captured(), Some(&b"abc"[..]));

        let err = HarnessError::Cancelled {
            phase: RunPhase::Writing,
            captured: b"first".to_vec(),
        }
        .with_captured(b"second");
        assert_eq!(err.captured(), Some(&b"first"[..]));
    }

    #[test]
    fn timeout_display_names_kind_and_phase() {
        let err = HarnessError::Timeout {
            kind: TimeoutKind::Deadline,
            after: Duration::from_millis(500),
            phase: RunPhase::ShuttingDown,
            captured: Vec::new(),
        };
        let msg = err.to_string();
        assert!(msg.contains("deadline timeout"), "got: {msg}");
        assert!(msg.contains("shutting down"), "got: {msg}");
        assert!(err.is_timeout());
    }

    #[test]
    fn short_read_keeps_partial_events() {
        let err = HarnessError::ShortRead {
            expected: 3,
            events: vec![serde_json::json!({"a": 1})],
        };
        assert_eq!(err.events().map(<[Value]>::len), Some(1));
        assert!(err.to_string().contains("1 of 3"));
        assert!(err.captured().is_none());
    }
}
