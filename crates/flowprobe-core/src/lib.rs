//! Drive a flow engine as a child process and collect what it emits.
//!
//! The engine reads a flows frame and injection frames on stdin and writes
//! one frame per message reaching a `console-json` node on stdout. A run
//! ends as soon as the expected number of frames has been decoded.

pub mod error;
pub mod flows;
pub mod framing;
pub mod harness;

pub use error::{HarnessError, Result, TimeoutKind};
pub use framing::Injection;
pub use harness::{FlowRunner, ProcessRunner, RunOutcome, RunRequest, RunnerConfig, ShortReadPolicy};
