//! Engine harness: launch, feed, collect, shut down.
//!
//! # Architecture
//!
//! ```text
//! caller
//!     |
//!     v
//! &dyn FlowRunner --run(request, cancel)--> ProcessRunner
//!                                               |
//!      launch(EngineCommand, InputMode) --------+
//!            |
//!            v
//!      ProcessHandle { pid, stdin, stdout, stderr drain }
//!            |
//!      stdin  <-- encode_input(flows, injections)
//!      stdout --> FrameReader --> Controller (ExpectationCounter)
//!                                     |
//!                         expected reached: interrupt, wait grace
//!                         grace exceeded:   kill, reap
//! ```

pub mod controller;
pub mod launch;
pub mod process;
pub mod trait_def;
pub mod types;

pub use controller::{Controller, ExpectationCounter, ReadEnd, RunPhase};
pub use launch::{ENGINE_BINARY, EngineCommand, EngineLocator, InputMode, ProcessHandle, is_executable, launch};
pub use process::{ENGINE_CONFIG_FILE, ProcessRunner};
pub use trait_def::FlowRunner;
pub use types::{FlowSource, RunOutcome, RunRequest, RunnerConfig, ShortReadPolicy};
