//! Request, outcome, and configuration types shared by runners.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::launch::InputMode;
use crate::flows;
use crate::framing::{Injection, encode_input, injections_to};

/// What to do when the engine closes its output before the expected number
/// of events arrived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShortReadPolicy {
    /// Return what was collected; [`RunOutcome::complete`] is `false`.
    #[default]
    ReturnPartial,
    /// Fail with [`crate::HarnessError::ShortRead`].
    Error,
}

/// Timing and policy knobs for one runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Bound on each individual read of the engine's stdout.
    pub read_timeout: Duration,
    /// Bound on the whole invocation, launch to exit.
    pub deadline: Duration,
    /// How long the engine gets to exit after being interrupted.
    pub grace: Duration,
    pub short_read: ShortReadPolicy,
}

impl RunnerConfig {
    pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(8);
    pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);
    pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            read_timeout: Self::DEFAULT_READ_TIMEOUT,
            deadline: Self::DEFAULT_DEADLINE,
            grace: Self::DEFAULT_GRACE,
            short_read: ShortReadPolicy::default(),
        }
    }
}

/// Where the flow definition comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowSource {
    /// Stream the flows and injections over stdin.
    Stdin {
        flows: Value,
        injections: Vec<Injection>,
    },
    /// Let the engine read a flows file; nothing is injected.
    File(PathBuf),
}

impl FlowSource {
    pub fn stdin(flows: Value, injections: Vec<Injection>) -> Self {
        FlowSource::Stdin { flows, injections }
    }

    pub fn input_mode(&self) -> InputMode {
        match self {
            FlowSource::Stdin { .. } => InputMode::Stdin,
            FlowSource::File(path) => InputMode::File(path.clone()),
        }
    }

    /// Bytes to write to stdin, if any.
    pub fn encoded_input(&self) -> Result<Option<Vec<u8>>, serde_json::Error> {
        match self {
            FlowSource::Stdin { flows, injections } => encode_input(flows, injections).map(Some),
            FlowSource::File(_) => Ok(None),
        }
    }
}

/// One invocation of the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    /// Number of output events that ends the read phase.
    pub expected: usize,
    pub source: FlowSource,
    /// Engine configuration, materialized as `edgelinkd.toml` in a private
    /// home directory.
    pub runtime_config: Option<Value>,
    /// Overrides [`RunnerConfig::deadline`] for this request.
    pub deadline: Option<Duration>,
}

impl RunRequest {
    pub fn new(expected: usize, source: FlowSource) -> Self {
        Self {
            expected,
            source,
            runtime_config: None,
            deadline: None,
        }
    }

    /// Run `flows` and inject `injections` over stdin.
    pub fn flows(flows: Value, injections: Vec<Injection>, expected: usize) -> Self {
        Self::new(expected, FlowSource::stdin(flows, injections))
    }

    /// Let the engine load `path` itself.
    pub fn flows_file(path: impl Into<PathBuf>, expected: usize) -> Self {
        Self::new(expected, FlowSource::File(path.into()))
    }

    /// Wrap `node` in the standard single-node topology and inject `msgs`
    /// into it.
    pub fn single_node(node: &Value, msgs: impl IntoIterator<Item = Value>, expected: usize) -> Self {
        Self::flows(
            flows::single_node_flow(node),
            injections_to(flows::SUBJECT_NODE_ID, msgs),
            expected,
        )
    }

    pub fn with_runtime_config(mut self, config: Option<Value>) -> Self {
        self.runtime_config = config;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Result of a successful invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    /// Decoded events in arrival order.
    pub events: Vec<Value>,
    /// `false` when the engine closed its output early.
    pub complete: bool,
    /// Exit code, if the engine exited normally. `None` when it was killed
    /// or terminated by a signal.
    pub exit_code: Option<i32>,
    /// What the engine wrote to stderr (truncated).
    pub stderr: String,
}

impl RunOutcome {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
