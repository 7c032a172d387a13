//! The `FlowRunner` trait -- the seam between tests and an engine.
//!
//! The engine can be driven as a spawned process over framed stdio
//! ([`super::ProcessRunner`]) or called in-process when it is linked as a
//! library. Both integration modes implement this trait and must return
//! equivalent event lists for equivalent requests.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::types::{RunOutcome, RunRequest};
use crate::error::Result;
use crate::framing::Injection;

/// Runs a flow until a number of output events has been observed.
///
/// Object safe, so runners can be held as `Box<dyn FlowRunner>`.
#[async_trait]
pub trait FlowRunner: Send + Sync {
    /// Short name for logs, e.g. `"process"`.
    fn name(&self) -> &str;

    /// Execute one request.
    ///
    /// When `cancel` fires the runner must stop, and must not return before
    /// any engine it started is gone.
    async fn run(&self, request: &RunRequest, cancel: CancellationToken) -> Result<RunOutcome>;

    /// Call-shaped entry point matching the embedded engine's
    /// `run_once_with_inject(expected, timeout, flows, injections, config)`.
    async fn run_once_with_inject(
        &self,
        expected: usize,
        timeout: Duration,
        flows: Value,
        injections: Vec<Injection>,
        runtime_config: Option<Value>,
    ) -> Result<Vec<Value>> {
        let request = RunRequest::flows(flows, injections, expected)
            .with_runtime_config(runtime_config)
            .with_deadline(timeout);
        let outcome = self.run(&request, CancellationToken::new()).await?;
        Ok(outcome.events)
    }
}

// Compile-time assertion: FlowRunner must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn FlowRunner) {}
};
