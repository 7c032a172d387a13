//! Completion controller: counts decoded events and drives shutdown.
//!
//! Decoding never decides when to stop. The controller pulls events from a
//! [`FrameReader`], counts them with an [`ExpectationCounter`], and once the
//! expected number has arrived it interrupts the engine and waits (bounded)
//! for it to exit.

use std::process::ExitStatus;
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncRead;
use tracing::{debug, warn};

use super::launch::ProcessHandle;
use crate::error::{HarnessError, Result};
use crate::framing::FrameReader;

/// Where an invocation currently is.
///
/// `Idle -> Launching -> Writing -> Reading -> ShuttingDown -> {Done | Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Launching,
    Writing,
    Reading,
    ShuttingDown,
    Done,
    Failed,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Done | RunPhase::Failed)
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunPhase::Idle => "idle",
            RunPhase::Launching => "launching",
            RunPhase::Writing => "writing input",
            RunPhase::Reading => "reading output",
            RunPhase::ShuttingDown => "shutting down",
            RunPhase::Done => "done",
            RunPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Counts events towards an expected total.
///
/// `count` never exceeds `expected`, and reaching `expected` is reported
/// exactly once.
#[derive(Debug, Clone)]
pub struct ExpectationCounter {
    expected: usize,
    count: usize,
    fired: bool,
}

impl ExpectationCounter {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            count: 0,
            fired: false,
        }
    }

    /// Count one event. Returns `true` only for the event that completes
    /// the expectation.
    pub fn record(&mut self) -> bool {
        if self.count < self.expected {
            self.count += 1;
        }
        self.trigger()
    }

    /// Returns `true` the first time the expectation is found satisfied.
    /// Covers `expected == 0`, which is satisfied before any event.
    pub fn trigger(&mut self) -> bool {
        if self.count == self.expected && !self.fired {
            self.fired = true;
            return true;
        }
        false
    }

    pub fn is_satisfied(&self) -> bool {
        self.count == self.expected
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn expected(&self) -> usize {
        self.expected
    }
}

/// How the read phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEnd {
    /// The expected number of events arrived.
    Satisfied,
    /// The engine closed stdout first.
    EndOfStream,
}

/// Per-invocation state machine.
#[derive(Debug)]
pub struct Controller {
    phase: RunPhase,
    counter: ExpectationCounter,
    grace: Duration,
    events: Vec<Value>,
}

impl Controller {
    pub fn new(expected: usize, grace: Duration) -> Self {
        Self {
            phase: RunPhase::Idle,
            counter: ExpectationCounter::new(expected),
            grace,
            events: Vec::with_capacity(expected.min(1024)),
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn enter(&mut self, next: RunPhase) {
        if self.phase.is_terminal() {
            warn!(from = %self.phase, to = %next, "ignoring transition out of a terminal phase");
            return;
        }
        debug!(from = %self.phase, to = %next, "phase transition");
        self.phase = next;
    }

    pub fn events(&self) -> &[Value] {
        &self.events
    }

    pub fn take_events(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.events)
    }

    pub fn counter(&self) -> &ExpectationCounter {
        &self.counter
    }

    /// Pull events until the expectation is met or the stream ends.
    ///
    /// Stops pulling the moment the last expected event arrives, so nothing
    /// the engine writes afterwards is decoded.
    pub async fn collect<R>(&mut self, reader: &mut FrameReader<R>) -> Result<ReadEnd>
    where
        R: AsyncRead + Unpin,
    {
        if self.counter.trigger() {
            return Ok(ReadEnd::Satisfied);
        }
        while let Some(event) = reader.next_event().await? {
            self.events.push(event);
            debug!(
                count = self.counter.count() + 1,
                expected = self.counter.expected(),
                "event decoded"
            );
            if self.counter.record() {
                return Ok(ReadEnd::Satisfied);
            }
        }
        Ok(ReadEnd::EndOfStream)
    }

    /// Interrupt the engine once and wait for it to exit.
    ///
    /// If it is still running after the grace period it is killed and the
    /// invocation fails with [`HarnessError::ShutdownTimeout`], which keeps
    /// the collected events.
    pub async fn shutdown(&mut self, handle: &mut ProcessHandle) -> Result<Option<ExitStatus>> {
        if handle.is_running() {
            if let Err(e) = handle.interrupt() {
                // Most likely the engine exited between the check and the signal.
                debug!(pid = handle.pid(), error = %e, "interrupt failed");
            }
        }

        match handle.wait_for_exit(self.grace).await? {
            Some(status) => {
                debug!(pid = handle.pid(), code = ?status.code(), "engine exited after interrupt");
                Ok(Some(status))
            }
            None => {
                warn!(
                    pid = handle.pid(),
                    grace = ?self.grace,
                    "engine ignored interrupt, killing"
                );
                handle.terminate().await?;
                Err(HarnessError::ShutdownTimeout {
                    grace: self.grace,
                    events: self.take_events(),
                })
            }
        }
    }

    /// Reap an engine that closed its output on its own.
    ///
    /// Gives it the grace period to exit, then kills it.
    pub async fn reap(&mut self, handle: &mut ProcessHandle) -> Result<Option<ExitStatus>> {
        match handle.wait_for_exit(self.grace).await? {
            Some(status) => Ok(Some(status)),
            None => {
                warn!(pid = handle.pid(), "engine closed stdout but kept running, killing");
                handle.terminate().await?;
                Ok(None)
            }
        }
    }
}
