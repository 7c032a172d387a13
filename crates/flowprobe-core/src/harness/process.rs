//! Process runner: drives the engine as a child process over framed stdio.
//!
//! One call to [`ProcessRunner::run`] is one invocation:
//!
//! 1. Encode the input (before anything is spawned).
//! 2. Launch the engine.
//! 3. Write the flows frame and injection frames, then close stdin.
//! 4. Pull decoded events until the expected count or end-of-stream.
//! 5. Interrupt the engine and wait for it to exit.
//!
//! The overall deadline is measured from the start of step 1, so encoding,
//! writing the runtime config and spawning all count against it. Those
//! steps are synchronous and cannot be cut short; a deadline spent during
//! them fires as soon as the engine is up. Steps 3-5 also stop on the
//! cancellation token. Whatever ends the invocation, the engine is killed
//! and reaped before `run` returns.

use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::{ChildStdin, ChildStdout};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use super::controller::{Controller, ReadEnd, RunPhase};
use super::launch::{EngineCommand, EngineLocator, ProcessHandle, launch};
use super::trait_def::FlowRunner;
use super::types::{RunOutcome, RunRequest, RunnerConfig, ShortReadPolicy};
use crate::error::{HarnessError, Result, TimeoutKind};
use crate::framing::FrameReader;
use crate::framing::encoder::write_input;

/// Name of the engine's configuration file inside its home directory.
pub const ENGINE_CONFIG_FILE: &str = "edgelinkd.toml";

/// Runs flows by spawning the engine executable.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    command: EngineCommand,
    config: RunnerConfig,
}

/// How the guarded part of an invocation ended, before cleanup.
enum Stop {
    Finished(Result<Finish>),
    Deadline(Duration),
    Cancelled,
}

struct Finish {
    complete: bool,
    exit_code: Option<i32>,
}

impl ProcessRunner {
    pub fn new(command: EngineCommand) -> Self {
        Self {
            command,
            config: RunnerConfig::default(),
        }
    }

    /// Runner for an engine at `path` with default settings.
    pub fn with_binary(path: impl Into<std::path::PathBuf>) -> Self {
        Self::new(EngineCommand::new(path))
    }

    /// Runner for the engine found in a cargo build tree.
    pub fn from_locator(locator: &EngineLocator) -> Self {
        Self::with_binary(locator.binary_path())
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn command(&self) -> &EngineCommand {
        &self.command
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Write the request's runtime config into a fresh home directory.
    ///
    /// The directory must outlive the engine, so the caller keeps it.
    fn prepare_home(&self, request: &RunRequest) -> Result<Option<TempDir>> {
        let Some(config) = &request.runtime_config else {
            return Ok(None);
        };
        if !config.is_object() {
            return Err(HarnessError::Config(
                "runtime config must be a JSON object".to_string(),
            ));
        }
        let text = toml::to_string(config).map_err(|e| HarnessError::Config(e.to_string()))?;

        let dir = tempfile::Builder::new().prefix("flowprobe-home-").tempdir()?;
        std::fs::write(dir.path().join(ENGINE_CONFIG_FILE), text)?;
        debug!(home = %dir.path().display(), "materialized runtime config");
        Ok(Some(dir))
    }

    async fn invoke(&self, request: &RunRequest, cancel: CancellationToken) -> Result<RunOutcome> {
        let started = Instant::now();
        let mut controller = Controller::new(request.expected, self.config.grace);
        let deadline = request.deadline.unwrap_or(self.config.deadline);

        // Encoding and config errors surface before anything is spawned.
        let input = request.source.encoded_input()?;
        let home = self.prepare_home(request)?;
        let mut command = self.command.clone();
        if let Some(dir) = &home {
            command.home = Some(dir.path().to_path_buf());
        }

        controller.enter(RunPhase::Launching);
        let mut handle = match launch(&command, &request.source.input_mode()) {
            Ok(handle) => handle,
            Err(e) => {
                controller.enter(RunPhase::Failed);
                return Err(e);
            }
        };
        let pid = handle.pid();
        info!(pid, expected = request.expected, "engine started");

        let stdin = handle.take_stdin();
        let Some(stdout) = handle.take_stdout() else {
            let _ = handle.terminate().await;
            return Err(HarnessError::Io(std::io::Error::other("engine stdout not piped")));
        };
        let mut reader = FrameReader::new(stdout, self.config.read_timeout);

        let stop = {
            let guarded = drive(
                &mut controller,
                &mut handle,
                &mut reader,
                stdin,
                input,
                self.config.short_read,
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Stop::Cancelled,
                res = tokio::time::timeout_at(started + deadline, guarded) => match res {
                    Ok(finished) => Stop::Finished(finished),
                    Err(_) => Stop::Deadline(deadline),
                },
            }
        };

        let result = match stop {
            Stop::Finished(result) => result,
            Stop::Deadline(after) => Err(HarnessError::Timeout {
                kind: TimeoutKind::Deadline,
                after,
                phase: controller.phase(),
                captured: Vec::new(),
            }),
            Stop::Cancelled => Err(HarnessError::Cancelled {
                phase: controller.phase(),
                captured: Vec::new(),
            }),
        };

        match result {
            Ok(finish) => {
                controller.enter(RunPhase::Done);
                let stderr = String::from_utf8_lossy(&handle.stderr_output().await).into_owned();
                let events = controller.take_events();
                info!(
                    pid,
                    events = events.len(),
                    complete = finish.complete,
                    exit_code = ?finish.exit_code,
                    "engine run finished"
                );
                drop(home);
                Ok(RunOutcome {
                    events,
                    complete: finish.complete,
                    exit_code: finish.exit_code,
                    stderr,
                })
            }
            Err(err) => {
                if let Err(e) = handle.terminate().await {
                    warn!(pid, error = %e, "failed to reap engine");
                }
                controller.enter(RunPhase::Failed);
                let stderr = handle.stderr_output().await;
                warn!(
                    pid,
                    error = %err,
                    stderr = %String::from_utf8_lossy(&stderr),
                    "engine run failed"
                );
                Err(err.with_captured(reader.captured()))
            }
        }
    }
}

/// The guarded part of an invocation: write, read, shut down.
async fn drive(
    controller: &mut Controller,
    handle: &mut ProcessHandle,
    reader: &mut FrameReader<ChildStdout>,
    stdin: Option<ChildStdin>,
    input: Option<Vec<u8>>,
    short_read: ShortReadPolicy,
) -> Result<Finish> {
    controller.enter(RunPhase::Writing);
    if let Some(stdin) = stdin {
        match input {
            Some(bytes) => {
                if let Err(source) = write_input(stdin, &bytes).await {
                    // The engine usually stops reading because it failed;
                    // keep what it printed on the way out.
                    let drained = reader.drain().await;
                    debug!(drained, error = %source, "engine stopped reading its input");
                    return Err(HarnessError::Write {
                        source,
                        captured: reader.captured().to_vec(),
                    });
                }
                debug!(bytes = bytes.len(), "input written, stdin closed");
            }
            // Dropping stdin closes it.
            None => drop(stdin),
        }
    }

    controller.enter(RunPhase::Reading);
    match controller.collect(reader).await? {
        ReadEnd::Satisfied => {
            controller.enter(RunPhase::ShuttingDown);
            let status = controller.shutdown(handle).await?;
            Ok(Finish {
                complete: true,
                exit_code: status.and_then(|s| s.code()),
            })
        }
        ReadEnd::EndOfStream => {
            let expected = controller.counter().expected();
            let received = controller.counter().count();
            warn!(expected, received, "engine closed its output early");
            controller.enter(RunPhase::ShuttingDown);
            let status = controller.reap(handle).await?;
            match short_read {
                ShortReadPolicy::ReturnPartial => Ok(Finish {
                    complete: false,
                    exit_code: status.and_then(|s| s.code()),
                }),
                ShortReadPolicy::Error => Err(HarnessError::ShortRead {
                    expected,
                    events: controller.take_events(),
                }),
            }
        }
    }
}

#[async_trait]
impl FlowRunner for ProcessRunner {
    fn name(&self) -> &str {
        "process"
    }

    async fn run(&self, request: &RunRequest, cancel: CancellationToken) -> Result<RunOutcome> {
        let span = info_span!("run", run_id = %Uuid::new_v4(), engine = %self.command.program.display());
        self.invoke(request, cancel).instrument(span).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn runner_name_is_process() {
        assert_eq!(ProcessRunner::with_binary("edgelinkd").name(), "process");
    }

    #[test]
    fn runner_from_locator_uses_binary_path() {
        let locator = EngineLocator::new("/src/edgelink");
        let runner = ProcessRunner::from_locator(&locator);
        assert_eq!(runner.command().program, locator.binary_path());
        assert_eq!(runner.config(), &RunnerConfig::default());
    }

    #[test]
    fn prepare_home_writes_toml() {
        let runner = ProcessRunner::with_binary("edgelinkd");
        let req = RunRequest::flows(json!([]), vec![], 0).with_runtime_config(Some(json!({
            "runtime": {"context": {"default": "memory"}},
            "node": {"msg_queue_capacity": 1}
        })));
        let home = runner.prepare_home(&req).unwrap().expect("home dir");
        let text = std::fs::read_to_string(home.path().join(ENGINE_CONFIG_FILE)).unwrap();
        let parsed: toml::Value = toml::from_str(&text).unwrap();
        assert_eq!(parsed["node"]["msg_queue_capacity"].as_integer(), Some(1));
        assert_eq!(
            parsed["runtime"]["context"]["default"].as_str(),
            Some("memory")
        );
    }

    #[test]
    fn prepare_home_without_config_is_none() {
        let runner = ProcessRunner::with_binary("edgelinkd");
        let req = RunRequest::flows(json!([]), vec![], 0);
        assert!(runner.prepare_home(&req).unwrap().is_none());
    }

    #[test]
    fn prepare_home_rejects_non_object_config() {
        let runner = ProcessRunner::with_binary("edgelinkd");
        let req = RunRequest::flows(json!([]), vec![], 0).with_runtime_config(Some(json!([1, 2])));
        assert!(matches!(
            runner.prepare_home(&req),
            Err(HarnessError::Config(_))
        ));
    }

    #[tokio::test]
    async fn missing_engine_fails_with_launch_error() {
        let runner = ProcessRunner::with_binary("/nonexistent/path/to/edgelinkd");
        let req = RunRequest::flows(json!([]), vec![], 1);
        let err = runner.run(&req, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, HarnessError::Launch { .. }), "got {err:?}");
    }
}
