//! `flowprobe run` and `flowprobe node`: drive the engine once and print
//! its events.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use flowprobe_core::flows::SUBJECT_NODE_ID;
use flowprobe_core::framing::injections_to;
use flowprobe_core::harness::{FlowRunner, RunOutcome, RunRequest};

use crate::config::ProbeConfig;

/// Exit code for a run that ended before the expected count under `--strict`.
pub const SHORT_READ_EXIT: u8 = 2;

#[derive(Debug, Clone)]
pub struct RunArgs {
    pub flows: PathBuf,
    pub injections: Option<PathBuf>,
    /// Default target for injections that are not already envelopes.
    pub node: String,
    pub expect: usize,
    pub from_file: bool,
    pub strict: bool,
    pub runtime_config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct NodeArgs {
    pub node: PathBuf,
    pub msgs: Option<PathBuf>,
    pub expect: usize,
    pub strict: bool,
    pub runtime_config: Option<PathBuf>,
}

fn read_json(path: &Path, what: &str) -> Result<Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {what} file {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("{what} file {} is not valid JSON", path.display()))
}

fn read_json_array(path: &Path, what: &str) -> Result<Vec<Value>> {
    match read_json(path, what)? {
        Value::Array(items) => Ok(items),
        _ => bail!("{what} file {} must contain a JSON array", path.display()),
    }
}

fn read_runtime_config(path: Option<&Path>) -> Result<Option<Value>> {
    path.map(|p| read_json(p, "runtime config")).transpose()
}

/// Build the request for `flowprobe run`.
pub fn build_run_request(args: &RunArgs) -> Result<RunRequest> {
    let request = if args.from_file {
        if args.injections.is_some() {
            bail!("--injections cannot be combined with --from-file");
        }
        RunRequest::flows_file(&args.flows, args.expect)
    } else {
        let flows = read_json(&args.flows, "flows")?;
        let payloads = match &args.injections {
            Some(path) => read_json_array(path, "injections")?,
            None => Vec::new(),
        };
        RunRequest::flows(flows, injections_to(&args.node, payloads), args.expect)
    };
    Ok(request.with_runtime_config(read_runtime_config(args.runtime_config.as_deref())?))
}

/// Build the request for `flowprobe node`.
pub fn build_node_request(args: &NodeArgs) -> Result<RunRequest> {
    let node = read_json(&args.node, "node")?;
    if !node.is_object() {
        bail!("node file {} must contain a JSON object", args.node.display());
    }
    let msgs = match &args.msgs {
        Some(path) => read_json_array(path, "messages")?,
        None => Vec::new(),
    };
    Ok(RunRequest::single_node(&node, msgs, args.expect)
        .with_runtime_config(read_runtime_config(args.runtime_config.as_deref())?))
}

/// Run the `run` command.
pub async fn run_flows(config: &ProbeConfig, args: &RunArgs) -> Result<ExitCode> {
    let request = build_run_request(args)?;
    execute(config, &request, args.strict).await
}

/// Run the `node` command.
pub async fn run_node(config: &ProbeConfig, args: &NodeArgs) -> Result<ExitCode> {
    let request = build_node_request(args)?;
    tracing::debug!(node = SUBJECT_NODE_ID, expected = request.expected, "running single node");
    execute(config, &request, args.strict).await
}

async fn execute(config: &ProbeConfig, request: &RunRequest, strict: bool) -> Result<ExitCode> {
    let runner = config.process_runner();

    // Ctrl-C cancels the run; the runner reaps the engine before returning.
    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let result = runner.run(request, cancel).await;
    watcher.abort();

    let outcome = result.with_context(|| format!("engine {} failed", config.engine.display()))?;
    print_events(&outcome)?;
    print_summary(request, &outcome);

    if strict && !outcome.complete {
        return Ok(ExitCode::from(SHORT_READ_EXIT));
    }
    Ok(ExitCode::SUCCESS)
}

fn print_events(outcome: &RunOutcome) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for event in &outcome.events {
        serde_json::to_writer(&mut out, event).context("failed to write event")?;
        out.write_all(b"\n").context("failed to write event")?;
    }
    out.flush().context("failed to flush stdout")
}

fn print_summary(request: &RunRequest, outcome: &RunOutcome) {
    let exit = match outcome.exit_code {
        Some(code) => code.to_string(),
        None => "none".to_string(),
    };
    if outcome.complete {
        eprintln!("{} of {} events (engine exit: {exit})", outcome.len(), request.expected);
    } else {
        eprintln!(
            "short read: {} of {} events before the engine closed its output (engine exit: {exit})",
            outcome.len(),
            request.expected
        );
    }
}
