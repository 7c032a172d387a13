//! End-to-end tests for `ProcessRunner` against scripted fake engines.
//!
//! Every fake engine is a `/bin/sh` script from `flowprobe-test-utils`, so
//! these only run on unix.

#![cfg(unix)]

use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use flowprobe_core::error::{HarnessError, TimeoutKind};
use flowprobe_core::framing::{Injection, injections_to};
use flowprobe_core::harness::{
    FlowRunner, ProcessRunner, RunPhase, RunRequest, RunnerConfig, ShortReadPolicy,
};
use flowprobe_test_utils::{Ending, FakeEngine, frames, process_alive};

// ===========================================================================
// Helpers
// ===========================================================================

fn fast_config() -> RunnerConfig {
    RunnerConfig {
        read_timeout: Duration::from_secs(5),
        deadline: Duration::from_secs(10),
        grace: Duration::from_secs(2),
        short_read: ShortReadPolicy::ReturnPartial,
    }
}

fn runner_for(engine: &FakeEngine) -> ProcessRunner {
    ProcessRunner::with_binary(engine.path()).with_config(fast_config())
}

fn request(expected: usize) -> RunRequest {
    RunRequest::flows(json!([{"id": "0", "type": "tab"}]), vec![], expected)
}

fn assert_reaped(engine: &FakeEngine) {
    let pid = engine.recorded_pid().expect("engine never recorded its pid");
    assert!(!process_alive(pid), "engine {pid} is still running");
}

// ===========================================================================
// Framing scenarios
// ===========================================================================

#[tokio::test]
async fn frame_split_across_reads_is_reassembled() {
    let engine = FakeEngine::script(
        "trap 'exit 0' INT\n\
         cat > /dev/null\n\
         printf 'noise\\036'\n\
         sleep 0.2\n\
         printf '{\"payload\":1}\\n'\n\
         while :; do sleep 0.05; done\n",
    );
    let outcome = runner_for(&engine)
        .run(&request(1), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.events, vec![json!({"payload": 1})]);
    assert!(outcome.complete);
}

#[tokio::test]
async fn two_frames_in_one_write() {
    let engine = FakeEngine::emitting(&[json!({"a": 1}), json!({"a": 2})]);
    let outcome = runner_for(&engine)
        .run(&request(2), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.events, vec![json!({"a": 1}), json!({"a": 2})]);
    assert!(outcome.complete);
    assert_eq!(outcome.exit_code, Some(0));
    assert_reaped(&engine);
}

#[tokio::test]
async fn injections_reach_the_engine_in_order() {
    let engine = FakeEngine::echo();
    let injections = vec![
        Injection::new("1", json!({"nid": "1", "msg": {"payload": "x"}})),
        Injection::new("1", json!({"payload": "y"})),
    ];
    let flows = json!([{"id": "0", "type": "tab"}]);
    let req = RunRequest::flows(flows.clone(), injections, 2);

    let outcome = runner_for(&engine)
        .run(&req, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        outcome.events,
        vec![
            json!({"nid": "1", "msg": {"payload": "x"}}),
            json!({"nid": "1", "msg": {"payload": "y"}}),
        ]
    );
    // The flows frame always goes first.
    let stdin = engine.recorded_stdin();
    let first_line = stdin.split(|b| *b == b'\n').next().unwrap();
    assert_eq!(first_line[0], 0x1E);
    assert_eq!(
        serde_json::from_slice::<Value>(&first_line[1..]).unwrap(),
        flows
    );
}

#[tokio::test]
async fn engine_args_select_stdin_mode() {
    let engine = FakeEngine::emitting(&[json!({})]);
    runner_for(&engine)
        .run(&request(1), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(engine.recorded_args(), vec!["-v", "0", "--stdin"]);
}

// ===========================================================================
// Completion
// ===========================================================================

#[tokio::test]
async fn stops_at_expected_count() {
    let mut output = frames(&[json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]);
    output.extend_from_slice(b"\x1e{broken\n");
    let engine = FakeEngine::new(&output, Ending::AwaitInterrupt);

    let outcome = runner_for(&engine)
        .run(&request(2), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.events, vec![json!({"n": 1}), json!({"n": 2})]);
    assert!(outcome.complete);
}

#[tokio::test]
async fn zero_expected_returns_immediately() {
    let engine = FakeEngine::emitting(&[]);
    let outcome = runner_for(&engine)
        .run(&request(0), CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.is_empty());
    assert!(outcome.complete);
    assert_reaped(&engine);
}

#[tokio::test]
async fn short_read_returns_partial_by_default() {
    let engine = FakeEngine::new(&frames(&[json!({"n": 1})]), Ending::Exit(3));
    let outcome = runner_for(&engine)
        .run(&request(3), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.events, vec![json!({"n": 1})]);
    assert!(!outcome.complete);
    assert_eq!(outcome.exit_code, Some(3));
}

#[tokio::test]
async fn short_read_can_be_an_error() {
    let engine = FakeEngine::new(&frames(&[json!({"n": 1})]), Ending::Exit(0));
    let runner = ProcessRunner::with_binary(engine.path()).with_config(RunnerConfig {
        short_read: ShortReadPolicy::Error,
        ..fast_config()
    });

    let err = runner
        .run(&request(3), CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        HarnessError::ShortRead { expected, events } => {
            assert_eq!(expected, 3);
            assert_eq!(events, vec![json!({"n": 1})]);
        }
        other => panic!("expected short read, got {other:?}"),
    }
}

#[tokio::test]
async fn stderr_is_kept_for_diagnostics() {
    let engine = FakeEngine::emitting(&[json!({})]);
    let outcome = runner_for(&engine)
        .run(&request(1), CancellationToken::new())
        .await
        .unwrap();

    assert!(
        outcome.stderr.contains("fake engine starting"),
        "stderr was {:?}",
        outcome.stderr
    );
}

// ===========================================================================
// Failures
// ===========================================================================

#[tokio::test]
async fn read_timeout_kills_the_engine() {
    let engine = FakeEngine::new(&frames(&[json!({"n": 1})]), Ending::Hang);
    let runner = ProcessRunner::with_binary(engine.path()).with_config(RunnerConfig {
        read_timeout: Duration::from_millis(300),
        ..fast_config()
    });

    let err = runner
        .run(&request(2), CancellationToken::new())
        .await
        .unwrap_err();
    match &err {
        HarnessError::Timeout { kind, phase, .. } => {
            assert_eq!(*kind, TimeoutKind::Read);
            assert_eq!(*phase, RunPhase::Reading);
        }
        other => panic!("expected read timeout, got {other:?}"),
    }
    assert_eq!(err.captured(), Some(&b"\x1e{\"n\":1}\n"[..]));
    assert_reaped(&engine);
}

#[tokio::test]
async fn deadline_bounds_the_whole_invocation() {
    let engine = FakeEngine::silent();
    let runner = ProcessRunner::with_binary(engine.path()).with_config(RunnerConfig {
        read_timeout: Duration::from_secs(20),
        ..fast_config()
    });
    let req = request(1).with_deadline(Duration::from_millis(400));

    let started = std::time::Instant::now();
    let err = runner.run(&req, CancellationToken::new()).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));

    match err {
        HarnessError::Timeout { kind, .. } => assert_eq!(kind, TimeoutKind::Deadline),
        other => panic!("expected deadline timeout, got {other:?}"),
    }
    assert_reaped(&engine);
}

#[tokio::test]
async fn malformed_frame_is_a_decode_error() {
    let engine = FakeEngine::new(b"starting\n\x1e{not json}\n", Ending::AwaitInterrupt);
    let err = runner_for(&engine)
        .run(&request(1), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, HarnessError::Decode { .. }), "got {err:?}");
    assert_eq!(err.captured(), Some(&b"starting\n\x1e{not json}\n"[..]));
    assert_reaped(&engine);
}

#[tokio::test]
async fn missing_engine_is_a_launch_error() {
    let runner = ProcessRunner::with_binary("/nonexistent/flowprobe/edgelinkd");
    let err = runner
        .run(&request(1), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::Launch { .. }), "got {err:?}");
}

#[tokio::test]
async fn engine_ignoring_interrupt_is_killed() {
    let engine = FakeEngine::new(&frames(&[json!({"n": 1})]), Ending::IgnoreInterrupt);
    let runner = ProcessRunner::with_binary(engine.path()).with_config(RunnerConfig {
        grace: Duration::from_millis(300),
        ..fast_config()
    });

    let err = runner
        .run(&request(1), CancellationToken::new())
        .await
        .unwrap_err();
    match &err {
        HarnessError::ShutdownTimeout { grace, events } => {
            assert_eq!(*grace, Duration::from_millis(300));
            assert_eq!(events, &vec![json!({"n": 1})]);
        }
        other => panic!("expected shutdown timeout, got {other:?}"),
    }
    assert_reaped(&engine);
}

#[tokio::test]
async fn cancellation_kills_the_engine() {
    let engine = FakeEngine::silent();
    let runner = runner_for(&engine);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let err = runner.run(&request(1), cancel).await.unwrap_err();
    match err {
        HarnessError::Cancelled { phase, .. } => assert_eq!(phase, RunPhase::Reading),
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert_reaped(&engine);
}

#[tokio::test]
async fn write_failure_keeps_what_the_engine_printed() {
    // Dies without reading stdin, so a large input hits a broken pipe.
    let engine = FakeEngine::script("printf 'fatal: bad flows\\036{\"err\":1}\\n'\nexit 1\n");
    let big = Injection::new("1", json!({"payload": "x".repeat(4 << 20)}));
    let req = RunRequest::flows(json!([]), vec![big], 1);

    let err = runner_for(&engine)
        .run(&req, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, HarnessError::Write { .. }), "got {err:?}");
    assert_eq!(
        err.captured(),
        Some(&b"fatal: bad flows\x1e{\"err\":1}\n"[..])
    );
    assert_reaped(&engine);
}

#[tokio::test]
async fn dropped_run_future_reaps_the_engine() {
    let engine = FakeEngine::silent();
    let runner = runner_for(&engine);
    let req = request(1);

    let outer = tokio::time::timeout(
        Duration::from_millis(500),
        runner.run(&req, CancellationToken::new()),
    )
    .await;

    assert!(outer.is_err(), "run finished before the outer timeout");
    assert_reaped(&engine);
}

#[tokio::test]
async fn deadline_counts_from_the_start_of_the_invocation() {
    // Spent before the engine is even up; still reported as a deadline.
    let engine = FakeEngine::emitting(&[json!({"n": 1})]);
    let req = request(1).with_deadline(Duration::from_nanos(1));

    let err = runner_for(&engine)
        .run(&req, CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        HarnessError::Timeout { kind, after, .. } => {
            assert_eq!(kind, TimeoutKind::Deadline);
            assert_eq!(after, Duration::from_nanos(1));
        }
        other => panic!("expected deadline timeout, got {other:?}"),
    }
}

// ===========================================================================
// Inputs and configuration
// ===========================================================================

#[tokio::test]
async fn flows_file_mode_writes_nothing_to_stdin() {
    let engine = FakeEngine::emitting(&[json!({"payload": "from file"})]);
    let flows_dir = tempfile::tempdir().unwrap();
    let flows_path = flows_dir.path().join("flows.json");
    std::fs::write(&flows_path, "[]").unwrap();

    let outcome = runner_for(&engine)
        .run(&RunRequest::flows_file(&flows_path, 1), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.events, vec![json!({"payload": "from file"})]);
    assert!(engine.recorded_stdin().is_empty());
    assert_eq!(
        engine.recorded_args(),
        vec!["-v", "0", "-f", flows_path.to_str().unwrap()]
    );
}

#[tokio::test]
async fn runtime_config_is_passed_through_home() {
    let engine = FakeEngine::emitting(&[json!({})]);
    let req = request(1).with_runtime_config(Some(json!({
        "node": {"msg_queue_capacity": 1}
    })));

    runner_for(&engine)
        .run(&req, CancellationToken::new())
        .await
        .unwrap();

    let args = engine.recorded_args();
    assert_eq!(args.get(3).map(String::as_str), Some("--home"));
    let config: toml::Value = toml::from_str(&engine.recorded_home_config().unwrap()).unwrap();
    assert_eq!(config["node"]["msg_queue_capacity"].as_integer(), Some(1));
    // The private home is gone once the run is over.
    assert!(!std::path::Path::new(&args[4]).exists());
}

#[tokio::test]
async fn non_object_runtime_config_fails_before_launch() {
    let engine = FakeEngine::emitting(&[json!({})]);
    let req = request(1).with_runtime_config(Some(json!("not a table")));

    let err = runner_for(&engine)
        .run(&req, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::Config(_)), "got {err:?}");
    assert_eq!(engine.recorded_pid(), None);
}

#[tokio::test]
async fn single_node_request_targets_node_one() {
    let engine = FakeEngine::echo();
    let req = RunRequest::single_node(
        &json!({"type": "change"}),
        [json!({"payload": 1}), json!({"payload": 2})],
        2,
    );

    let outcome = runner_for(&engine)
        .run(&req, CancellationToken::new())
        .await
        .unwrap();

    let targets: Vec<&str> = outcome
        .events
        .iter()
        .filter_map(|e| e["nid"].as_str())
        .collect();
    assert_eq!(targets, vec!["1", "1"]);
}

#[tokio::test]
async fn run_once_with_inject_matches_run() {
    let engine = FakeEngine::echo();
    let runner = runner_for(&engine);
    let events = runner
        .run_once_with_inject(
            1,
            Duration::from_secs(5),
            json!([]),
            injections_to("7", [json!({"payload": true})]),
            None,
        )
        .await
        .unwrap();
    assert_eq!(events, vec![json!({"nid": "7", "msg": {"payload": true}})]);
}

// ===========================================================================
// Isolation
// ===========================================================================

#[tokio::test]
async fn parallel_invocations_do_not_share_state() {
    let engines: Vec<FakeEngine> = (0..6).map(|_| FakeEngine::echo()).collect();
    let runs = engines.iter().enumerate().map(|(i, engine)| async move {
        let req = RunRequest::flows(
            json!([]),
            injections_to("1", [json!({"payload": i})]),
            1,
        );
        runner_for(engine).run(&req, CancellationToken::new()).await
    });

    let results = futures::future::join_all(runs).await;
    for (i, result) in results.into_iter().enumerate() {
        let outcome = result.unwrap();
        assert_eq!(outcome.events, vec![json!({"nid": "1", "msg": {"payload": i}})]);
    }
    for engine in &engines {
        assert_reaped(engine);
    }
}

#[tokio::test]
async fn runner_is_usable_as_trait_object() {
    let engine = FakeEngine::emitting(&[json!({"ok": true})]);
    let runner: Box<dyn FlowRunner> = Box::new(runner_for(&engine));
    assert_eq!(runner.name(), "process");
    let outcome = runner
        .run(&request(1), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.events, vec![json!({"ok": true})]);
}
