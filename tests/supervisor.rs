//! Integration tests for the supervisor lifecycle.
//!
//! These tests verify, with the null runtime and real processes:
//! - Output routing (order, merged stderr, empty lines dropped)
//! - Exit code propagation and the overall job exit code
//! - Spawn errors keeping the "not found" condition
//! - Cancellation of a running job from another thread, children included

use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use job_runtime::events::{LavaResults, LogSink};
use job_runtime::runtime::{RuntimeConfig, RuntimeKind, Supervisor};
use job_runtime::system::signal_exit_code;
use job_runtime::{Error, RuntimeError};

/// Sink collecting lines in memory.
#[derive(Clone, Default)]
struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    fn lines(&self) -> Vec<String> {
        self.lines.lock().expect("sink lock poisoned").clone()
    }
}

impl LogSink for MemorySink {
    fn write(&mut self, line: &str) -> io::Result<()> {
        self.lines
            .lock()
            .expect("sink lock poisoned")
            .push(line.to_string());
        Ok(())
    }
}

fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

/// Helper to create a prepared null-runtime supervisor.
fn prepared(sink: &MemorySink) -> Supervisor {
    let mut supervisor = Supervisor::new(RuntimeKind::Null, RuntimeConfig::default());
    supervisor
        .prepare(Box::new(sink.clone()), Box::new(LavaResults::new()), false)
        .expect("prepare should succeed for the null runtime");
    supervisor
        .add_bindings()
        .expect("null runtime accepts any binding set");
    supervisor
}

// =============================================================================
// Output Routing Tests
// =============================================================================

#[test]
fn test_lines_are_routed_in_order() {
    let sink = MemorySink::default();
    let mut supervisor = prepared(&sink);

    let code = supervisor
        .execute(&sh("echo one; echo; echo two 1>&2; echo three"))
        .expect("execute failed");

    assert_eq!(code, 0);
    assert_eq!(sink.lines(), vec!["one", "two", "three"]);
    supervisor.post_run();
    supervisor.cleanup();
}

#[test]
fn test_last_line_without_newline() {
    let sink = MemorySink::default();
    let mut supervisor = prepared(&sink);

    supervisor
        .execute(&sh("printf 'first\\nlast'"))
        .expect("execute failed");
    assert_eq!(sink.lines(), vec!["first", "last"]);
}

// =============================================================================
// Exit Code Tests
// =============================================================================

#[test]
fn test_process_exit_code_is_reported() {
    let sink = MemorySink::default();
    let mut supervisor = prepared(&sink);

    let code = supervisor.execute(&sh("exit 3")).expect("execute failed");
    assert_eq!(code, 3);
    assert_eq!(supervisor.exit_code(), 3);
    assert_eq!(supervisor.results_exit_code(), 0);
    assert_eq!(supervisor.job_exit_code(), 3);
}

#[test]
fn test_failed_result_raises_job_exit_code() {
    let sink = MemorySink::default();
    let mut supervisor = prepared(&sink);

    let line = r#"- {"lvl": "results", "msg": {"definition": "lava", "case": "boot", "result": "fail"}}"#;
    let code = supervisor
        .execute(&sh(&format!("echo '{line}'")))
        .expect("execute failed");

    assert_eq!(code, 0);
    assert_eq!(supervisor.results_exit_code(), 1);
    assert_eq!(supervisor.job_exit_code(), 1);
    assert_eq!(
        supervisor.results_data()["lava"]["boot"]["result"],
        serde_json::json!("fail")
    );
}

#[test]
fn test_exit_code_before_run_is_zero() {
    let supervisor = Supervisor::new(RuntimeKind::Null, RuntimeConfig::default());
    assert_eq!(supervisor.exit_code(), 0);
    assert_eq!(supervisor.job_exit_code(), 0);
}

// =============================================================================
// Error Tests
// =============================================================================

#[test]
fn test_missing_command_is_not_found() {
    let sink = MemorySink::default();
    let mut supervisor = prepared(&sink);

    let err = supervisor
        .execute(&["/nonexistent/job-runtime-missing".to_string()])
        .expect_err("spawning a missing binary should fail");

    match err {
        Error::Runtime(e) => assert!(e.is_not_found(), "unexpected error: {e}"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_use_after_cleanup() {
    let mut supervisor = Supervisor::new(RuntimeKind::Null, RuntimeConfig::default());
    supervisor.cleanup();
    supervisor.cleanup();

    let err = supervisor.add_bindings().expect_err("backend was released");
    assert!(matches!(err, Error::Runtime(RuntimeError::Released)));
}

// =============================================================================
// Cancellation Tests
// =============================================================================

#[test]
fn test_cancel_terminates_running_job() {
    let sink = MemorySink::default();
    let mut supervisor = prepared(&sink);
    let token = supervisor.cancel_token();

    let canceller = thread::spawn(move || {
        for _ in 0..500 {
            if token.is_armed() {
                return token.cancel();
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    });

    let code = supervisor
        .execute(&sh("echo started; exec sleep 30"))
        .expect("execute failed");

    assert!(canceller.join().expect("canceller panicked"));
    assert_eq!(code, signal_exit_code(15));
    assert_eq!(supervisor.cancel_token().delivered(), 1);
    assert!(!supervisor.cancel_token().is_armed());

    // Repeated cancellation after the job ended is a no-op
    assert!(!supervisor.cancel());
    assert_eq!(supervisor.cancel_token().delivered(), 1);
}

#[test]
fn test_cancel_stops_shell_wrapper_and_its_children() {
    let sink = MemorySink::default();
    let mut supervisor = prepared(&sink);
    let token = supervisor.cancel_token();

    let watched = sink.clone();
    let canceller = thread::spawn(move || {
        for _ in 0..500 {
            if token.is_armed() && watched.lines().iter().any(|l| l == "ready") {
                return token.cancel();
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    });

    let start = Instant::now();
    let code = supervisor
        .execute(&sh("echo ready; sleep 30; echo after"))
        .expect("execute failed");

    assert!(canceller.join().expect("canceller panicked"));
    assert!(
        start.elapsed() < Duration::from_secs(15),
        "job outlived cancellation: {:?}",
        start.elapsed()
    );
    assert_eq!(code, signal_exit_code(15));
    assert_eq!(sink.lines(), vec!["ready"]);
}
