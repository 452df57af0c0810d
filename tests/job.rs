//! Integration tests for the end-to-end job driver.
//!
//! These tests verify:
//! - The work directory is created under the base directory and removed
//! - The results file is written with the recorded results
//! - The overall exit code combines process and results
//! - Teardown happens when the job cannot start

use std::fs;
use std::io;
use std::sync::{Arc, Mutex};

use job_runtime::events::{LavaResults, LogSink};
use job_runtime::job::{Job, JobConfig};
use job_runtime::runtime::RuntimeKind;
use tempfile::TempDir;

#[derive(Clone, Default)]
struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
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

fn null_job(script: &str) -> JobConfig {
    JobConfig::new(vec!["sh".to_string(), "-c".to_string(), script.to_string()])
        .with_runtime(RuntimeKind::Null)
}

/// Asserts that `dir` contains no entry left behind by a job.
fn assert_no_workdir(dir: &TempDir) {
    let leftovers: Vec<_> = fs::read_dir(dir.path())
        .expect("failed to list base dir")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name())
        .filter(|name| name.to_string_lossy().starts_with("jobrun-"))
        .collect();
    assert!(leftovers.is_empty(), "work directories left: {leftovers:?}");
}

#[test]
fn test_job_runs_and_removes_workdir() {
    let base = TempDir::new().expect("failed to create temp dir");
    let sink = MemorySink::default();

    let outcome = Job::new(null_job("echo hello; pwd >/dev/null"))
        .with_base_dir(base.path())
        .run_with(Box::new(sink.clone()), Box::new(LavaResults::new()))
        .expect("job failed");

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.process_exit_code, 0);
    assert_eq!(*sink.lines.lock().unwrap(), vec!["hello"]);
    assert_no_workdir(&base);
}

#[test]
fn test_job_exit_code_is_max_of_process_and_results() {
    let base = TempDir::new().expect("failed to create temp dir");
    let results_file = base.path().join("results.json");
    let script = concat!(
        r#"echo '- {"lvl": "results", "msg": {"definition": "lava", "case": "boot", "result": "fail"}}'; "#,
        "exit 2"
    );

    let outcome = Job::new(null_job(script).with_results_file(&results_file))
        .with_base_dir(base.path())
        .run_with(Box::new(MemorySink::default()), Box::new(LavaResults::new()))
        .expect("job failed");

    assert_eq!(outcome.process_exit_code, 2);
    assert_eq!(outcome.results_exit_code, 1);
    assert_eq!(outcome.exit_code, 2);

    let written: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&results_file).expect("results file missing"))
            .expect("results file is not JSON");
    assert_eq!(written, serde_json::json!({"lava": {"boot": {"result": "fail"}}}));
}

#[test]
fn test_log_file_receives_output() {
    let base = TempDir::new().expect("failed to create temp dir");
    let log_file = base.path().join("job.log");

    let outcome = Job::new(null_job("echo one; echo two").with_log_file(&log_file))
        .with_base_dir(base.path())
        .run()
        .expect("job failed");

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(
        fs::read_to_string(&log_file).expect("log file missing"),
        "one\ntwo\n"
    );
}

#[test]
fn test_workdir_removed_when_job_cannot_start() {
    let base = TempDir::new().expect("failed to create temp dir");
    let config = JobConfig::new(vec!["/nonexistent/job-runtime-missing".to_string()])
        .with_runtime(RuntimeKind::Null);

    let result = Job::new(config)
        .with_base_dir(base.path())
        .run_with(Box::new(MemorySink::default()), Box::new(LavaResults::new()));

    assert!(result.is_err());
    assert_no_workdir(&base);
}
