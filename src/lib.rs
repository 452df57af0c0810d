//! Job Runtime - Run test jobs inside container runtimes.
//!
//! This crate runs a job command either on the host or inside a Docker or
//! Podman container, streams its combined output to a log sink and a result
//! tracker, and releases every resource it created on every exit path,
//! including termination by a signal.
//!
//! # Platform Requirements
//!
//! - Linux (signals, process groups, Unix sockets)
//! - `docker` or `podman` in `PATH` for the container runtimes
//!
//! # Example
//!
//! ```no_run
//! use job_runtime::job::{Job, JobConfig};
//! use job_runtime::runtime::RuntimeKind;
//!
//! fn main() -> miette::Result<()> {
//!     let config = JobConfig::new(vec!["lava-run".to_string(), "job.yaml".to_string()])
//!         .with_runtime(RuntimeKind::Podman)
//!         .with_results_file("results.json");
//!
//!     let outcome = Job::new(config).run()?;
//!     std::process::exit(outcome.exit_code);
//! }
//! ```

pub mod error;
pub mod events;
pub mod job;
pub mod runtime;
pub mod system;

// Re-export commonly used types
pub use error::{BindingError, Error, Result, RuntimeError};
pub use job::{Job, JobConfig, JobOutcome};
pub use runtime::{RuntimeConfig, RuntimeKind, Supervisor};
