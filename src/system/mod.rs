//! Operating-system plumbing.
//!
//! This module provides the process interface used by the runtime and the
//! signal-driven cancellation of the running job.

mod host;
mod signals;

pub use host::{Host, JobProcess, SystemHost, SystemProcess, signal_exit_code};
pub use signals::{CANCEL_SIGNALS, CancelToken, SignalBridge};

#[cfg(test)]
pub use host::{MockHost, MockJobProcess};
