//! Error types for the job runtime.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich diagnostics.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the application.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Invalid bind-mount configuration
    #[error(transparent)]
    #[diagnostic(transparent)]
    Binding(#[from] BindingError),

    /// Container runtime failure
    #[error(transparent)]
    #[diagnostic(transparent)]
    Runtime(#[from] RuntimeError),

    /// I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(jobrun::io))]
    Io(#[from] std::io::Error),
}

/// Errors raised while validating bind-mount declarations.
///
/// These are configuration errors: they are detected before any process
/// starts and are never retried.
#[derive(Error, Debug, Diagnostic, Clone, PartialEq, Eq)]
pub enum BindingError {
    /// Two bindings share the same host path
    #[error("Duplicated mount source '{path}'")]
    #[diagnostic(
        code(jobrun::binding::duplicate_source),
        help("Each host path can only be bound once into the container")
    )]
    DuplicateSource { path: String },

    /// Two bindings share the same container path
    #[error("Duplicated mount destination '{path}'")]
    #[diagnostic(
        code(jobrun::binding::duplicate_destination),
        help("Each container path can only receive one binding")
    )]
    DuplicateDestination { path: String },

    /// A binding was declared after the set was applied to the backend
    #[error("Cannot bind '{path}': bindings were already applied")]
    #[diagnostic(
        code(jobrun::binding::sealed),
        help("Declare every binding (including pre-run ones) before add_bindings()")
    )]
    Sealed { path: String },

    /// The run was started while declared bindings were never applied
    #[error("{count} binding(s) declared but never applied")]
    #[diagnostic(
        code(jobrun::binding::not_applied),
        help("Call add_bindings() after the last bind() and before run()")
    )]
    NotApplied { count: usize },
}

/// Errors related to the container backend and the supervised processes.
#[derive(Error, Debug, Diagnostic)]
pub enum RuntimeError {
    /// The backend executable could not be located or launched
    #[error("Runtime not installed: {binary}")]
    #[diagnostic(
        code(jobrun::runtime::not_found),
        help("Install {binary} or select another runtime with --runtime")
    )]
    NotFound { binary: String },

    /// The helper service socket never appeared
    #[error("Unable to create {binary} socket at {}", path.display())]
    #[diagnostic(
        code(jobrun::runtime::socket_timeout),
        help("Check that `{binary} system service` can run for the current user")
    )]
    SocketTimeout {
        binary: String,
        path: PathBuf,
        attempts: u32,
    },

    /// A container backend was asked to run without an image
    #[error("No container image configured for {binary}")]
    #[diagnostic(code(jobrun::runtime::missing_image), help("Pass an image with --image"))]
    MissingImage { binary: String },

    /// A process could not be spawned
    #[error("Failed to spawn {command}: {source}")]
    #[diagnostic(code(jobrun::runtime::spawn))]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Waiting for a process failed
    #[error("Failed to wait for {command}: {source}")]
    #[diagnostic(code(jobrun::runtime::wait))]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The proxy wrapper script could not be rendered or written
    #[error("Failed to prepare proxy wrapper: {0}")]
    #[diagnostic(code(jobrun::runtime::wrapper))]
    Wrapper(String),

    /// Output was requested before a sink and a result tracker were recorded
    #[error("Runtime used before prepare()")]
    #[diagnostic(code(jobrun::runtime::not_prepared))]
    NotPrepared,

    /// Cancellation was requested before the job could start
    #[error("Job cancelled before start")]
    #[diagnostic(code(jobrun::runtime::cancelled))]
    Cancelled,

    /// A lifecycle step was invoked on a supervisor that was already cleaned up
    #[error("Runtime already cleaned up")]
    #[diagnostic(code(jobrun::runtime::released))]
    Released,
}

impl RuntimeError {
    /// Returns true if this error carries an OS "not found" condition.
    ///
    /// Spawn failures keep the underlying [`std::io::Error`] so callers can
    /// tell a missing executable apart from other launch problems.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Spawn { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
