//! Host process interface.
//!
//! Every interaction the runtime has with the operating system (calling the
//! backend CLI, spawning the job, starting the background service, polling
//! for files) goes through the [`Host`] trait so lifecycle logic can be
//! verified without real container tools installed.
//!
//! # Notes on output capture
//!
//! The primary process gets a single pipe for both stdout and stderr. Lines
//! are therefore delivered in the order the child wrote them, and reading one
//! stream can never deadlock on the other filling up. Both pipe ends are
//! close-on-exec, so only the job's own stdout and stderr hold the write end
//! and EOF arrives as soon as the job's process group is gone.
//!
//! # Process groups
//!
//! Every spawned process leads its own process group. Termination signals
//! are sent to the whole group, so a shell wrapper and its children stop
//! together.

use std::fs::File;
use std::io::Read;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::fcntl::OFlag;
use nix::unistd::{Pid, pipe2};
use tracing::{debug, instrument, trace};

/// Exit code reported for a process terminated by `signal`.
#[must_use]
pub fn signal_exit_code(signal: i32) -> i32 {
    128 + signal
}

/// Converts an [`ExitStatus`] to a shell-style exit code.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(signal_exit_code))
        .unwrap_or(1)
}

/// A process started through the [`Host`].
#[cfg_attr(test, mockall::automock)]
pub trait JobProcess: Send {
    /// OS process id, if the process is backed by a real OS process.
    fn id(&self) -> Option<u32>;

    /// Takes the combined output stream. Returns `None` on subsequent calls.
    fn take_output(&mut self) -> Option<Box<dyn Read + Send>>;

    /// Requests termination of the process group (SIGTERM).
    fn terminate(&mut self) -> std::io::Result<()>;

    /// Forcefully kills the process group (SIGKILL).
    fn kill(&mut self) -> std::io::Result<()>;

    /// Returns the exit code if the process has already exited.
    fn try_wait(&mut self) -> std::io::Result<Option<i32>>;

    /// Blocks until the process exits and returns its exit code.
    fn wait(&mut self) -> std::io::Result<i32>;
}

/// Operating-system facilities used by the runtime.
#[cfg_attr(test, mockall::automock)]
pub trait Host: Send + Sync {
    /// Runs a command to completion with inherited stdio and returns its exit code.
    fn status(&self, args: &[String]) -> std::io::Result<i32>;

    /// Spawns a command in its own process group with stdout and stderr
    /// merged into one readable stream.
    fn spawn(&self, args: &[String]) -> std::io::Result<Box<dyn JobProcess>>;

    /// Spawns a command in its own process group with all output discarded.
    fn spawn_detached(&self, args: &[String]) -> std::io::Result<Box<dyn JobProcess>>;

    /// Returns true if `path` exists.
    fn exists(&self, path: &Path) -> bool;

    /// Suspends the current thread.
    fn sleep(&self, duration: Duration);
}

/// Builds a [`Command`] from an argument vector.
fn command(args: &[String]) -> std::io::Result<Command> {
    let (program, rest) = args.split_first().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command line")
    })?;
    let mut cmd = Command::new(program);
    cmd.args(rest);
    Ok(cmd)
}

/// The real operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemHost;

impl SystemHost {
    /// Creates a new system host.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Host for SystemHost {
    #[instrument(skip(self), fields(program = args.first().map(String::as_str).unwrap_or_default()))]
    fn status(&self, args: &[String]) -> std::io::Result<i32> {
        trace!(?args, "Running command");
        let status = command(args)?.stdin(Stdio::null()).status()?;
        let code = exit_code(status);
        debug!(code, "Command completed");
        Ok(code)
    }

    fn spawn(&self, args: &[String]) -> std::io::Result<Box<dyn JobProcess>> {
        let mut cmd = command(args)?;

        let (reader, writer) = pipe2(OFlag::O_CLOEXEC).map_err(std::io::Error::from)?;
        let stderr_writer = writer.try_clone()?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(writer))
            .stderr(Stdio::from(stderr_writer))
            .process_group(0);

        let child = cmd.spawn()?;
        // Release our copies of the write end so EOF is seen once the child exits.
        drop(cmd);

        debug!(pid = child.id(), "Spawned job process");
        Ok(Box::new(SystemProcess {
            child,
            output: Some(Box::new(File::from(reader))),
        }))
    }

    fn spawn_detached(&self, args: &[String]) -> std::io::Result<Box<dyn JobProcess>> {
        let child = command(args)?
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()?;

        debug!(pid = child.id(), "Spawned detached process");
        Ok(Box::new(SystemProcess {
            child,
            output: None,
        }))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A [`JobProcess`] backed by [`std::process::Child`].
pub struct SystemProcess {
    child: Child,
    output: Option<Box<dyn Read + Send>>,
}

impl SystemProcess {
    /// Sends `signal` to the process group led by the child.
    fn signal_group(&mut self, signal: Signal) -> std::io::Result<()> {
        // A reaped pid may already belong to someone else
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        let group = Pid::from_raw(-(self.child.id() as i32));
        match kill(group, signal) {
            Ok(()) => Ok(()),
            // Already exited
            Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(std::io::Error::from(e)),
        }
    }
}

impl JobProcess for SystemProcess {
    fn id(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn take_output(&mut self) -> Option<Box<dyn Read + Send>> {
        self.output.take()
    }

    fn terminate(&mut self) -> std::io::Result<()> {
        self.signal_group(Signal::SIGTERM)
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.signal_group(Signal::SIGKILL)
    }

    fn try_wait(&mut self) -> std::io::Result<Option<i32>> {
        Ok(self.child.try_wait()?.map(exit_code))
    }

    fn wait(&mut self) -> std::io::Result<i32> {
        // Close our end of the output pipe first so a blocked writer gets EPIPE.
        self.output = None;
        Ok(exit_code(self.child.wait()?))
    }
}

impl std::fmt::Debug for SystemProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemProcess")
            .field("pid", &self.child.id())
            .field("output_taken", &self.output.is_none())
            .finish()
    }
}
