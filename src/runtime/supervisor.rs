//! Supervisor for one job run.
//!
//! The [`Supervisor`] owns one backend instance and drives it through the
//! lifecycle:
//!
//! ```text
//! bind()* -> prepare() -> [pre_run()] -> add_bindings() -> run()/execute()
//!         -> [post_run()] -> cleanup()
//! ```
//!
//! While the primary process runs, its pid is published to a
//! [`CancelToken`] so a signal handler (see [`crate::system::SignalBridge`])
//! can terminate it. Dropping the supervisor runs `cleanup()`.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use super::backend::{Backend, RuntimeKind};
use super::bindings::BindingSet;
use super::config::RuntimeConfig;
use crate::error::{BindingError, Result, RuntimeError};
use crate::events::{EventDispatcher, LogSink, ResultTracker};
use crate::system::{CancelToken, Host, JobProcess, SystemHost};

/// Owns one backend instance and the processes it starts.
pub struct Supervisor {
    host: Arc<dyn Host>,
    kind: RuntimeKind,
    backend: Option<Backend>,
    bindings: BindingSet,
    sealed: bool,
    network: Option<String>,
    dispatcher: Option<EventDispatcher>,
    cancel: CancelToken,
    stop_grace: Duration,
    exit_code: Option<i32>,
}

/// Interval between exit checks while an abandoned job winds down.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

impl Supervisor {
    /// Creates a supervisor for `kind` on the real host.
    #[must_use]
    pub fn new(kind: RuntimeKind, config: RuntimeConfig) -> Self {
        Self::with_host(kind, config, Arc::new(SystemHost::new()))
    }

    /// Creates a supervisor for the runtime called `name`.
    ///
    /// Unknown names select the null runtime.
    #[must_use]
    pub fn select(name: &str, config: RuntimeConfig) -> Self {
        Self::new(RuntimeKind::select(name), config)
    }

    /// Creates a supervisor for `kind` using `host` for every OS interaction.
    ///
    /// The backend default bindings are declared immediately.
    #[instrument(skip(config, host))]
    pub fn with_host(kind: RuntimeKind, config: RuntimeConfig, host: Arc<dyn Host>) -> Self {
        let backend = Backend::new(kind, &config);
        let mut bindings = BindingSet::new();
        for binding in backend.default_bindings(host.as_ref(), &config) {
            bindings.push(binding);
        }

        Self {
            host,
            kind,
            backend: Some(backend),
            bindings,
            sealed: false,
            network: config.network,
            dispatcher: None,
            cancel: CancelToken::new(),
            stop_grace: config.stop_grace,
            exit_code: None,
        }
    }

    /// The runtime kind.
    #[must_use]
    pub fn kind(&self) -> RuntimeKind {
        self.kind
    }

    fn backend(&self) -> std::result::Result<&Backend, RuntimeError> {
        self.backend.as_ref().ok_or(RuntimeError::Released)
    }

    fn backend_mut(&mut self) -> std::result::Result<&mut Backend, RuntimeError> {
        self.backend.as_mut().ok_or(RuntimeError::Released)
    }

    /// Sets the container image.
    pub fn set_image(&mut self, image: impl Into<String>) {
        if let Some(backend) = self.backend.as_mut() {
            backend.set_image(image);
        }
    }

    /// The container image.
    #[must_use]
    pub fn image(&self) -> Option<&str> {
        self.backend.as_ref().and_then(Backend::image)
    }

    /// Sets the network the container joins. Applied by `prepare()`.
    pub fn set_network(&mut self, network: impl Into<String>) {
        self.network = Some(network.into());
    }

    /// The network the container joins.
    #[must_use]
    pub fn network(&self) -> Option<&str> {
        self.backend
            .as_ref()
            .and_then(Backend::network)
            .or(self.network.as_deref())
    }

    /// Sets the container name.
    pub fn set_name(&mut self, name: impl Into<String>) {
        if let Some(backend) = self.backend.as_mut() {
            backend.set_name(name);
        }
    }

    /// Declares a binding. `destination` defaults to `source`.
    ///
    /// # Errors
    ///
    /// Returns `BindingError::Sealed` once `add_bindings()` was called.
    pub fn bind(
        &mut self,
        source: impl AsRef<Path>,
        destination: Option<&str>,
        read_only: bool,
        device: bool,
    ) -> std::result::Result<(), BindingError> {
        if self.sealed {
            return Err(BindingError::Sealed {
                path: source.as_ref().display().to_string(),
            });
        }
        self.bindings.add(source, destination, read_only, device);
        Ok(())
    }

    /// Declared bindings, in declaration order.
    #[must_use]
    pub fn bindings(&self) -> &BindingSet {
        &self.bindings
    }

    /// Records the output destinations and warms the backend up.
    ///
    /// Propagates the configured network and disables extra `run` options
    /// from the environment.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::NotFound` if the backend executable is missing.
    pub fn prepare(
        &mut self,
        sink: Box<dyn LogSink>,
        results: Box<dyn ResultTracker>,
        hacking_session: bool,
    ) -> Result<()> {
        self.prepare_with(EventDispatcher::new(sink, results).with_hacking_session(hacking_session))
    }

    /// Same as [`Supervisor::prepare`] with a fully configured dispatcher.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::NotFound` if the backend executable is missing.
    #[instrument(skip(self, dispatcher), fields(runtime = %self.kind))]
    pub fn prepare_with(&mut self, dispatcher: EventDispatcher) -> Result<()> {
        self.dispatcher = Some(dispatcher);

        let network = self.network.clone();
        let host = Arc::clone(&self.host);
        let backend = self.backend_mut()?;
        backend.set_network(network);
        backend.set_allow_user_opts(false);
        backend.prepare(host.as_ref())?;
        debug!("Runtime prepared");
        Ok(())
    }

    /// Runs the backend bootstrap and declares the bindings it needs.
    ///
    /// # Errors
    ///
    /// Returns `BindingError::Sealed` after `add_bindings()`, or the backend
    /// bootstrap error.
    #[instrument(skip(self), fields(runtime = %self.kind))]
    pub fn pre_run(&mut self, workdir: &Path) -> Result<()> {
        if self.sealed {
            return Err(BindingError::Sealed {
                path: workdir.display().to_string(),
            }
            .into());
        }

        let host = Arc::clone(&self.host);
        let bindings = self.backend_mut()?.pre_run(host.as_ref(), workdir)?;
        for binding in bindings {
            self.bindings.push(binding);
        }
        Ok(())
    }

    /// Validates the declared bindings and applies them to the backend.
    ///
    /// # Errors
    ///
    /// Returns a `BindingError` on duplicate sources or destinations, in
    /// which case nothing is applied.
    #[instrument(skip(self), fields(runtime = %self.kind, count = self.bindings.len()))]
    pub fn add_bindings(&mut self) -> Result<()> {
        let backend = self.backend.as_mut().ok_or(RuntimeError::Released)?;
        backend.add_bindings(&self.bindings)?;
        self.sealed = true;
        Ok(())
    }

    /// Starts the primary process.
    ///
    /// # Errors
    ///
    /// - `BindingError::NotApplied` if bindings were declared but not applied
    /// - `RuntimeError::Cancelled` if cancellation was already requested
    /// - `RuntimeError::Spawn` if the process cannot be started
    pub fn run(&mut self, args: &[String]) -> Result<RunningJob<'_>> {
        let process = self.spawn(args)?;
        Ok(RunningJob::new(
            process,
            &self.cancel,
            self.stop_grace,
            &mut self.exit_code,
        ))
    }

    #[instrument(skip(self, args), fields(runtime = %self.kind))]
    fn spawn(&mut self, args: &[String]) -> Result<Box<dyn JobProcess>> {
        if !self.sealed && self.kind.is_container() && !self.bindings.is_empty() {
            return Err(BindingError::NotApplied {
                count: self.bindings.len(),
            }
            .into());
        }
        if self.cancel.is_cancelled() {
            warn!("Cancellation requested before start, not running the job");
            return Err(RuntimeError::Cancelled.into());
        }

        let process = self.backend()?.spawn(self.host.as_ref(), args)?;
        if let Some(pid) = process.id() {
            self.cancel.arm(pid);
            // A request that landed between the check above and arming found no pid
            if self.cancel.is_cancelled() {
                warn!(pid, "Cancellation requested during start, terminating the job");
                self.cancel.cancel();
            }
        }
        info!(pid = ?process.id(), "Job started");
        Ok(process)
    }

    /// Runs `args` to completion, routing every output line.
    ///
    /// Returns the primary process exit code.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::NotPrepared` without a prior `prepare()`, any
    /// `run()` error, or a sink write error. The process is reaped in all
    /// cases.
    #[instrument(skip(self, args), fields(runtime = %self.kind))]
    pub fn execute(&mut self, args: &[String]) -> Result<i32> {
        if self.dispatcher.is_none() {
            return Err(RuntimeError::NotPrepared.into());
        }

        let process = self.spawn(args)?;
        let dispatcher = self
            .dispatcher
            .as_mut()
            .ok_or(RuntimeError::NotPrepared)?;

        let mut job = RunningJob::new(process, &self.cancel, self.stop_grace, &mut self.exit_code);
        for line in job.lines() {
            dispatcher.dispatch(&line?)?;
        }
        job.finish()
    }

    /// Requests termination of the primary process, if running.
    ///
    /// Safe to call at any time and any number of times.
    pub fn cancel(&self) -> bool {
        self.cancel.cancel()
    }

    /// Token that cancels this supervisor's primary process.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Exit code of the primary process, 0 if it never ran.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.exit_code.unwrap_or(0)
    }

    /// Exit code derived from the recorded results, 0 before `prepare()`.
    #[must_use]
    pub fn results_exit_code(&self) -> i32 {
        self.dispatcher
            .as_ref()
            .map_or(0, |d| d.results().exit_code())
    }

    /// Overall job exit code: the worse of the process and results codes.
    #[must_use]
    pub fn job_exit_code(&self) -> i32 {
        self.exit_code().max(self.results_exit_code())
    }

    /// Recorded results as JSON, `null` before `prepare()`.
    #[must_use]
    pub fn results_data(&self) -> serde_json::Value {
        self.dispatcher
            .as_ref()
            .map_or(serde_json::Value::Null, |d| d.results().data())
    }

    /// Runs the backend teardown. Never fails.
    pub fn post_run(&mut self) {
        if let Some(backend) = self.backend.as_mut() {
            backend.post_run(self.host.as_ref());
        }
    }

    /// Releases the backend instance. Idempotent.
    pub fn cleanup(&mut self) {
        self.cancel.disarm();
        if let Some(mut backend) = self.backend.take() {
            backend.release(self.host.as_ref());
            debug!(runtime = %self.kind, "Runtime released");
        }
    }

    /// Returns true once `cleanup()` ran.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.backend.is_none()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("kind", &self.kind)
            .field("backend", &self.backend)
            .field("bindings", &self.bindings.len())
            .field("sealed", &self.sealed)
            .field("exit_code", &self.exit_code)
            .finish_non_exhaustive()
    }
}

/// The running primary process.
///
/// Dropping it without calling [`RunningJob::finish`] stops and reaps the
/// process: SIGTERM first, SIGKILL once the stop grace period runs out.
pub struct RunningJob<'a> {
    process: Box<dyn JobProcess>,
    output: Option<Box<dyn Read + Send>>,
    cancel: &'a CancelToken,
    stop_grace: Duration,
    exit_code: &'a mut Option<i32>,
    finished: bool,
}

impl<'a> RunningJob<'a> {
    fn new(
        mut process: Box<dyn JobProcess>,
        cancel: &'a CancelToken,
        stop_grace: Duration,
        exit_code: &'a mut Option<i32>,
    ) -> Self {
        let output = process.take_output();
        Self {
            process,
            output,
            cancel,
            stop_grace,
            exit_code,
            finished: false,
        }
    }

    /// Returns true once the process has exited or can no longer be polled.
    fn has_exited(&mut self) -> bool {
        !matches!(self.process.try_wait(), Ok(None))
    }

    /// Terminates a process that is still running.
    ///
    /// The container CLI forwards SIGTERM to the container but cannot
    /// forward SIGKILL, so the job gets `stop_grace` to exit on its own.
    fn stop(&mut self) {
        if self.has_exited() {
            return;
        }

        debug!(pid = ?self.process.id(), "Terminating unfinished job");
        if let Err(e) = self.process.terminate() {
            warn!(error = %e, "Failed to terminate job");
        }

        let deadline = Instant::now() + self.stop_grace;
        while !self.has_exited() {
            let now = Instant::now();
            if now >= deadline {
                warn!(pid = ?self.process.id(), grace = ?self.stop_grace, "Job ignored SIGTERM, killing it");
                if let Err(e) = self.process.kill() {
                    warn!(error = %e, "Failed to kill job");
                }
                return;
            }
            thread::sleep(STOP_POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Pid of the primary process.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.process.id()
    }

    /// Output lines, stdout and stderr merged, without line terminators.
    ///
    /// The stream can be consumed once; later calls yield nothing.
    pub fn lines(&mut self) -> OutputLines {
        OutputLines {
            reader: self.output.take().map(BufReader::new),
        }
    }

    /// Waits for the process and records its exit code.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Wait` if the process cannot be waited for.
    pub fn finish(mut self) -> Result<i32> {
        self.finished = true;
        self.output = None;
        let result = self.process.wait();
        self.cancel.disarm();

        let code = result.map_err(|source| RuntimeError::Wait {
            command: "job".to_string(),
            source,
        })?;
        *self.exit_code = Some(code);
        info!(code, "Job exited");
        Ok(code)
    }
}

impl Drop for RunningJob<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        self.output = None;
        self.cancel.disarm();
        self.stop();
        match self.process.wait() {
            Ok(code) => *self.exit_code = Some(code),
            Err(e) => warn!(error = %e, "Failed to reap job"),
        }
    }
}

/// Iterator over output lines of a [`RunningJob`].
pub struct OutputLines {
    reader: Option<BufReader<Box<dyn Read + Send>>>,
}

impl Iterator for OutputLines {
    type Item = std::io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader.as_mut()?;
        let mut buf = Vec::new();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => {
                self.reader = None;
                None
            }
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                Some(Ok(String::from_utf8_lossy(&buf).into_owned()))
            }
            Err(e) => {
                self.reader = None;
                Some(Err(e))
            }
        }
    }
}
