//! End-to-end job driver.
//!
//! A [`Job`] creates a private work directory, configures a [`Supervisor`]
//! for the selected runtime, runs the command while routing its output, and
//! always tears everything down before returning the overall exit code.

mod workdir;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::events::{LavaResults, LogSink, LogWriter, ResultTracker};
use crate::runtime::{RuntimeConfig, RuntimeKind, Supervisor};
use crate::system::{Host, SignalBridge, SystemHost};

pub use workdir::{DISPATCHER_TMP_MOUNT_POINT, JobWorkDir, WORKDIR_PREFIX};

/// Image used when none is given.
pub const DEFAULT_IMAGE: &str = "docker.io/lavasoftware/lava-dispatcher:latest";

/// URL scheme of arguments naming local files.
const FILE_SCHEME: &str = "file://";

/// Returns the local path named by a `file://` URL.
#[must_use]
pub fn file_url_path(arg: &str) -> Option<&str> {
    arg.strip_prefix(FILE_SCHEME).filter(|path| !path.is_empty())
}

/// What to run and where.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Runtime to run the command with.
    pub runtime: RuntimeKind,
    /// Container image.
    pub image: Option<String>,
    /// Command and arguments.
    pub command: Vec<String>,
    /// Extra artifacts; `file://` ones are bound read-only.
    pub assets: Vec<String>,
    /// Run the backend pre-run step so the job can start nested containers.
    pub docker_proxy: bool,
    /// Open a terminal when the job announces a hacking session.
    pub hacking_session: bool,
    /// Log file; stderr when unset.
    pub log_file: Option<PathBuf>,
    /// Where to write the recorded results as JSON.
    pub results_file: Option<PathBuf>,
}

impl JobConfig {
    /// Creates a configuration running `command` with the default runtime and image.
    #[must_use]
    pub fn new(command: Vec<String>) -> Self {
        Self {
            runtime: RuntimeKind::default(),
            image: Some(DEFAULT_IMAGE.to_string()),
            command,
            assets: Vec::new(),
            docker_proxy: false,
            hacking_session: false,
            log_file: None,
            results_file: None,
        }
    }

    /// Sets the runtime.
    #[must_use]
    pub fn with_runtime(mut self, runtime: RuntimeKind) -> Self {
        self.runtime = runtime;
        self
    }

    /// Sets the container image.
    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Adds an artifact URL or path.
    #[must_use]
    pub fn with_asset(mut self, asset: impl Into<String>) -> Self {
        self.assets.push(asset.into());
        self
    }

    /// Enables the nested container proxy.
    #[must_use]
    pub fn with_docker_proxy(mut self, enabled: bool) -> Self {
        self.docker_proxy = enabled;
        self
    }

    /// Enables hacking session detection.
    #[must_use]
    pub fn with_hacking_session(mut self, enabled: bool) -> Self {
        self.hacking_session = enabled;
        self
    }

    /// Writes the job log to `path` instead of stderr.
    #[must_use]
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Writes the recorded results to `path`.
    #[must_use]
    pub fn with_results_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.results_file = Some(path.into());
        self
    }

    /// Local files referenced by `file://` assets or arguments, deduplicated.
    #[must_use]
    pub fn file_paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = Vec::new();
        for path in self
            .assets
            .iter()
            .chain(&self.command)
            .filter_map(|arg| file_url_path(arg))
        {
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
        paths
    }
}

/// Result of a job run.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    /// Overall exit code, the worse of the two below.
    pub exit_code: i32,
    /// Exit code of the primary process.
    pub process_exit_code: i32,
    /// Exit code derived from the recorded results.
    pub results_exit_code: i32,
    /// Recorded results.
    pub results: serde_json::Value,
}

/// Runs one job.
pub struct Job {
    config: JobConfig,
    host: Arc<dyn Host>,
    base_dir: Option<PathBuf>,
}

impl Job {
    /// Creates a job on the real host.
    #[must_use]
    pub fn new(config: JobConfig) -> Self {
        Self {
            config,
            host: Arc::new(SystemHost::new()),
            base_dir: None,
        }
    }

    /// Uses `host` for every OS interaction of the runtime.
    #[must_use]
    pub fn with_host(mut self, host: Arc<dyn Host>) -> Self {
        self.host = host;
        self
    }

    /// Creates the work directory inside `dir` instead of the system temporary directory.
    #[must_use]
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    /// The job configuration.
    #[must_use]
    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Runs the job, logging to the configured destination and tracking LAVA results.
    ///
    /// # Errors
    ///
    /// Returns an error if the log file cannot be opened or the run fails.
    pub fn run(&self) -> Result<JobOutcome> {
        let sink = match &self.config.log_file {
            Some(path) => LogWriter::file(path)?,
            None => LogWriter::stderr(),
        };
        self.run_with(Box::new(sink), Box::new(LavaResults::new()))
    }

    /// Runs the job with the given output destinations.
    ///
    /// # Errors
    ///
    /// Returns a binding, runtime or I/O error. Every backend resource and
    /// the work directory are released in all cases.
    #[instrument(skip(self, sink, results), fields(runtime = %self.config.runtime))]
    pub fn run_with(
        &self,
        sink: Box<dyn LogSink>,
        results: Box<dyn ResultTracker>,
    ) -> Result<JobOutcome> {
        let mut workdir = match &self.base_dir {
            Some(base) => JobWorkDir::create_in(base)?,
            None => JobWorkDir::create()?,
        };

        let outcome = self.run_in(&workdir, sink, results);
        workdir.remove();
        let outcome = outcome?;

        if let Some(path) = &self.config.results_file {
            write_results(path, &outcome.results)?;
        }

        info!(
            exit_code = outcome.exit_code,
            process = outcome.process_exit_code,
            results = outcome.results_exit_code,
            "Job finished"
        );
        Ok(outcome)
    }

    fn run_in(
        &self,
        workdir: &JobWorkDir,
        sink: Box<dyn LogSink>,
        results: Box<dyn ResultTracker>,
    ) -> Result<JobOutcome> {
        let mut runtime_config = RuntimeConfig::new().with_name(workdir.name());
        if let Some(image) = &self.config.image {
            runtime_config = runtime_config.with_image(image.as_str());
        }

        let mut supervisor =
            Supervisor::with_host(self.config.runtime, runtime_config, Arc::clone(&self.host));
        supervisor.bind(workdir.path(), None, false, false)?;
        for path in self.config.file_paths() {
            debug!(path, "Binding local artifact");
            supervisor.bind(path, None, true, false)?;
        }

        let _bridge = match SignalBridge::install(&supervisor.cancel_token()) {
            Ok(bridge) => Some(bridge),
            Err(e) => {
                warn!(error = %e, "Signal handlers not installed, the job cannot be cancelled");
                None
            }
        };

        let result = self.drive(&mut supervisor, workdir, sink, results);
        supervisor.post_run();

        let outcome = JobOutcome {
            exit_code: supervisor.job_exit_code(),
            process_exit_code: supervisor.exit_code(),
            results_exit_code: supervisor.results_exit_code(),
            results: supervisor.results_data(),
        };
        supervisor.cleanup();

        result.map(|()| outcome)
    }

    fn drive(
        &self,
        supervisor: &mut Supervisor,
        workdir: &JobWorkDir,
        sink: Box<dyn LogSink>,
        results: Box<dyn ResultTracker>,
    ) -> Result<()> {
        supervisor.prepare(sink, results, self.config.hacking_session)?;

        if self.config.docker_proxy {
            let tmp = workdir.create_dispatcher_tmp()?;
            supervisor.bind(&tmp, Some(DISPATCHER_TMP_MOUNT_POINT), false, false)?;
            supervisor.pre_run(workdir.path())?;
        }

        supervisor.add_bindings()?;
        supervisor.execute(&self.config.command)?;
        Ok(())
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("config", &self.config)
            .field("base_dir", &self.base_dir)
            .finish_non_exhaustive()
    }
}

fn write_results(path: &Path, results: &serde_json::Value) -> io::Result<()> {
    let json = serde_json::to_string(results).map_err(io::Error::from)?;
    fs::write(path, json)?;
    debug!(path = %path.display(), "Results written");
    Ok(())
}
