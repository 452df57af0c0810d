//! Container backends.
//!
//! A closed set of variants ([`RuntimeKind`]) with the per-backend logic for
//! automatic bindings, warm-up, helper bootstrap and command invocation.
//!
//! # Backends
//!
//! - **Null**: no isolation. The command runs directly on the host; every
//!   other step is a no-op.
//! - **Docker**: `docker run` with the declared bindings. Pre-run exposes the
//!   host Docker socket and a `docker` proxy script to the job.
//! - **Podman**: `podman run` with the declared bindings. Pre-run creates a
//!   per-job network and starts `podman system service` on a socket inside
//!   the work directory; post-run tears both down.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use nix::unistd::getuid;
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

use super::bindings::{Binding, BindingSet};
use super::config::{RuntimeConfig, SocketWait};
use super::wrapper::{self, WRAPPER_MOUNT_POINT, WrapperParams};
use crate::error::{BindingError, RuntimeError};
use crate::system::{Host, JobProcess};

/// Host Docker socket, bound at the same path in the container.
pub const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Where the Podman service socket appears inside the container.
pub const PODMAN_SOCKET_MOUNT_POINT: &str = "/run/podman/podman.sock";

/// File name of the Podman service socket inside the work directory.
pub const PODMAN_SOCKET_FILE_NAME: &str = "podman.sock";

/// Container-side path of the libguestfs appliance cache.
pub const GUESTFS_MOUNT_POINT: &str = "/var/tmp/.guestfs-0";

/// Read-only host paths every container backend exposes.
pub const DEFAULT_READ_ONLY_PATHS: &[&str] = &["/boot", "/lib/modules"];

/// KVM device node.
pub const KVM_DEVICE: &str = "/dev/kvm";

/// The available runtimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RuntimeKind {
    /// Run directly on the host.
    Null,
    /// Docker.
    Docker,
    /// Podman.
    #[default]
    Podman,
}

/// Error returned when parsing an unknown runtime name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown runtime '{0}' (expected one of: docker, podman, null)")]
pub struct UnknownRuntime(pub String);

impl RuntimeKind {
    /// All runtimes, in registration order.
    pub const ALL: [RuntimeKind; 3] = [Self::Docker, Self::Podman, Self::Null];

    /// Selects a runtime by name.
    ///
    /// Unknown names fall back to [`RuntimeKind::Null`]. Use [`str::parse`]
    /// for a strict lookup.
    #[must_use]
    pub fn select(name: &str) -> Self {
        name.parse().unwrap_or_else(|_| {
            warn!(name, "Unknown runtime, falling back to null runtime");
            Self::Null
        })
    }

    /// Runtime name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }

    /// Backend executable, `None` for the null runtime.
    #[must_use]
    pub fn binary(self) -> Option<&'static str> {
        match self {
            Self::Null => None,
            Self::Docker => Some("docker"),
            Self::Podman => Some("podman"),
        }
    }

    /// Returns true for container-backed runtimes.
    #[must_use]
    pub fn is_container(self) -> bool {
        self.binary().is_some()
    }

    /// Returns true if the runtime can bind the guestfs appliance cache.
    ///
    /// Podman never does: libguestfs rejects a cached appliance that is
    /// not owned by the user it runs as inside the user namespace.
    #[must_use]
    pub fn binds_guestfs(self) -> bool {
        matches!(self, Self::Docker)
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RuntimeKind {
    type Err = UnknownRuntime;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| UnknownRuntime(s.to_string()))
    }
}

/// Environment variable holding extra `run` options for `binary`.
#[must_use]
pub fn user_opts_variable(binary: &str) -> String {
    format!("JOBRUN_{}_RUN", binary.to_ascii_uppercase())
}

/// Host directory used as the guestfs appliance cache for the current user.
#[must_use]
pub fn guestfs_cache_dir() -> PathBuf {
    PathBuf::from(format!("/var/tmp/.guestfs-{}", getuid()))
}

/// Per-instance backend state.
pub struct Backend {
    kind: RuntimeKind,
    image: Option<String>,
    network: Option<String>,
    name: Option<String>,
    allow_user_opts: bool,
    socket_wait: SocketWait,
    /// Bindings handed over by `add_bindings`.
    volumes: Vec<Binding>,
    /// Network created by pre-run, removed by post-run.
    created_network: Option<String>,
    /// Background service started by pre-run.
    helper: Option<Box<dyn JobProcess>>,
}

impl Backend {
    /// Creates the backend state for `kind`.
    #[must_use]
    pub fn new(kind: RuntimeKind, config: &RuntimeConfig) -> Self {
        Self {
            kind,
            image: config.image.clone(),
            network: config.network.clone(),
            name: config.name.clone(),
            allow_user_opts: true,
            socket_wait: config.socket_wait,
            volumes: Vec::new(),
            created_network: None,
            helper: None,
        }
    }

    /// Bindings this backend adds at construction time.
    ///
    /// Container backends expose `/boot` and `/lib/modules` read-only, pass
    /// `/dev/kvm` through when it exists and, for Docker, bind the guestfs
    /// appliance cache (creating it if needed).
    #[instrument(skip(self, host, config), fields(runtime = %self.kind))]
    pub fn default_bindings(&self, host: &dyn Host, config: &RuntimeConfig) -> Vec<Binding> {
        if !self.kind.is_container() {
            return Vec::new();
        }

        let mut bindings: Vec<Binding> = DEFAULT_READ_ONLY_PATHS
            .iter()
            .map(|path| Binding::same(path).read_only())
            .collect();

        if config.kvm && host.exists(Path::new(KVM_DEVICE)) {
            bindings.push(Binding::same(KVM_DEVICE).device());
        }

        if config.guestfs && self.kind.binds_guestfs() {
            let cache = config.guestfs_dir.clone().unwrap_or_else(guestfs_cache_dir);
            match fs::create_dir(&cache) {
                Ok(()) => trace!(path = %cache.display(), "Created guestfs cache"),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => {
                    warn!(path = %cache.display(), error = %e, "Cannot create guestfs cache, not binding it");
                    return bindings;
                }
            }
            bindings.push(Binding::new(
                cache.to_string_lossy().into_owned(),
                GUESTFS_MOUNT_POINT,
            ));
        }

        debug!(count = bindings.len(), "Default bindings");
        bindings
    }

    /// The backend kind.
    #[must_use]
    pub fn kind(&self) -> RuntimeKind {
        self.kind
    }

    /// Sets the container image.
    pub fn set_image(&mut self, image: impl Into<String>) {
        self.image = Some(image.into());
    }

    /// The container image.
    #[must_use]
    pub fn image(&self) -> Option<&str> {
        self.image.as_deref()
    }

    /// Sets the network the container joins.
    pub fn set_network(&mut self, network: Option<String>) {
        self.network = network;
    }

    /// The network the container joins.
    #[must_use]
    pub fn network(&self) -> Option<&str> {
        self.network.as_deref()
    }

    /// Sets the container name.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    /// Enables or disables extra `run` options from the environment.
    pub fn set_allow_user_opts(&mut self, allow: bool) {
        self.allow_user_opts = allow;
    }

    /// Returns true if extra `run` options are read from the environment.
    #[must_use]
    pub fn allow_user_opts(&self) -> bool {
        self.allow_user_opts
    }

    /// Returns true while a helper service is running.
    #[must_use]
    pub fn has_helper(&self) -> bool {
        self.helper.is_some()
    }

    /// Bindings applied to the container.
    #[must_use]
    pub fn volumes(&self) -> &[Binding] {
        &self.volumes
    }

    /// One-time warm-up.
    ///
    /// Checks that the backend executable can be launched and pulls the
    /// image when it is not available locally.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::NotFound` if the backend executable cannot be
    /// located or launched.
    #[instrument(skip(self, host), fields(runtime = %self.kind, image = ?self.image))]
    pub fn prepare(&mut self, host: &dyn Host) -> Result<(), RuntimeError> {
        let Some(binary) = self.kind.binary() else {
            return Ok(());
        };

        match host.status(&[binary.to_string(), "--version".to_string()]) {
            Ok(0) => trace!("Runtime available"),
            Ok(code) => warn!(code, "Runtime version check returned non-zero"),
            Err(e) => {
                debug!(error = %e, "Runtime cannot be launched");
                return Err(RuntimeError::NotFound {
                    binary: binary.to_string(),
                });
            }
        }

        if let Some(image) = &self.image {
            let inspect = [
                binary.to_string(),
                "image".to_string(),
                "inspect".to_string(),
                image.clone(),
            ];
            if !matches!(host.status(&inspect), Ok(0)) {
                info!(%image, "Pulling container image");
                let pull = [binary.to_string(), "pull".to_string(), image.clone()];
                match host.status(&pull) {
                    Ok(0) => debug!("Image pulled"),
                    Ok(code) => warn!(code, %image, "Image pull failed"),
                    Err(e) => warn!(error = %e, %image, "Image pull failed"),
                }
            }
        }

        Ok(())
    }

    /// Backend-specific bootstrap before the job starts.
    ///
    /// Returns the bindings the job needs for the helper to be reachable.
    ///
    /// # Errors
    ///
    /// - `RuntimeError::Wrapper` if the proxy script cannot be written
    /// - `RuntimeError::Spawn` if the backend CLI or helper cannot be launched
    /// - `RuntimeError::SocketTimeout` if the Podman socket never appears
    #[instrument(skip(self, host), fields(runtime = %self.kind, workdir = %workdir.display()))]
    pub fn pre_run(&mut self, host: &dyn Host, workdir: &Path) -> Result<Vec<Binding>, RuntimeError> {
        match self.kind {
            RuntimeKind::Null => Ok(Vec::new()),
            RuntimeKind::Docker => self.pre_run_docker(workdir),
            RuntimeKind::Podman => self.pre_run_podman(host, workdir),
        }
    }

    fn pre_run_docker(&mut self, workdir: &Path) -> Result<Vec<Binding>, RuntimeError> {
        let script = wrapper::write(&WrapperParams {
            runtime: RuntimeKind::Docker.name(),
            workdir,
            network: None,
            socket: None,
        })?;

        Ok(vec![
            Binding::new(script.to_string_lossy().into_owned(), WRAPPER_MOUNT_POINT).read_only(),
            Binding::same(DOCKER_SOCKET),
        ])
    }

    fn pre_run_podman(
        &mut self,
        host: &dyn Host,
        workdir: &Path,
    ) -> Result<Vec<Binding>, RuntimeError> {
        let binary = RuntimeKind::Podman.name();

        let network = workdir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "jobrun".to_string());

        let create = [
            binary.to_string(),
            "network".to_string(),
            "create".to_string(),
            network.clone(),
        ];
        match host.status(&create) {
            Ok(0) => debug!(%network, "Network created"),
            Ok(code) => warn!(%network, code, "Network creation returned non-zero"),
            Err(source) => {
                return Err(RuntimeError::Spawn {
                    command: binary.to_string(),
                    source,
                });
            }
        }
        self.created_network = Some(network.clone());
        self.network = Some(network.clone());

        let script = wrapper::write(&WrapperParams {
            runtime: binary,
            workdir,
            network: Some(&network),
            socket: Some(PODMAN_SOCKET_MOUNT_POINT),
        })?;

        let socket = workdir.join(PODMAN_SOCKET_FILE_NAME);
        let bindings = vec![
            Binding::new(script.to_string_lossy().into_owned(), WRAPPER_MOUNT_POINT).read_only(),
            Binding::new(socket.to_string_lossy().into_owned(), PODMAN_SOCKET_MOUNT_POINT),
        ];

        let service = [
            binary.to_string(),
            "system".to_string(),
            "service".to_string(),
            "--time".to_string(),
            "0".to_string(),
            format!("unix://{}", socket.display()),
        ];
        let helper = host
            .spawn_detached(&service)
            .map_err(|source| RuntimeError::Spawn {
                command: service.join(" "),
                source,
            })?;
        debug!(pid = ?helper.id(), "Podman service started");
        self.helper = Some(helper);

        for attempt in 1..=self.socket_wait.attempts {
            if host.exists(&socket) {
                debug!(attempt, socket = %socket.display(), "Podman socket ready");
                return Ok(bindings);
            }
            trace!(attempt, "Waiting for podman socket");
            host.sleep(self.socket_wait.interval);
        }

        Err(RuntimeError::SocketTimeout {
            binary: binary.to_string(),
            path: socket,
            attempts: self.socket_wait.attempts,
        })
    }

    /// Backend-specific teardown after the job ended.
    ///
    /// Best-effort: removes the network created by pre-run and stops the
    /// helper service. A no-op when pre-run never ran.
    #[instrument(skip(self, host), fields(runtime = %self.kind))]
    pub fn post_run(&mut self, host: &dyn Host) {
        if let (Some(network), Some(binary)) = (self.created_network.take(), self.kind.binary()) {
            let remove = [
                binary.to_string(),
                "network".to_string(),
                "rm".to_string(),
                network.clone(),
            ];
            match host.status(&remove) {
                Ok(0) => debug!(%network, "Network removed"),
                Ok(code) => warn!(%network, code, "Network removal returned non-zero"),
                Err(e) => warn!(%network, error = %e, "Network removal failed"),
            }
        }

        self.stop_helper();
    }

    fn stop_helper(&mut self) {
        let Some(mut helper) = self.helper.take() else {
            return;
        };

        debug!(pid = ?helper.id(), "Stopping helper service");
        if let Err(e) = helper.terminate() {
            warn!(error = %e, "Failed to signal helper service");
        }
        match helper.wait() {
            Ok(code) => debug!(code, "Helper service exited"),
            Err(e) => warn!(error = %e, "Failed to wait for helper service"),
        }
    }

    /// Validates `bindings` and hands them to the backend.
    ///
    /// The null runtime ignores bindings entirely.
    ///
    /// # Errors
    ///
    /// Returns a `BindingError` if sources or destinations collide; nothing
    /// is applied in that case.
    pub fn add_bindings(&mut self, bindings: &BindingSet) -> Result<(), BindingError> {
        if !self.kind.is_container() {
            return Ok(());
        }

        bindings.validate()?;
        self.volumes = bindings.as_slice().to_vec();
        Ok(())
    }

    /// Full command line for running `args` with this backend.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::MissingImage` for a container backend without image.
    pub fn command_line(&self, args: &[String]) -> Result<Vec<String>, RuntimeError> {
        let Some(binary) = self.kind.binary() else {
            return Ok(args.to_vec());
        };

        let image = self.image.as_ref().ok_or_else(|| RuntimeError::MissingImage {
            binary: binary.to_string(),
        })?;

        let mut cmd = vec![
            binary.to_string(),
            "run".to_string(),
            "--rm".to_string(),
            "--init".to_string(),
        ];
        if let Some(name) = &self.name {
            cmd.push(format!("--name={name}"));
        }
        if let Some(network) = &self.network {
            cmd.push(format!("--network={network}"));
        }
        cmd.extend(self.volumes.iter().map(Binding::to_cli_option));

        if self.allow_user_opts {
            if let Ok(opts) = std::env::var(user_opts_variable(binary)) {
                cmd.extend(opts.split_whitespace().map(str::to_string));
            }
        }

        cmd.push(image.clone());
        cmd.extend(args.iter().cloned());
        Ok(cmd)
    }

    /// Spawns the primary process.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Spawn` carrying the OS error (e.g. not found)
    /// if the process cannot be started.
    #[instrument(skip(self, host, args), fields(runtime = %self.kind))]
    pub fn spawn(&self, host: &dyn Host, args: &[String]) -> Result<Box<dyn JobProcess>, RuntimeError> {
        let cmd = self.command_line(args)?;
        debug!(command = %cmd.join(" "), "Calling");
        host.spawn(&cmd).map_err(|source| RuntimeError::Spawn {
            command: cmd.first().cloned().unwrap_or_default(),
            source,
        })
    }

    /// Releases backend resources that are still held.
    pub fn release(&mut self, host: &dyn Host) {
        if self.created_network.is_some() || self.helper.is_some() {
            debug!("Releasing resources left by pre-run");
            self.post_run(host);
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("kind", &self.kind)
            .field("image", &self.image)
            .field("network", &self.network)
            .field("name", &self.name)
            .field("allow_user_opts", &self.allow_user_opts)
            .field("volumes", &self.volumes.len())
            .field("has_helper", &self.helper.is_some())
            .finish()
    }
}
