//! Configuration for container runtimes.

use std::path::PathBuf;
use std::time::Duration;

/// How long to wait for a helper service socket to appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketWait {
    /// Number of existence checks before giving up.
    pub attempts: u32,
    /// Delay between two checks.
    pub interval: Duration,
}

impl Default for SocketWait {
    fn default() -> Self {
        Self {
            attempts: 60,
            interval: Duration::from_secs(1),
        }
    }
}

/// Configuration for a runtime instance.
///
/// # Example
///
/// ```
/// use job_runtime::runtime::RuntimeConfig;
///
/// let config = RuntimeConfig::default()
///     .with_image("docker.io/lavasoftware/lava-dispatcher:latest")
///     .with_name("jobrun-1234");
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Container image reference.
    pub image: Option<String>,

    /// Container network to attach to.
    pub network: Option<String>,

    /// Container name.
    pub name: Option<String>,

    /// Bind the libguestfs appliance cache when the backend supports it.
    pub guestfs: bool,

    /// Host directory bound as the guestfs cache. Defaults to
    /// `/var/tmp/.guestfs-<uid>`.
    pub guestfs_dir: Option<PathBuf>,

    /// Bind `/dev/kvm` when it exists on the host.
    pub kvm: bool,

    /// Helper socket readiness budget.
    pub socket_wait: SocketWait,

    /// Time an abandoned job gets to exit after SIGTERM before SIGKILL.
    pub stop_grace: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            image: None,
            network: None,
            name: None,
            guestfs: true,
            guestfs_dir: None,
            kvm: true,
            socket_wait: SocketWait::default(),
            stop_grace: Duration::from_secs(10),
        }
    }
}

impl RuntimeConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the container image.
    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Sets the container network.
    #[must_use]
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    /// Sets the container name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Enables or disables the guestfs cache binding.
    #[must_use]
    pub fn with_guestfs(mut self, enabled: bool) -> Self {
        self.guestfs = enabled;
        self
    }

    /// Sets the host directory used as the guestfs cache.
    #[must_use]
    pub fn with_guestfs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.guestfs_dir = Some(dir.into());
        self
    }

    /// Never binds `/dev/kvm`, even if present.
    #[must_use]
    pub fn without_kvm(mut self) -> Self {
        self.kvm = false;
        self
    }

    /// Sets the helper socket readiness budget.
    #[must_use]
    pub fn with_socket_wait(mut self, socket_wait: SocketWait) -> Self {
        self.socket_wait = socket_wait;
        self
    }

    /// Sets the SIGTERM to SIGKILL grace period for abandoned jobs.
    #[must_use]
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }
}
