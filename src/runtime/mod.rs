//! Container runtime abstraction.
//!
//! This module runs a job command either directly on the host or inside a
//! Docker/Podman container, with:
//! - Validated host to container bind mounts
//! - Automatic bindings for kernel modules, KVM and the guestfs cache
//! - Optional helper bootstrap so the job can start nested containers
//! - Cancellation of the running job from termination signals
//!
//! # Example
//!
//! ```no_run
//! use job_runtime::events::{LavaResults, LogWriter};
//! use job_runtime::runtime::{RuntimeConfig, RuntimeKind, Supervisor};
//!
//! # fn main() -> job_runtime::Result<()> {
//! let config = RuntimeConfig::new().with_image("docker.io/library/debian:stable");
//! let mut supervisor = Supervisor::new(RuntimeKind::Podman, config);
//!
//! supervisor.bind("/srv/artifacts", Some("/artifacts"), true, false)?;
//! supervisor.prepare(Box::new(LogWriter::stderr()), Box::new(LavaResults::new()), false)?;
//! supervisor.add_bindings()?;
//!
//! supervisor.execute(&["uname".to_string(), "-a".to_string()])?;
//! supervisor.post_run();
//! let code = supervisor.job_exit_code();
//! supervisor.cleanup();
//! # let _ = code;
//! # Ok(())
//! # }
//! ```

mod backend;
mod bindings;
mod config;
mod supervisor;
mod wrapper;

pub use backend::{
    Backend, DOCKER_SOCKET, GUESTFS_MOUNT_POINT, PODMAN_SOCKET_MOUNT_POINT, RuntimeKind,
    UnknownRuntime, guestfs_cache_dir, user_opts_variable,
};
pub use bindings::{Binding, BindingSet};
pub use config::{RuntimeConfig, SocketWait};
pub use supervisor::{OutputLines, RunningJob, Supervisor};
pub use wrapper::{WRAPPER_MOUNT_POINT, dispatcher_volume};
