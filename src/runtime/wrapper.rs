//! In-container `docker` proxy script.
//!
//! Jobs that start their own containers (e.g. FVP models) call `docker` from
//! inside the job container. The rendered script is bound over
//! `/usr/local/bin/docker` and forwards those calls to the host service,
//! sharing the dispatcher scratch volume and, for Podman, the job network.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use askama::Template;
use tracing::{debug, instrument, trace};

use crate::error::RuntimeError;

/// Where the wrapper is bound inside the container.
pub const WRAPPER_MOUNT_POINT: &str = "/usr/local/bin/docker";

/// File name of the wrapper inside the work directory.
pub const WRAPPER_FILE_NAME: &str = "docker";

/// Wrapper permissions: rwxr-xr-x (0755).
const WRAPPER_PERMISSIONS: u32 = 0o755;

#[derive(Template)]
#[template(path = "docker-wrapper.sh.j2", escape = "none")]
struct DockerWrapper<'a> {
    runtime: &'a str,
    volume: String,
    network: Option<&'a str>,
    socket: Option<&'a str>,
}

/// Parameters for rendering the proxy script.
#[derive(Debug, Clone, Copy)]
pub struct WrapperParams<'a> {
    /// Host runtime binary name.
    pub runtime: &'a str,
    /// Job work directory on the host.
    pub workdir: &'a Path,
    /// Network the nested containers join.
    pub network: Option<&'a str>,
    /// Socket path, inside the job container, of the host service.
    pub socket: Option<&'a str>,
}

/// Scratch directory shared between the job container and nested containers.
#[must_use]
pub fn dispatcher_volume(workdir: &Path) -> PathBuf {
    workdir.join("dispatcher").join("tmp")
}

/// Renders the proxy script.
///
/// # Errors
///
/// Returns `RuntimeError::Wrapper` if rendering fails.
pub fn render(params: &WrapperParams<'_>) -> Result<String, RuntimeError> {
    DockerWrapper {
        runtime: params.runtime,
        volume: dispatcher_volume(params.workdir).display().to_string(),
        network: params.network,
        socket: params.socket,
    }
    .render()
    .map_err(|e| RuntimeError::Wrapper(format!("render failed: {e}")))
}

/// Renders the proxy script and writes it, executable, into the work directory.
///
/// Returns the host path of the written script.
///
/// # Errors
///
/// Returns `RuntimeError::Wrapper` if rendering or writing fails.
#[instrument(skip(params), fields(runtime = %params.runtime, workdir = %params.workdir.display()))]
pub fn write(params: &WrapperParams<'_>) -> Result<PathBuf, RuntimeError> {
    let script = render(params)?;
    debug!("docker wrapper rendered");
    trace!(%script, "docker wrapper");

    let path = params.workdir.join(WRAPPER_FILE_NAME);
    fs::write(&path, script).map_err(|e| {
        RuntimeError::Wrapper(format!("failed to write {}: {}", path.display(), e))
    })?;
    fs::set_permissions(&path, fs::Permissions::from_mode(WRAPPER_PERMISSIONS)).map_err(|e| {
        RuntimeError::Wrapper(format!(
            "failed to set permissions on {}: {}",
            path.display(),
            e
        ))
    })?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_render_docker_wrapper() {
        let script = render(&WrapperParams {
            runtime: "docker",
            workdir: Path::new("/tmp/jobrun-abc"),
            network: None,
            socket: None,
        })
        .unwrap();

        assert!(script.starts_with("#!/bin/sh"));
        assert!(script.contains("--volume=/tmp/jobrun-abc/dispatcher/tmp:/tmp/jobrun-abc/dispatcher/tmp"));
        assert!(!script.contains("--network"));
        assert!(!script.contains("DOCKER_HOST"));
    }

    #[test]
    fn test_render_podman_wrapper() {
        let script = render(&WrapperParams {
            runtime: "podman",
            workdir: Path::new("/tmp/jobrun-abc"),
            network: Some("jobrun-abc"),
            socket: Some("/run/podman/podman.sock"),
        })
        .unwrap();

        assert!(script.contains("--network=jobrun-abc"));
        assert!(script.contains("DOCKER_HOST=\"unix:///run/podman/podman.sock\""));
        assert!(script.contains("host podman service"));
    }

    #[test]
    fn test_write_is_executable() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = write(&WrapperParams {
            runtime: "docker",
            workdir: temp_dir.path(),
            network: None,
            socket: None,
        })
        .unwrap();

        assert_eq!(path, temp_dir.path().join("docker"));
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
