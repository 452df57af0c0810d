//! Private per-job work directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, instrument, warn};

/// Prefix of work directory names.
pub const WORKDIR_PREFIX: &str = "jobrun-";

/// Container-side path of the dispatcher scratch directory.
pub const DISPATCHER_TMP_MOUNT_POINT: &str = "/var/lib/lava/dispatcher/tmp";

/// Temporary directory holding everything a job run produces on the host.
///
/// Removed on [`JobWorkDir::remove`] or drop.
#[derive(Debug)]
pub struct JobWorkDir {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl JobWorkDir {
    /// Creates a work directory in the system temporary directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn create() -> io::Result<Self> {
        Self::create_in(std::env::temp_dir())
    }

    /// Creates a work directory inside `base`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    #[instrument(skip(base), fields(base = %base.as_ref().display()))]
    pub fn create_in(base: impl AsRef<Path>) -> io::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(WORKDIR_PREFIX)
            .tempdir_in(base)?;
        let path = dir.path().to_path_buf();
        debug!(path = %path.display(), "Work directory created");
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    /// Path of the work directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Base name of the work directory, unique per job.
    #[must_use]
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// `dispatcher/` subdirectory.
    #[must_use]
    pub fn dispatcher_dir(&self) -> PathBuf {
        self.path.join("dispatcher")
    }

    /// `dispatcher/tmp/` subdirectory, shared with nested containers.
    #[must_use]
    pub fn dispatcher_tmp(&self) -> PathBuf {
        self.dispatcher_dir().join("tmp")
    }

    /// Creates `dispatcher/tmp/` and returns its path.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created.
    pub fn create_dispatcher_tmp(&self) -> io::Result<PathBuf> {
        let tmp = self.dispatcher_tmp();
        fs::create_dir_all(&tmp)?;
        Ok(tmp)
    }

    /// Removes the work directory.
    ///
    /// Missing or inaccessible content is not an error: files created by
    /// the container may belong to another user.
    pub fn remove(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };

        match dir.close() {
            Ok(()) => debug!(path = %self.path.display(), "Work directory removed"),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
                ) =>
            {
                debug!(path = %self.path.display(), error = %e, "Work directory partially removed");
            }
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove work directory"),
        }
    }
}

impl Drop for JobWorkDir {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_remove() {
        let base = tempfile::TempDir::new().expect("failed to create temp dir");
        let mut workdir = JobWorkDir::create_in(base.path()).unwrap();

        let path = workdir.path().to_path_buf();
        assert!(path.is_dir());
        assert!(workdir.name().starts_with(WORKDIR_PREFIX));

        workdir.remove();
        assert!(!path.exists());
        workdir.remove();
    }

    #[test]
    fn test_dispatcher_tmp() {
        let base = tempfile::TempDir::new().expect("failed to create temp dir");
        let workdir = JobWorkDir::create_in(base.path()).unwrap();

        let tmp = workdir.create_dispatcher_tmp().unwrap();
        assert_eq!(tmp, workdir.path().join("dispatcher").join("tmp"));
        assert!(tmp.is_dir());
    }

    #[test]
    fn test_remove_after_external_delete() {
        let base = tempfile::TempDir::new().expect("failed to create temp dir");
        let mut workdir = JobWorkDir::create_in(base.path()).unwrap();
        fs::remove_dir_all(workdir.path()).unwrap();
        workdir.remove();
    }

    #[test]
    fn test_drop_removes() {
        let base = tempfile::TempDir::new().expect("failed to create temp dir");
        let path = {
            let workdir = JobWorkDir::create_in(base.path()).unwrap();
            workdir.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
