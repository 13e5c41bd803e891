/// Run-scoped temporary workspace
///
/// Each run gets `root/<uuid>` holding the captured output files. The
/// directory is removed by [`Workspace::close`], which reports failures, or by
/// `Drop` as a fallback when a run unwinds.
use crate::config::types::{Result, RunError};
use crate::safety::safe_cleanup;
use std::fs::{self, DirBuilder};
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const STDOUT_FILE: &str = "stdout";
const STDERR_FILE: &str = "stderr";

/// Default parent of run workspaces: a per-user directory in the system temp dir
pub fn default_workspace_root() -> PathBuf {
    let euid = unsafe { libc::geteuid() };
    std::env::temp_dir().join(format!("runexec-uid-{}", euid))
}

/// The root must be a real directory owned by the effective uid, with no
/// group or other permission bits.
fn check_root_private(root: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(root).map_err(|e| {
        RunError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to inspect workspace root {}: {}", root.display(), e),
        ))
    })?;
    if !meta.file_type().is_dir() {
        return Err(RunError::Config(format!(
            "Workspace root {} is not a directory",
            root.display()
        )));
    }
    let euid = unsafe { libc::geteuid() };
    if meta.uid() != euid {
        return Err(RunError::Config(format!(
            "Workspace root {} is owned by uid {}, expected {}",
            root.display(),
            meta.uid(),
            euid
        )));
    }
    if meta.mode() & 0o077 != 0 {
        return Err(RunError::Config(format!(
            "Workspace root {} has mode {:o}, group and other access must be off",
            root.display(),
            meta.mode() & 0o7777
        )));
    }
    Ok(())
}

/// Scoped directory for one run
#[derive(Debug)]
pub struct Workspace {
    run_id: String,
    run_dir: PathBuf,
    closed: bool,
}

impl Workspace {
    /// Create a fresh run directory below `root`, creating `root` if needed.
    pub fn create(root: &Path) -> Result<Self> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(root)
            .map_err(|e| {
                RunError::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to create workspace root {}: {}", root.display(), e),
                ))
            })?;
        check_root_private(root)?;

        let run_id = Uuid::new_v4().to_string();
        let run_dir = root.join(&run_id);
        DirBuilder::new().mode(0o700).create(&run_dir).map_err(|e| {
            RunError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to create workspace directory {}: {}", run_dir.display(), e),
            ))
        })?;

        log::debug!("Created workspace {}", run_dir.display());
        Ok(Self {
            run_id,
            run_dir,
            closed: false,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// File receiving the child's standard output
    pub fn stdout_path(&self) -> PathBuf {
        self.run_dir.join(STDOUT_FILE)
    }

    /// File receiving the child's standard error
    pub fn stderr_path(&self) -> PathBuf {
        self.run_dir.join(STDERR_FILE)
    }

    /// Read a file from the workspace; a file the engine never created reads
    /// as empty.
    pub fn read_output(&self, path: &Path) -> Result<Vec<u8>> {
        match fs::read(path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(RunError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to read output file {}: {}", path.display(), e),
            ))),
        }
    }

    /// Remove the workspace, reporting failure.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.remove()?;
        #[cfg(test)]
        if fault::take_close_failure() {
            return Err(RunError::Cleanup {
                path: self.run_dir.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "injected close failure"),
            });
        }
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        safe_cleanup::remove_tree_secure(&self.run_dir).map_err(|source| RunError::Cleanup {
            path: self.run_dir.clone(),
            source,
        })
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.remove() {
            log::warn!("Failed to remove workspace {}: {}", self.run_dir.display(), e);
        }
    }
}
