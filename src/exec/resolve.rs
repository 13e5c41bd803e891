//! Executable lookup for the child command.

use crate::config::types::{Result, RunError};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Used when neither the run environment nor the host defines `PATH`
const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Resolve `program` to the file that will be executed.
///
/// Names containing a `/` are taken relative to `working_dir`. Bare names are
/// searched in the run environment's `PATH`, falling back to the host `PATH`
/// because the child environment is usually minimal.
pub fn resolve_executable(
    program: &str,
    environment: &BTreeMap<String, String>,
    working_dir: &Path,
) -> Result<PathBuf> {
    if program.contains('/') {
        let candidate = working_dir.join(program);
        return if is_executable(&candidate) {
            Ok(candidate)
        } else {
            Err(RunError::Engine(format!(
                "Command is not an executable file: {}",
                candidate.display()
            )))
        };
    }

    let search_path: OsString = environment
        .get("PATH")
        .map(OsString::from)
        .or_else(|| std::env::var_os("PATH"))
        .unwrap_or_else(|| OsString::from(FALLBACK_PATH));

    std::env::split_paths(&search_path)
        .map(|dir| {
            if dir.is_relative() {
                working_dir.join(dir).join(program)
            } else {
                dir.join(program)
            }
        })
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| RunError::Engine(format!("Command not found in PATH: {}", program)))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
