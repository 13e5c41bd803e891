/// Cgroup v2 accounting for a single run
///
/// A child cgroup is created under a delegated parent (by default the
/// supervisor's own cgroup). The payload joins it from `pre_exec`, so no
/// process of the run ever escapes accounting. Which files are readable
/// depends on the controllers enabled in the parent's `cgroup.subtree_control`;
/// every reader therefore returns `None` rather than a zero.
use crate::config::types::{Result, RunError};
use std::ffi::{CStr, CString};
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Per-run cgroup
#[derive(Debug)]
pub struct CgroupV2 {
    path: PathBuf,
    procs_path: CString,
}

impl CgroupV2 {
    /// Create `parent/name`.
    pub fn create(parent: &Path, name: &str) -> Result<Self> {
        let path = parent.join(name);
        fs::create_dir(&path).map_err(|e| {
            RunError::Cgroup(format!("Failed to create cgroup {}: {}", path.display(), e))
        })?;

        let procs_path = CString::new(path.join("cgroup.procs").as_os_str().as_bytes())
            .map_err(|_| RunError::Cgroup(format!("Cgroup path contains NUL: {}", path.display())))?;

        Ok(Self { path, procs_path })
    }

    /// Create a run cgroup below the supervisor's own cgroup.
    pub fn create_for_run(parent: Option<&Path>, run_id: &str) -> Result<Self> {
        if !is_cgroup_v2_available() {
            return Err(RunError::Cgroup("cgroup v2 hierarchy not mounted".to_string()));
        }
        let parent = match parent {
            Some(parent) => parent.to_path_buf(),
            None => own_cgroup_dir()?,
        };
        Self::create(&parent, &format!("runexec-{}", run_id))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `cgroup.procs` as a C string, for use between fork and exec where
    /// allocation is not allowed
    pub fn procs_path(&self) -> &CStr {
        &self.procs_path
    }

    pub fn set_memory_limit(&self, limit_bytes: u64) -> Result<()> {
        let limit_path = self.path.join("memory.max");
        fs::write(&limit_path, limit_bytes.to_string())
            .map_err(|e| RunError::Cgroup(format!("Failed to set memory limit: {}", e)))?;

        // Disable swap so the limit is a real bound; absent without swap accounting.
        let swap_path = self.path.join("memory.swap.max");
        if swap_path.exists() {
            if let Err(e) = fs::write(&swap_path, "0") {
                log::debug!("Failed to set memory.swap.max: {}", e);
            }
        }
        Ok(())
    }

    /// Peak memory in bytes (`memory.peak`, kernel 5.19+)
    pub fn memory_peak(&self) -> Option<u64> {
        read_trimmed(&self.path.join("memory.peak"))?.parse().ok()
    }

    /// Total CPU time of all processes in the cgroup
    pub fn cpu_usage(&self) -> Option<Duration> {
        let content = read_trimmed(&self.path.join("cpu.stat"))?;
        parse_keyed_value(&content, "usage_usec").map(Duration::from_micros)
    }

    /// Bytes read and written to block devices
    pub fn io_bytes(&self) -> Option<(u64, u64)> {
        let content = read_trimmed(&self.path.join("io.stat"))?;
        Some(parse_io_stat(&content))
    }

    pub fn oom_kill_count(&self) -> u64 {
        read_trimmed(&self.path.join("memory.events"))
            .and_then(|content| parse_keyed_value(&content, "oom_kill"))
            .unwrap_or(0)
    }

    /// Kill every process left in the cgroup (`cgroup.kill`, kernel 5.14+).
    pub fn kill_all(&self) {
        let kill_path = self.path.join("cgroup.kill");
        if kill_path.exists() {
            if let Err(e) = fs::write(&kill_path, "1") {
                log::warn!("Failed to kill processes of {}: {}", self.path.display(), e);
            }
        }
    }

    /// Remove the cgroup directory; retries briefly while killed tasks exit.
    pub fn remove(&self) -> Result<()> {
        let mut last_err = None;
        for _ in 0..10 {
            match fs::remove_dir(&self.path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => {
                    last_err = Some(e);
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }
        Err(RunError::Cgroup(format!(
            "Failed to remove cgroup {}: {}",
            self.path.display(),
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

/// True when the unified hierarchy is mounted at [`CGROUP_ROOT`]
pub fn is_cgroup_v2_available() -> bool {
    Path::new(CGROUP_ROOT).join("cgroup.controllers").exists()
}

/// Cgroup directory of the current process
pub fn own_cgroup_dir() -> Result<PathBuf> {
    let content = fs::read_to_string("/proc/self/cgroup")
        .map_err(|e| RunError::Cgroup(format!("Failed to read /proc/self/cgroup: {}", e)))?;
    let relative = parse_unified_cgroup(&content)
        .ok_or_else(|| RunError::Cgroup("No unified cgroup entry for this process".to_string()))?;
    Ok(Path::new(CGROUP_ROOT).join(relative.trim_start_matches('/')))
}

/// Extract the path of the `0::` line from `/proc/<pid>/cgroup`
pub fn parse_unified_cgroup(content: &str) -> Option<&str> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("0::"))
        .map(str::trim)
}

/// Value of `key` in a flat-keyed file such as `cpu.stat` or `memory.events`
pub fn parse_keyed_value(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(k), Some(v)) if k == key => v.parse().ok(),
            _ => None,
        }
    })
}

/// Sum `rbytes`/`wbytes` over all devices of an `io.stat` file
pub fn parse_io_stat(content: &str) -> (u64, u64) {
    let mut read = 0u64;
    let mut written = 0u64;
    for line in content.lines() {
        for field in line.split_whitespace().skip(1) {
            if let Some((name, value)) = field.split_once('=') {
                let value: u64 = value.parse().unwrap_or(0);
                match name {
                    "rbytes" => read = read.saturating_add(value),
                    "wbytes" => written = written.saturating_add(value),
                    _ => {}
                }
            }
        }
    }
    (read, written)
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unified_cgroup() {
        let content = "12:cpu,cpuacct:/legacy\n0::/user.slice/user-1000.slice/session-2.scope\n";
        assert_eq!(
            parse_unified_cgroup(content),
            Some("/user.slice/user-1000.slice/session-2.scope")
        );
        assert_eq!(parse_unified_cgroup("1:name=systemd:/\n"), None);
    }

    #[test]
    fn test_parse_keyed_value() {
        let cpu_stat = "usage_usec 123456\nuser_usec 100000\nsystem_usec 23456\n";
        assert_eq!(parse_keyed_value(cpu_stat, "usage_usec"), Some(123456));
        assert_eq!(parse_keyed_value(cpu_stat, "nr_periods"), None);

        let events = "low 0\nhigh 0\nmax 4\noom 1\noom_kill 1\n";
        assert_eq!(parse_keyed_value(events, "oom_kill"), Some(1));
        assert_eq!(parse_keyed_value(events, "oom"), Some(1));
    }

    #[test]
    fn test_parse_io_stat() {
        let io_stat = "8:0 rbytes=4096 wbytes=8192 rios=1 wios=2 dbytes=0 dios=0\n\
                       259:0 rbytes=100 wbytes=0 rios=1 wios=0 dbytes=0 dios=0\n";
        assert_eq!(parse_io_stat(io_stat), (4196, 8192));
        assert_eq!(parse_io_stat(""), (0, 0));
    }

    #[test]
    fn test_cgroup_in_plain_directory() {
        let parent = std::env::temp_dir().join(format!("runexec-cgroup-test-{}", std::process::id()));
        fs::create_dir_all(&parent).unwrap();

        let cgroup = CgroupV2::create(&parent, "run").unwrap();
        assert_eq!(cgroup.path(), parent.join("run"));
        assert!(cgroup.procs_path().to_bytes().ends_with(b"run/cgroup.procs"));

        // Missing controller files read as unmeasured.
        assert_eq!(cgroup.memory_peak(), None);
        assert_eq!(cgroup.cpu_usage(), None);
        assert_eq!(cgroup.io_bytes(), None);
        assert_eq!(cgroup.oom_kill_count(), 0);

        cgroup.remove().unwrap();
        assert!(!parent.join("run").exists());
        let _ = fs::remove_dir(&parent);
    }
}
