use crate::exec::engine::{keys, RawRunResult};
use serde_json::{json, Value};

/// Exit code reported when the engine produced no usable exit status
pub const UNKNOWN_EXIT_CODE: i32 = 255;

/// Normalized outcome of one supervised run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunResult {
    exit_code: i32,
    exit_signal: Option<i32>,
    exit_status_raw: Option<i32>,
    wall_time: Option<f64>,
    cpu_time: Option<f64>,
    memory: Option<u64>,
    blkio_read: Option<u64>,
    blkio_write: Option<u64>,
    cpu_energy: Option<f64>,
    termination_reason: Option<String>,
    success: bool,
    isolation_enforced: bool,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl RunResult {
    /// Normalize an engine result. Measurements the engine did not report
    /// stay `None`.
    pub fn from_raw(
        raw: &RawRunResult,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        isolation_enforced: bool,
    ) -> Self {
        let exit = raw.exit();
        let exit_code = exit
            .and_then(|e| e.normalized_code())
            .unwrap_or(UNKNOWN_EXIT_CODE);

        Self {
            exit_code,
            exit_signal: exit.and_then(|e| e.signal()),
            exit_status_raw: exit.map(|e| e.raw()),
            wall_time: raw.float(keys::WALL_TIME),
            cpu_time: raw.float(keys::CPU_TIME),
            memory: raw.int(keys::MEMORY),
            blkio_read: raw.int(keys::BLKIO_READ),
            blkio_write: raw.int(keys::BLKIO_WRITE),
            cpu_energy: raw.float(keys::CPU_ENERGY),
            termination_reason: raw.text(keys::TERMINATION_REASON).map(str::to_string),
            success: exit_code == 0,
            isolation_enforced,
            stdout,
            stderr,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Signal that terminated the child, if it did not exit on its own
    pub fn exit_signal(&self) -> Option<i32> {
        self.exit_signal
    }

    /// Undecoded wait status: `code << 8` for an exit, the signal number for
    /// a kill
    pub fn exit_status_raw(&self) -> Option<i32> {
        self.exit_status_raw
    }

    /// Wall-clock seconds
    pub fn wall_time(&self) -> Option<f64> {
        self.wall_time
    }

    /// CPU seconds, user plus system
    pub fn cpu_time(&self) -> Option<f64> {
        self.cpu_time
    }

    /// Peak memory in bytes
    pub fn memory(&self) -> Option<u64> {
        self.memory
    }

    pub fn blkio_read(&self) -> Option<u64> {
        self.blkio_read
    }

    pub fn blkio_write(&self) -> Option<u64> {
        self.blkio_write
    }

    /// CPU package energy in joules
    pub fn cpu_energy(&self) -> Option<f64> {
        self.cpu_energy
    }

    pub fn termination_reason(&self) -> Option<&str> {
        self.termination_reason.as_deref()
    }

    pub fn success(&self) -> bool {
        self.success
    }

    /// Whether directory visibility and network settings were applied
    pub fn isolation_enforced(&self) -> bool {
        self.isolation_enforced
    }

    pub fn stdout(&self) -> &[u8] {
        &self.stdout
    }

    pub fn stderr(&self) -> &[u8] {
        &self.stderr
    }

    /// JSON view for harness logs; output streams are decoded lossily
    pub fn to_json(&self) -> Value {
        json!({
            "exit_code": self.exit_code,
            "exit_signal": self.exit_signal,
            "exit_status_raw": self.exit_status_raw,
            "wall_time": self.wall_time,
            "cpu_time": self.cpu_time,
            "memory": self.memory,
            "blkio_read": self.blkio_read,
            "blkio_write": self.blkio_write,
            "cpu_energy": self.cpu_energy,
            "termination_reason": self.termination_reason,
            "success": self.success,
            "isolation_enforced": self.isolation_enforced,
            "stdout": String::from_utf8_lossy(&self.stdout),
            "stderr": String::from_utf8_lossy(&self.stderr),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::engine::{ProcessExit, RawValue};

    #[test]
    fn test_normalizes_successful_run() {
        let mut raw = RawRunResult::new();
        raw.insert(keys::EXIT_CODE, RawValue::Exit(ProcessExit::from_raw(0)));
        raw.insert(keys::WALL_TIME, RawValue::Float(0.25));
        raw.insert(keys::CPU_TIME, RawValue::Float(0.01));
        raw.insert(keys::MEMORY, RawValue::Int(2 * 1024 * 1024));

        let result = RunResult::from_raw(&raw, b"hello\n".to_vec(), Vec::new(), false);
        assert!(result.success());
        assert_eq!(result.exit_code(), 0);
        assert_eq!(result.exit_signal(), None);
        assert_eq!(result.wall_time(), Some(0.25));
        assert_eq!(result.memory(), Some(2 * 1024 * 1024));
        assert_eq!(result.stdout(), b"hello\n");
        assert!(result.stderr().is_empty());
        assert!(!result.isolation_enforced());
    }

    #[test]
    fn test_missing_measurements_stay_absent() {
        let mut raw = RawRunResult::new();
        raw.insert(keys::EXIT_CODE, RawValue::Exit(ProcessExit::from_raw(1 << 8)));

        let result = RunResult::from_raw(&raw, Vec::new(), Vec::new(), false);
        assert_eq!(result.exit_code(), 1);
        assert_eq!(result.exit_status_raw(), Some(256));
        assert!(!result.success());
        assert_eq!(result.cpu_energy(), None);
        assert_eq!(result.cpu_time(), None);
        assert_eq!(result.blkio_read(), None);
        assert_eq!(result.termination_reason(), None);
    }

    #[test]
    fn test_missing_exit_status_is_255() {
        let result = RunResult::from_raw(&RawRunResult::new(), Vec::new(), Vec::new(), false);
        assert_eq!(result.exit_code(), UNKNOWN_EXIT_CODE);
        assert_eq!(result.exit_status_raw(), None);
        assert!(!result.success());
    }

    #[test]
    fn test_killed_child() {
        let mut raw = RawRunResult::new();
        raw.insert(keys::EXIT_CODE, RawValue::Exit(ProcessExit::from_raw(libc::SIGKILL)));
        raw.insert(keys::TERMINATION_REASON, RawValue::Text("walltime".to_string()));

        let result = RunResult::from_raw(&raw, Vec::new(), Vec::new(), false);
        assert_eq!(result.exit_code(), 128 + libc::SIGKILL);
        assert_eq!(result.exit_signal(), Some(libc::SIGKILL));
        assert_eq!(result.exit_status_raw(), Some(libc::SIGKILL));
        assert_eq!(result.termination_reason(), Some("walltime"));
    }

    #[test]
    fn test_to_json() {
        let mut raw = RawRunResult::new();
        raw.insert(keys::EXIT_CODE, RawValue::Exit(ProcessExit::from_raw(0)));
        let result = RunResult::from_raw(&raw, b"ok\xff".to_vec(), Vec::new(), false);

        let value = result.to_json();
        assert_eq!(value["exit_code"], 0);
        assert_eq!(value["success"], true);
        assert_eq!(value["cpu_energy"], Value::Null);
        assert_eq!(value["stdout"], "ok\u{fffd}");

        let mut raw = RawRunResult::new();
        raw.insert(keys::EXIT_CODE, RawValue::Exit(ProcessExit::from_raw(3 << 8)));
        let value = RunResult::from_raw(&raw, Vec::new(), Vec::new(), false).to_json();
        assert_eq!(value["exit_code"], 3);
        assert_eq!(value["exit_status_raw"], 3 << 8);
    }
}
