//! Execution engine seam.
//!
//! An [`ExecutionEngine`] creates the child, enforces limits and measures it.
//! The supervisor only configures it, hands it a [`StopToken`] and normalizes
//! the [`RawRunResult`] it returns.

use crate::config::policy::visibility::IsolationPolicy;
use crate::config::types::Result;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

/// Raw result keys reported by engines
pub mod keys {
    pub const EXIT_CODE: &str = "exitcode";
    pub const WALL_TIME: &str = "walltime";
    pub const CPU_TIME: &str = "cputime";
    pub const MEMORY: &str = "memory";
    pub const BLKIO_READ: &str = "blkio_read";
    pub const BLKIO_WRITE: &str = "blkio_write";
    pub const CPU_ENERGY: &str = "cpuenergy";
    pub const TERMINATION_REASON: &str = "terminationreason";
}

/// Everything an engine needs to run one command to completion
#[derive(Debug)]
pub struct ExecutionRequest<'a> {
    /// Workspace run id, for naming per-run kernel objects and log correlation
    pub run_id: &'a str,
    pub args: &'a [String],
    /// The complete child environment
    pub environment: &'a BTreeMap<String, String>,
    pub working_dir: &'a Path,
    pub stdout_path: &'a Path,
    pub stderr_path: &'a Path,
    pub soft_time_limit: Option<Duration>,
    pub hard_time_limit: Option<Duration>,
    pub memory_limit: Option<u64>,
    pub isolation: &'a IsolationPolicy,
}

/// Process that runs a request to completion.
pub trait ExecutionEngine {
    /// Run the request, blocking until the child terminates or is stopped.
    ///
    /// Engines must poll `stop` and end the run promptly once a stop was
    /// requested; the returned result is then discarded by the supervisor.
    fn execute_run(&self, request: &ExecutionRequest<'_>, stop: &StopToken) -> Result<RawRunResult>;

    /// Whether the engine applies [`IsolationPolicy`] to the child.
    fn enforces_isolation(&self) -> bool {
        false
    }
}

/// Decoded wait status of the child
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessExit {
    raw: i32,
}

impl ProcessExit {
    pub fn from_raw(raw: i32) -> Self {
        Self { raw }
    }

    /// Wait status as returned by `wait4`
    pub fn raw(&self) -> i32 {
        self.raw
    }

    /// Exit value if the child exited normally
    pub fn code(&self) -> Option<i32> {
        if libc::WIFEXITED(self.raw) {
            Some(libc::WEXITSTATUS(self.raw))
        } else {
            None
        }
    }

    /// Terminating signal if the child was killed
    pub fn signal(&self) -> Option<i32> {
        if libc::WIFSIGNALED(self.raw) {
            Some(libc::WTERMSIG(self.raw))
        } else {
            None
        }
    }

    /// Shell-style exit code: the exit value, or `128 + signal`
    pub fn normalized_code(&self) -> Option<i32> {
        self.code().or_else(|| self.signal().map(|sig| 128 + sig))
    }
}

/// One raw measurement
#[derive(Clone, Debug, PartialEq)]
pub enum RawValue {
    Exit(ProcessExit),
    Float(f64),
    Int(u64),
    Text(String),
}

/// Key-value result of one engine run; keys are listed in [`keys`]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawRunResult {
    values: BTreeMap<String, RawValue>,
}

impl RawRunResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: RawValue) {
        self.values.insert(key.to_string(), value);
    }

    /// Insert only when a measurement exists
    pub fn insert_opt(&mut self, key: &str, value: Option<RawValue>) {
        if let Some(value) = value {
            self.insert(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&RawValue> {
        self.values.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn exit(&self) -> Option<ProcessExit> {
        match self.values.get(keys::EXIT_CODE) {
            Some(RawValue::Exit(exit)) => Some(*exit),
            _ => None,
        }
    }

    pub fn float(&self, key: &str) -> Option<f64> {
        match self.values.get(key) {
            Some(RawValue::Float(v)) => Some(*v),
            Some(RawValue::Int(v)) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn int(&self, key: &str) -> Option<u64> {
        match self.values.get(key) {
            Some(RawValue::Int(v)) => Some(*v),
            Some(RawValue::Float(v)) if *v >= 0.0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.values.get(key) {
            Some(RawValue::Text(v)) => Some(v),
            _ => None,
        }
    }
}

/// Cross-context stop request for one run.
///
/// Written from a signal handler, so every operation is a plain atomic or an
/// async-signal-safe syscall.
#[derive(Debug)]
pub struct StopToken {
    requested: AtomicBool,
    process_group: AtomicI32,
    caught_signal: AtomicI32,
}

impl StopToken {
    pub const fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            process_group: AtomicI32::new(0),
            caught_signal: AtomicI32::new(0),
        }
    }

    /// Ask the engine to stop. Sends SIGTERM to the attached process group,
    /// if any. Calling it again repeats the SIGTERM and is otherwise a no-op.
    pub fn request_stop(&self) {
        self.requested.store(true, Ordering::SeqCst);
        let pgid = self.process_group.load(Ordering::SeqCst);
        if pgid > 0 {
            // SAFETY: kill(2) is async-signal-safe.
            unsafe {
                libc::kill(-pgid, libc::SIGTERM);
            }
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Remember which signal triggered the stop; the first one wins
    pub fn record_signal(&self, sig: libc::c_int) {
        let _ = self
            .caught_signal
            .compare_exchange(0, sig, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Signal recorded by [`record_signal`](Self::record_signal), 0 if none
    pub fn caught_signal(&self) -> i32 {
        self.caught_signal.load(Ordering::SeqCst)
    }

    /// Let stop requests reach the child's process group directly.
    ///
    /// A stop that was requested before the child existed is delivered now.
    pub fn attach_process_group(&self, pgid: i32) {
        self.process_group.store(pgid, Ordering::SeqCst);
        if self.is_stop_requested() {
            self.request_stop();
        }
    }

    /// Forget the process group; must happen before the group leader is reaped.
    pub fn detach_process_group(&self) {
        self.process_group.store(0, Ordering::SeqCst);
    }

    /// Return to the fresh state so a long-lived token can serve another run.
    pub fn reset(&self) {
        self.process_group.store(0, Ordering::SeqCst);
        self.caught_signal.store(0, Ordering::SeqCst);
        self.requested.store(false, Ordering::SeqCst);
    }
}

impl Default for StopToken {
    fn default() -> Self {
        Self::new()
    }
}
