/// Core types and structures for runexec
use crate::config::policy::visibility::DirMode;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Description of one supervised run.
///
/// Constructed by the caller and treated as immutable for the duration of
/// [`Supervisor::run`](crate::core::supervisor::Supervisor::run).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    /// Argument tokens, the first one names the executable
    pub command: Vec<String>,
    /// Working directory of the child (relative paths resolve against the current directory)
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    /// The complete child environment; nothing is inherited from the supervisor
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Directory visibility overrides, merged over the fixed baseline
    #[serde(default)]
    pub dir_modes: BTreeMap<PathBuf, DirMode>,
    /// Soft wall-clock limit in seconds
    #[serde(default)]
    pub soft_time_limit: Option<u64>,
    /// Hard wall-clock limit in seconds (derived from the soft limit when absent)
    #[serde(default)]
    pub hard_time_limit: Option<u64>,
    /// Memory limit in bytes
    #[serde(default)]
    pub memory_limit: Option<u64>,
    /// Network access for the child. Accepted but not enforced while namespace
    /// isolation is disabled.
    #[serde(default)]
    pub network_access: bool,
}

fn default_working_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
}

impl RunConfig {
    /// Create a config for `command` with every other field at its default.
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_dir_mode(mut self, path: impl Into<PathBuf>, mode: DirMode) -> Self {
        self.dir_modes.insert(path.into(), mode);
        self
    }

    pub fn with_soft_time_limit(mut self, seconds: u64) -> Self {
        self.soft_time_limit = Some(seconds);
        self
    }

    pub fn with_hard_time_limit(mut self, seconds: u64) -> Self {
        self.hard_time_limit = Some(seconds);
        self
    }

    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn with_network_access(mut self, allowed: bool) -> Self {
        self.network_access = allowed;
        self
    }

    /// Effective hard time limit: the explicit one, or `ceil(soft * 1.1)`.
    ///
    /// Computed in integer arithmetic so that e.g. a soft limit of 10 yields
    /// exactly 11 instead of a float-rounded 12.
    pub fn effective_hard_time_limit(&self) -> Option<u64> {
        match (self.hard_time_limit, self.soft_time_limit) {
            (Some(hard), _) => Some(hard),
            (None, Some(soft)) => Some(soft.saturating_mul(11).div_ceil(10)),
            (None, None) => None,
        }
    }

    /// Load a run description from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RunError::Config(format!("Failed to read run config {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            RunError::Config(format!("Failed to parse run config {}: {}", path.display(), e))
        })
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            command: vec!["true".to_string()],
            working_dir: default_working_dir(),
            environment: BTreeMap::new(),
            dir_modes: BTreeMap::new(),
            soft_time_limit: None,
            hard_time_limit: None,
            memory_limit: None,
            network_access: false,
        }
    }
}

/// Errors surfaced by a supervised run
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Run interrupted by signal {signal}")]
    Interrupted { signal: Signal },

    #[error("Execution engine error: {0}")]
    Engine(String),

    #[error("Signal handler error: {0}")]
    Signal(String),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Another supervised run is already active in this process")]
    Busy,

    #[error("Failed to remove workspace {}: {source}", path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{primary} (workspace cleanup also failed: {cleanup})")]
    CleanupAfterFailure {
        #[source]
        primary: Box<RunError>,
        cleanup: Box<RunError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunError {
    /// The signal that interrupted the run, looking through cleanup chaining.
    pub fn interrupted_by(&self) -> Option<Signal> {
        match self {
            RunError::Interrupted { signal } => Some(*signal),
            RunError::CleanupAfterFailure { primary, .. } => primary.interrupted_by(),
            _ => None,
        }
    }
}

impl From<nix::errno::Errno> for RunError {
    fn from(err: nix::errno::Errno) -> Self {
        RunError::Engine(err.to_string())
    }
}

/// Result type alias for runexec operations
pub type Result<T> = std::result::Result<T, RunError>;
