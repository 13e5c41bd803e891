//! runexec: supervised execution of a single untrusted or benchmarked command
//!
//! A [`Supervisor`] runs one command under wall-clock and memory limits,
//! captures its output, and stops it cleanly when the supervising process
//! receives a termination signal. It returns a normalized [`RunResult`].
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::signal`]: Scoped signal handler installation
//! - [`kernel::cgroup`]: Per-run cgroup v2 accounting and memory limit
//! - [`kernel::energy`]: RAPL package energy counters
//!
//! ## Execution Control ([`exec`])
//! - [`exec::engine`]: The execution engine seam, raw results and stop token
//! - [`exec::process`]: Default engine spawning a plain child process group
//! - [`exec::resolve`]: Executable lookup
//!
//! ## Run Supervision ([`core`])
//! - [`core::supervisor`]: Workspace, signal scope and engine orchestration
//! - [`core::types`]: Normalized run result
//!
//! ## Safety & Cleanup ([`safety`])
//! - [`safety::workspace`]: Run-scoped temporary directory
//! - [`safety::safe_cleanup`]: Symlink-safe tree removal
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: Structured run events
//!
//! ## Configuration & Policy ([`config`])
//! - [`config::types`]: Run description and error type
//! - [`config::validator`]: Config validation
//! - [`config::policy`]: Directory visibility and isolation policy
//!
//! # Example
//!
//! ```no_run
//! use runexec::{RunConfig, Supervisor, SupervisorSettings};
//!
//! let config = RunConfig::new(["printf", "hello\n"])
//!     .with_env("PATH", "/usr/bin:/bin")
//!     .with_soft_time_limit(10)
//!     .with_memory_limit(256 * 1024 * 1024);
//!
//! let result = Supervisor::new(SupervisorSettings::default()).run(&config)?;
//! assert_eq!(result.stdout(), b"hello\n");
//! # Ok::<(), runexec::RunError>(())
//! ```

// Kernel Primitives
pub mod kernel;

// Execution Control
pub mod exec;

// Run supervision
pub mod core;

// Safety & Cleanup
pub mod safety;

// Observability
pub mod observability;

// Configuration & Policy
pub mod config;

pub use crate::config::policy::visibility::{DirMode, Enforcement, IsolationPolicy};
pub use crate::config::types::{Result, RunConfig, RunError};
pub use crate::core::supervisor::{Supervisor, SupervisorSettings};
pub use crate::core::types::RunResult;
pub use crate::exec::engine::{ExecutionEngine, ExecutionRequest, RawRunResult, StopToken};
pub use crate::exec::process::{EngineSettings, ProcessEngine};
