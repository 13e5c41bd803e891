use crate::config::policy::visibility::IsolationPolicy;
use crate::config::types::{Result, RunConfig, RunError};
use crate::config::validator::{resolve_working_dir, validate_config};
use crate::core::types::RunResult;
use crate::exec::engine::{ExecutionEngine, ExecutionRequest, StopToken};
use crate::exec::process::{EngineSettings, ProcessEngine};
use crate::kernel::signal::SignalScope;
use crate::observability::audit::events;
use crate::safety::workspace::{default_workspace_root, Workspace};
use log::{debug, info, warn};
use nix::sys::signal::{SigHandler, Signal};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Signals that interrupt a supervised run
pub const TERMINATION_SIGNALS: [Signal; 3] = [Signal::SIGTERM, Signal::SIGQUIT, Signal::SIGINT];

/// Stop token of the run in flight. It is never freed, so a handler still
/// running on another thread after the run ends only touches dead state.
static RUN_STOP: StopToken = StopToken::new();

/// Set while a run owns [`RUN_STOP`]
static RUN_ACTIVE: AtomicBool = AtomicBool::new(false);

const NOTICE_CAPACITY: usize = 96;

/// Render the interruption notice for `sig` into `buf` without allocating.
fn format_notice(sig: libc::c_int, buf: &mut [u8; NOTICE_CAPACITY]) -> usize {
    let name = Signal::try_from(sig).map(Signal::as_str).unwrap_or("signal");

    let mut digits = [0u8; 10];
    let mut value = sig.unsigned_abs();
    let mut count = 0;
    loop {
        digits[count] = b'0' + (value % 10) as u8;
        value /= 10;
        count += 1;
        if value == 0 {
            break;
        }
    }
    digits[..count].reverse();

    let parts: [&[u8]; 5] = [
        b"runexec: caught ",
        name.as_bytes(),
        b" (",
        &digits[..count],
        b"), stopping supervised run\n",
    ];
    let mut len = 0;
    for part in parts {
        let end = (len + part.len()).min(NOTICE_CAPACITY);
        buf[len..end].copy_from_slice(&part[..end - len]);
        len = end;
    }
    len
}

extern "C" fn on_termination_signal(sig: libc::c_int) {
    let mut notice = [0u8; NOTICE_CAPACITY];
    let len = format_notice(sig, &mut notice);
    // SAFETY: write(2) is async-signal-safe.
    unsafe {
        libc::write(2, notice.as_ptr() as *const libc::c_void, len);
    }

    if RUN_ACTIVE.load(Ordering::SeqCst) {
        RUN_STOP.record_signal(sig);
        RUN_STOP.request_stop();
    }
}

/// Ownership of [`RUN_STOP`] for one run; released on drop
struct ActiveRun {
    _claim: (),
}

impl ActiveRun {
    fn register() -> Result<Self> {
        RUN_ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| RunError::Busy)?;
        RUN_STOP.reset();
        Ok(Self { _claim: () })
    }

    fn token(&self) -> &'static StopToken {
        &RUN_STOP
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        RUN_ACTIVE.store(false, Ordering::SeqCst);
    }
}

/// Settings of the default supervisor
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SupervisorSettings {
    /// Parent of run workspaces; a per-user temp directory when unset
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    #[serde(default)]
    pub engine: EngineSettings,
}

impl SupervisorSettings {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RunError::Config(format!("Failed to read settings {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            RunError::Config(format!("Failed to parse settings {}: {}", path.display(), e))
        })
    }
}

/// Supervises one run at a time on top of an [`ExecutionEngine`].
pub struct Supervisor<E: ExecutionEngine = ProcessEngine> {
    engine: E,
    workspace_root: PathBuf,
}

impl Supervisor<ProcessEngine> {
    pub fn new(settings: SupervisorSettings) -> Self {
        Self {
            engine: ProcessEngine::new(settings.engine),
            workspace_root: settings.workspace_root.unwrap_or_else(default_workspace_root),
        }
    }
}

impl Default for Supervisor<ProcessEngine> {
    fn default() -> Self {
        Self::new(SupervisorSettings::default())
    }
}

impl<E: ExecutionEngine> Supervisor<E> {
    pub fn with_engine(engine: E, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            workspace_root: workspace_root.into(),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Run `config` to completion and return its normalized result.
    ///
    /// A SIGTERM, SIGQUIT or SIGINT received during the run stops the child and
    /// fails with [`RunError::Interrupted`]. The run workspace is removed on
    /// every path; a removal failure after a successful run is only logged.
    pub fn run(&self, config: &RunConfig) -> Result<RunResult> {
        let validation = validate_config(config)?;
        for warning in &validation.warnings {
            warn!("{}", warning);
        }
        let working_dir = resolve_working_dir(&config.working_dir)?;
        let isolation = IsolationPolicy::new(&config.dir_modes, config.network_access)?;

        let workspace = Workspace::create(&self.workspace_root)?;
        let run_id = workspace.run_id().to_string();
        let run_dir = workspace.run_dir().to_path_buf();

        let outcome = self.run_in_workspace(config, &working_dir, &isolation, &workspace);

        match (outcome, workspace.close()) {
            (Ok(result), Ok(())) => Ok(result),
            (Ok(result), Err(cleanup)) => {
                warn!("Run {} succeeded but cleanup failed: {}", run_id, cleanup);
                events::cleanup_failure(&run_id, &run_dir, &cleanup);
                Ok(result)
            }
            (Err(primary), Ok(())) => Err(primary),
            (Err(primary), Err(cleanup)) => {
                events::cleanup_failure(&run_id, &run_dir, &cleanup);
                Err(RunError::CleanupAfterFailure {
                    primary: Box::new(primary),
                    cleanup: Box::new(cleanup),
                })
            }
        }
    }

    fn run_in_workspace(
        &self,
        config: &RunConfig,
        working_dir: &Path,
        isolation: &IsolationPolicy,
        workspace: &Workspace,
    ) -> Result<RunResult> {
        let run_id = workspace.run_id();

        let isolation_enforced = isolation.is_enforced() && self.engine.enforces_isolation();
        if !isolation_enforced {
            if isolation.deviates_from_baseline() {
                events::isolation_unenforced(
                    run_id,
                    format!(
                        "Directory visibility {:?} and network access {} are not enforced",
                        isolation.dir_modes(),
                        isolation.network_access()
                    ),
                );
            } else {
                debug!("Run {} executes without namespace isolation", run_id);
            }
        }

        let stdout_path = workspace.stdout_path();
        let stderr_path = workspace.stderr_path();
        let hard_time_limit = config.effective_hard_time_limit();
        let request = ExecutionRequest {
            run_id,
            args: &config.command,
            environment: &config.environment,
            working_dir,
            stdout_path: &stdout_path,
            stderr_path: &stderr_path,
            soft_time_limit: config.soft_time_limit.map(Duration::from_secs),
            hard_time_limit: hard_time_limit.map(Duration::from_secs),
            memory_limit: config.memory_limit,
            isolation,
        };

        info!(
            "Run {}: {:?} in {} (soft {:?}s, hard {:?}s, memory {:?})",
            run_id,
            config.command,
            working_dir.display(),
            config.soft_time_limit,
            hard_time_limit,
            config.memory_limit
        );
        events::run_start(run_id, &config.command);

        let (raw, caught) = {
            let registration = ActiveRun::register()?;
            let stop = registration.token();
            let scope = SignalScope::install(
                TERMINATION_SIGNALS
                    .iter()
                    .map(|sig| (*sig, SigHandler::Handler(on_termination_signal))),
            )?;
            let raw = self.engine.execute_run(&request, stop);
            drop(scope);
            (raw, stop.caught_signal())
        };

        if caught != 0 {
            let signal = Signal::try_from(caught)?;
            events::signal_caught(run_id, caught);
            if let Err(e) = &raw {
                debug!("Discarding engine error of interrupted run {}: {}", run_id, e);
            }
            return Err(RunError::Interrupted { signal });
        }
        let raw = raw?;

        let stdout = workspace.read_output(&stdout_path)?;
        let stderr = workspace.read_output(&stderr_path)?;
        let result = RunResult::from_raw(&raw, stdout, stderr, isolation_enforced);

        events::run_end(run_id, result.exit_code(), result.termination_reason());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::engine::{keys, ProcessExit, RawRunResult, RawValue};
    use crate::kernel::signal::{current_disposition, SIGNAL_TEST_LOCK};
    use crate::safety::workspace::fault;
    use std::sync::Mutex;

    /// Engine that optionally raises a signal and records the request
    #[derive(Default)]
    struct ScriptedEngine {
        raise: Option<Signal>,
        fail: bool,
        seen_hard_limit: Mutex<Option<Duration>>,
    }

    impl ExecutionEngine for ScriptedEngine {
        fn execute_run(&self, request: &ExecutionRequest<'_>, stop: &StopToken) -> Result<RawRunResult> {
            *self.seen_hard_limit.lock().unwrap() = request.hard_time_limit;
            std::fs::write(request.stdout_path, b"scripted\n").unwrap();
            if let Some(sig) = self.raise {
                nix::sys::signal::raise(sig).unwrap();
                assert!(stop.is_stop_requested());
            }
            if self.fail {
                return Err(RunError::Engine("spawn failed".to_string()));
            }
            let mut raw = RawRunResult::new();
            raw.insert(keys::EXIT_CODE, RawValue::Exit(ProcessExit::from_raw(0)));
            Ok(raw)
        }
    }

    fn test_root(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("runexec-sup-{}-{}", name, std::process::id()))
    }

    fn assert_root_empty(root: &Path) {
        let leftovers: Vec<_> = std::fs::read_dir(root).unwrap().collect();
        assert!(leftovers.is_empty(), "workspace not removed: {:?}", leftovers);
        let _ = std::fs::remove_dir(root);
    }

    #[test]
    fn test_successful_run_normalized() {
        let _lock = SIGNAL_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let root = test_root("ok");
        let supervisor = Supervisor::with_engine(ScriptedEngine::default(), &root);

        let config = RunConfig::new(["true"]).with_working_dir("/").with_soft_time_limit(10);
        let result = supervisor.run(&config).unwrap();
        assert!(result.success());
        assert_eq!(result.stdout(), b"scripted\n");
        assert!(!result.isolation_enforced());
        assert_eq!(
            *supervisor.engine().seen_hard_limit.lock().unwrap(),
            Some(Duration::from_secs(11))
        );
        assert_root_empty(&root);
    }

    #[test]
    fn test_signal_wins_over_engine_result() {
        let _lock = SIGNAL_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let before = current_disposition(Signal::SIGINT).unwrap();
        let root = test_root("signal");
        let engine = ScriptedEngine {
            raise: Some(Signal::SIGINT),
            ..ScriptedEngine::default()
        };
        let supervisor = Supervisor::with_engine(engine, &root);

        let err = supervisor
            .run(&RunConfig::new(["true"]).with_working_dir("/"))
            .unwrap_err();
        assert_eq!(err.interrupted_by(), Some(Signal::SIGINT));
        assert_eq!(current_disposition(Signal::SIGINT).unwrap(), before);
        assert!(!RUN_ACTIVE.load(Ordering::SeqCst));
        assert_root_empty(&root);
    }

    #[test]
    fn test_engine_error_propagated() {
        let _lock = SIGNAL_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let root = test_root("engine-error");
        let engine = ScriptedEngine {
            fail: true,
            ..ScriptedEngine::default()
        };
        let supervisor = Supervisor::with_engine(engine, &root);

        let err = supervisor
            .run(&RunConfig::new(["true"]).with_working_dir("/"))
            .unwrap_err();
        assert!(matches!(err, RunError::Engine(ref msg) if msg == "spawn failed"));
        assert_root_empty(&root);
    }

    #[test]
    fn test_invalid_config_never_reaches_engine() {
        let _lock = SIGNAL_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let root = test_root("config");
        let supervisor = Supervisor::with_engine(ScriptedEngine::default(), &root);

        let _ = std::fs::remove_dir_all(&root);

        let config = RunConfig::new(["true"]).with_working_dir("/nonexistent/runexec/dir");
        let err = supervisor.run(&config).unwrap_err();
        assert!(matches!(err, RunError::Config(_)));
        assert_eq!(*supervisor.engine().seen_hard_limit.lock().unwrap(), None);
        assert!(!root.exists(), "workspace root created for a rejected config");

        let err = supervisor.run(&RunConfig::new(Vec::<String>::new())).unwrap_err();
        assert!(matches!(err, RunError::Config(_)));
        assert!(!root.exists());
    }

    #[test]
    fn test_concurrent_run_is_busy() {
        let _lock = SIGNAL_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let registration = ActiveRun::register().unwrap();

        let root = test_root("busy");
        let supervisor = Supervisor::with_engine(ScriptedEngine::default(), &root);
        let err = supervisor
            .run(&RunConfig::new(["true"]).with_working_dir("/"))
            .unwrap_err();
        assert!(matches!(err, RunError::Busy));
        assert!(matches!(ActiveRun::register(), Err(RunError::Busy)));

        drop(registration);
        assert!(!RUN_ACTIVE.load(Ordering::SeqCst));
        assert_root_empty(&root);
    }

    #[test]
    fn test_signal_after_run_leaves_token_alone() {
        let _lock = SIGNAL_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        drop(ActiveRun::register().unwrap());

        on_termination_signal(libc::SIGTERM);
        assert_eq!(RUN_STOP.caught_signal(), 0);
        assert!(!RUN_STOP.is_stop_requested());
    }

    #[test]
    fn test_new_run_starts_with_fresh_token() {
        let _lock = SIGNAL_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        {
            let registration = ActiveRun::register().unwrap();
            on_termination_signal(libc::SIGQUIT);
            assert_eq!(registration.token().caught_signal(), libc::SIGQUIT);
        }

        let registration = ActiveRun::register().unwrap();
        assert_eq!(registration.token().caught_signal(), 0);
        assert!(!registration.token().is_stop_requested());
    }

    #[test]
    fn test_notice_names_signal() {
        let mut buf = [0u8; NOTICE_CAPACITY];
        let len = format_notice(libc::SIGTERM, &mut buf);
        assert_eq!(
            &buf[..len],
            b"runexec: caught SIGTERM (15), stopping supervised run\n"
        );

        let len = format_notice(200, &mut buf);
        assert_eq!(
            &buf[..len],
            b"runexec: caught signal (200), stopping supervised run\n"
        );
    }

    #[test]
    fn test_cleanup_failure_after_success_keeps_result() {
        let _lock = SIGNAL_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let root = test_root("cleanup-ok");
        let supervisor = Supervisor::with_engine(ScriptedEngine::default(), &root);

        fault::fail_next_close();
        let result = supervisor
            .run(&RunConfig::new(["true"]).with_working_dir("/"))
            .unwrap();
        assert!(result.success());
        assert_eq!(result.stdout(), b"scripted\n");
        assert_root_empty(&root);
    }

    #[test]
    fn test_cleanup_failure_after_engine_error_is_chained() {
        let _lock = SIGNAL_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let root = test_root("cleanup-err");
        let engine = ScriptedEngine {
            fail: true,
            ..ScriptedEngine::default()
        };
        let supervisor = Supervisor::with_engine(engine, &root);

        fault::fail_next_close();
        let err = supervisor
            .run(&RunConfig::new(["true"]).with_working_dir("/"))
            .unwrap_err();
        match err {
            RunError::CleanupAfterFailure { primary, cleanup } => {
                assert!(matches!(*primary, RunError::Engine(ref msg) if msg == "spawn failed"));
                assert!(matches!(*cleanup, RunError::Cleanup { .. }));
            }
            other => panic!("expected chained cleanup failure, got {:?}", other),
        }
        assert_root_empty(&root);
    }
}
