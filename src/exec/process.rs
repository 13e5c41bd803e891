//! Default execution engine: a directly spawned child in its own process group.
//!
//! Time limits are wall-clock. At the soft limit the group gets SIGTERM, at
//! the hard limit SIGKILL. A stop request sends SIGTERM and escalates to
//! SIGKILL after [`EngineSettings::kill_grace`]. Memory is bounded through the
//! run cgroup when one is available and through `RLIMIT_AS` otherwise.

use crate::config::types::{Result, RunError};
use crate::exec::engine::{
    keys, ExecutionEngine, ExecutionRequest, ProcessExit, RawRunResult, RawValue, StopToken,
};
use crate::exec::resolve::resolve_executable;
use crate::kernel::cgroup::CgroupV2;
use crate::kernel::energy::EnergySample;
use crate::observability::audit::events;
use log::{debug, info, warn};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::fs::File;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Termination reasons reported under [`keys::TERMINATION_REASON`]
pub mod reasons {
    pub const WALLTIME_SOFT: &str = "walltime-soft";
    pub const WALLTIME: &str = "walltime";
    pub const MEMORY: &str = "memory";
    pub const KILLED: &str = "killed";
}

/// Tunables of [`ProcessEngine`]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineSettings {
    /// How often the child is checked for exit and limits
    pub poll_interval: Duration,
    /// Delay between SIGTERM and SIGKILL after a stop request
    pub kill_grace: Duration,
    /// Try to account the run in its own cgroup v2
    pub cgroup_accounting: bool,
    /// Delegated cgroup to create run cgroups in; defaults to our own cgroup
    pub cgroup_parent: Option<PathBuf>,
    /// Read RAPL counters around the run
    pub measure_energy: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            kill_grace: Duration::from_secs(1),
            cgroup_accounting: true,
            cgroup_parent: None,
            measure_energy: true,
        }
    }
}

/// Runs the command as a plain child process; no namespace isolation.
#[derive(Clone, Debug, Default)]
pub struct ProcessEngine {
    settings: EngineSettings,
}

impl ProcessEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn create_cgroup(&self, run_id: &str) -> Option<CgroupV2> {
        if !self.settings.cgroup_accounting {
            return None;
        }
        match CgroupV2::create_for_run(self.settings.cgroup_parent.as_deref(), run_id) {
            Ok(cgroup) => {
                debug!("Accounting run {} in {}", run_id, cgroup.path().display());
                Some(cgroup)
            }
            Err(e) => {
                debug!("Cgroup accounting unavailable, using rusage: {}", e);
                None
            }
        }
    }
}

impl ExecutionEngine for ProcessEngine {
    fn execute_run(&self, request: &ExecutionRequest<'_>, stop: &StopToken) -> Result<RawRunResult> {
        let program_name = request
            .args
            .first()
            .ok_or_else(|| RunError::Engine("Empty command provided".to_string()))?;
        let program = resolve_executable(program_name, request.environment, request.working_dir)?;

        let stdout = create_output(request.stdout_path)?;
        let stderr = create_output(request.stderr_path)?;

        let mut cgroup = self.create_cgroup(request.run_id);
        let mut address_space_limit = request.memory_limit;
        if let (Some(limit), Some(cg)) = (request.memory_limit, cgroup.as_ref()) {
            match cg.set_memory_limit(limit) {
                Ok(()) => address_space_limit = None,
                Err(e) => warn!("{}; falling back to RLIMIT_AS", e),
            }
        }

        let mut command = Command::new(&program);
        command
            .arg0(program_name)
            .args(&request.args[1..])
            .env_clear()
            .envs(request.environment)
            .current_dir(request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0);

        let procs_path: Option<CString> = cgroup.as_ref().map(|cg| cg.procs_path().to_owned());
        // SAFETY: the hook only calls async-signal-safe functions and does not
        // allocate.
        unsafe {
            command.pre_exec(move || {
                if let Some(path) = &procs_path {
                    join_cgroup(path);
                }
                if let Some(limit) = address_space_limit {
                    set_address_space_limit(0, limit)?;
                }
                Ok(())
            });
        }

        let energy_before = if self.settings.measure_energy {
            EnergySample::read()
        } else {
            None
        };

        let started = Instant::now();
        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                if let Some(cg) = cgroup.as_ref() {
                    if let Err(remove_err) = cg.remove() {
                        warn!("{}", remove_err);
                    }
                }
                return Err(RunError::Engine(format!(
                    "Failed to start {}: {}",
                    program.display(),
                    e
                )));
            }
        };
        drop(command);
        let pid = child.id() as libc::pid_t;
        stop.attach_process_group(pid);
        info!("Started {} (pid {}) for run {}", program.display(), pid, request.run_id);

        if let Some(cg) = cgroup.as_ref() {
            if !process_in_cgroup(pid, cg) {
                warn!(
                    "Child {} did not join {}; falling back to rusage accounting",
                    pid,
                    cg.path().display()
                );
                if let Some(limit) = request.memory_limit.filter(|_| address_space_limit.is_none()) {
                    if let Err(e) = set_address_space_limit(pid, limit) {
                        warn!("Failed to apply RLIMIT_AS to {}: {}", pid, e);
                    }
                }
                if let Err(e) = cg.remove() {
                    debug!("{}", e);
                }
                cgroup = None;
            }
        }

        let mut monitor = LimitMonitor::new(request, self.settings.kill_grace, pid);
        let monitored = loop {
            match has_exited(pid) {
                Ok(true) => break Ok(()),
                Ok(false) => {}
                Err(e) => break Err(e),
            }
            monitor.check(started.elapsed(), stop, cgroup.as_ref(), request.run_id);
            std::thread::sleep(self.settings.poll_interval);
        };

        // The exited leader still holds its pid, so the group id cannot have
        // been reused yet; take down anything it left behind.
        signal_group(pid, Signal::SIGKILL);
        if let Some(cg) = cgroup.as_ref() {
            cg.kill_all();
        }
        stop.detach_process_group();
        let reaped = reap(pid);
        let wall_time = started.elapsed();
        drop(child);

        let energy_after = energy_before.as_ref().and_then(|_| EnergySample::read());

        let measured = monitored.and(reaped).map(|(status, usage)| {
            let mut raw = RawRunResult::new();
            raw.insert(keys::EXIT_CODE, RawValue::Exit(ProcessExit::from_raw(status)));
            raw.insert(keys::WALL_TIME, RawValue::Float(wall_time.as_secs_f64()));

            let cg = cgroup.as_ref();
            let cpu_time = cg
                .and_then(CgroupV2::cpu_usage)
                .unwrap_or_else(|| rusage_cpu_time(&usage));
            raw.insert(keys::CPU_TIME, RawValue::Float(cpu_time.as_secs_f64()));

            let memory = cg
                .and_then(CgroupV2::memory_peak)
                .unwrap_or(usage.ru_maxrss.max(0) as u64 * 1024);
            raw.insert(keys::MEMORY, RawValue::Int(memory));

            let (blkio_read, blkio_write) = cg.and_then(CgroupV2::io_bytes).unwrap_or((
                usage.ru_inblock.max(0) as u64 * 512,
                usage.ru_oublock.max(0) as u64 * 512,
            ));
            raw.insert(keys::BLKIO_READ, RawValue::Int(blkio_read));
            raw.insert(keys::BLKIO_WRITE, RawValue::Int(blkio_write));

            let energy = energy_before
                .as_ref()
                .zip(energy_after.as_ref())
                .and_then(|(before, after)| before.joules_until(after));
            raw.insert_opt(keys::CPU_ENERGY, energy.map(RawValue::Float));

            let mut reason = monitor.reason;
            if let Some(cg) = cg {
                if cg.oom_kill_count() > 0 && reason.is_none() {
                    events::limit_exceeded(request.run_id, reasons::MEMORY, request.memory_limit);
                    reason = Some(reasons::MEMORY);
                }
            }
            raw.insert_opt(
                keys::TERMINATION_REASON,
                reason.map(|r| RawValue::Text(r.to_string())),
            );
            raw
        });

        if let Some(cg) = cgroup.as_ref() {
            if let Err(e) = cg.remove() {
                warn!("{}", e);
            }
        }

        measured
    }
}

/// Limit and stop bookkeeping for one child
struct LimitMonitor {
    pgid: libc::pid_t,
    soft: Option<Duration>,
    hard: Option<Duration>,
    memory_limit: Option<u64>,
    kill_grace: Duration,
    soft_sent: bool,
    term_sent_at: Option<Duration>,
    kill_sent: bool,
    reason: Option<&'static str>,
}

impl LimitMonitor {
    fn new(request: &ExecutionRequest<'_>, kill_grace: Duration, pgid: libc::pid_t) -> Self {
        Self {
            pgid,
            soft: request.soft_time_limit,
            hard: request.hard_time_limit,
            memory_limit: request.memory_limit,
            kill_grace,
            soft_sent: false,
            term_sent_at: None,
            kill_sent: false,
            reason: None,
        }
    }

    fn check(&mut self, elapsed: Duration, stop: &StopToken, cgroup: Option<&CgroupV2>, run_id: &str) {
        if self.kill_sent {
            return;
        }

        if stop.is_stop_requested() {
            match self.term_sent_at {
                None => {
                    info!("Stop requested, terminating process group {}", self.pgid);
                    signal_group(self.pgid, Signal::SIGTERM);
                    self.term_sent_at = Some(elapsed);
                    self.reason = Some(reasons::KILLED);
                }
                Some(sent) if elapsed.saturating_sub(sent) >= self.kill_grace => {
                    warn!("Process group {} ignored SIGTERM, killing", self.pgid);
                    self.kill(reasons::KILLED);
                }
                Some(_) => {}
            }
            return;
        }

        if let Some(hard) = self.hard {
            if elapsed >= hard {
                events::limit_exceeded(run_id, reasons::WALLTIME, Some(hard.as_secs()));
                self.kill(reasons::WALLTIME);
                return;
            }
        }

        if let Some(soft) = self.soft {
            if elapsed >= soft && !self.soft_sent {
                events::limit_exceeded(run_id, reasons::WALLTIME_SOFT, Some(soft.as_secs()));
                signal_group(self.pgid, Signal::SIGTERM);
                self.soft_sent = true;
                self.reason = Some(reasons::WALLTIME_SOFT);
                // Without a hard limit the soft one has to be enforced eventually.
                if self.hard.is_none() {
                    self.term_sent_at = Some(elapsed);
                }
            }
        }

        if let Some(sent) = self.term_sent_at {
            if elapsed.saturating_sub(sent) >= self.kill_grace {
                self.kill(self.reason.unwrap_or(reasons::WALLTIME));
                return;
            }
        }

        if let Some(cg) = cgroup {
            if cg.oom_kill_count() > 0 && self.reason.is_none() {
                events::limit_exceeded(run_id, reasons::MEMORY, self.memory_limit);
                self.kill(reasons::MEMORY);
            }
        }
    }

    fn kill(&mut self, reason: &'static str) {
        signal_group(self.pgid, Signal::SIGKILL);
        self.kill_sent = true;
        self.reason = Some(reason);
    }
}

fn create_output(path: &std::path::Path) -> Result<File> {
    File::create(path).map_err(|e| {
        RunError::Engine(format!("Failed to create output file {}: {}", path.display(), e))
    })
}

fn signal_group(pgid: libc::pid_t, signal: Signal) {
    match killpg(Pid::from_raw(pgid), signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!("Failed to send {} to process group {}: {}", signal, pgid, e),
    }
}

/// Move the calling process into the cgroup. Runs between fork and exec.
/// Failure is detected by the parent through [`process_in_cgroup`].
fn join_cgroup(procs_path: &CString) {
    // SAFETY: open/write/close are async-signal-safe and the path outlives the call.
    unsafe {
        let fd = libc::open(procs_path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
        if fd >= 0 {
            libc::write(fd, b"0".as_ptr() as *const libc::c_void, 1);
            libc::close(fd);
        }
    }
}

/// Apply `RLIMIT_AS` to `pid` (0 for the calling process).
fn set_address_space_limit(pid: libc::pid_t, limit: u64) -> std::io::Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: limit as libc::rlim_t,
        rlim_max: limit as libc::rlim_t,
    };
    // SAFETY: prlimit only reads `rlim`; it is async-signal-safe.
    let rc = unsafe { libc::prlimit(pid, libc::RLIMIT_AS, &rlim, std::ptr::null_mut()) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

fn process_in_cgroup(pid: libc::pid_t, cgroup: &CgroupV2) -> bool {
    let Ok(content) = std::fs::read_to_string(format!("/proc/{}/cgroup", pid)) else {
        return false;
    };
    let Some(relative) = crate::kernel::cgroup::parse_unified_cgroup(&content) else {
        return false;
    };
    let expected = cgroup
        .path()
        .strip_prefix(crate::kernel::cgroup::CGROUP_ROOT)
        .map(|p| std::path::Path::new("/").join(p));
    expected.map(|p| p == std::path::Path::new(relative)).unwrap_or(false)
}

/// Non-reaping exit check, so the pid stays reserved until [`reap`].
fn has_exited(pid: libc::pid_t) -> Result<bool> {
    loop {
        // SAFETY: siginfo_t is plain data; zeroed means "no child" for WNOHANG.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOHANG | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            // SAFETY: si_pid is valid for SIGCHLD-style siginfo filled by waitid.
            return Ok(unsafe { info.si_pid() } != 0);
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(RunError::Engine(format!("waitid({}) failed: {}", pid, err)));
    }
}

fn reap(pid: libc::pid_t) -> Result<(i32, libc::rusage)> {
    let mut status: libc::c_int = 0;
    // SAFETY: rusage is plain data filled by the kernel.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        let rc = unsafe { libc::wait4(pid, &mut status, 0, &mut usage) };
        if rc == pid {
            return Ok((status, usage));
        }
        let err = std::io::Error::last_os_error();
        if rc < 0 && err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(RunError::Engine(format!("wait4({}) failed: {}", pid, err)));
    }
}

fn rusage_cpu_time(usage: &libc::rusage) -> Duration {
    let to_duration = |tv: &libc::timeval| {
        Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
    };
    to_duration(&usage.ru_utime) + to_duration(&usage.ru_stime)
}
