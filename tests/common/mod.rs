//! Shared helpers for integration tests

#![allow(dead_code)]

use runexec::exec::engine::{keys, ProcessExit, RawValue};
use runexec::{ExecutionEngine, ExecutionRequest, RawRunResult, Result, StopToken};
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Supervised runs and signal tables are process-wide; tests take this first.
static SERIAL: Mutex<()> = Mutex::new(());

pub fn serial() -> MutexGuard<'static, ()> {
    let _ = env_logger::builder().is_test(true).try_init();
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

/// Fresh, empty directory unique to this test process, private to the owner
/// so it is accepted as a workspace root
pub fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("runexec-it-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).unwrap();
    dir
}

pub fn assert_dir_empty(dir: &Path) {
    let leftovers: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert!(leftovers.is_empty(), "left behind: {:?}", leftovers);
}

/// Owned copy of what an engine was asked to do
#[derive(Clone, Debug, Default)]
pub struct RecordedRequest {
    pub args: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub working_dir: PathBuf,
    pub soft_time_limit: Option<Duration>,
    pub hard_time_limit: Option<Duration>,
    pub memory_limit: Option<u64>,
    pub dir_modes: Vec<(PathBuf, runexec::DirMode)>,
}

/// Engine that records the request and reports a clean exit
#[derive(Default)]
pub struct RecordingEngine {
    pub requests: Mutex<Vec<RecordedRequest>>,
    pub stdout: Vec<u8>,
}

impl RecordingEngine {
    pub fn last_request(&self) -> RecordedRequest {
        self.requests.lock().unwrap().last().cloned().unwrap()
    }
}

impl ExecutionEngine for RecordingEngine {
    fn execute_run(&self, request: &ExecutionRequest<'_>, _stop: &StopToken) -> Result<RawRunResult> {
        self.requests.lock().unwrap().push(RecordedRequest {
            args: request.args.to_vec(),
            environment: request.environment.clone(),
            working_dir: request.working_dir.to_path_buf(),
            soft_time_limit: request.soft_time_limit,
            hard_time_limit: request.hard_time_limit,
            memory_limit: request.memory_limit,
            dir_modes: request
                .isolation
                .dir_modes()
                .iter()
                .map(|(path, mode)| (path.clone(), *mode))
                .collect(),
        });
        std::fs::write(request.stdout_path, &self.stdout)?;

        let mut raw = RawRunResult::new();
        raw.insert(keys::EXIT_CODE, RawValue::Exit(ProcessExit::from_raw(0)));
        raw.insert(keys::WALL_TIME, RawValue::Float(0.0));
        Ok(raw)
    }
}
