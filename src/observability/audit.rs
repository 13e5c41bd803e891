/// Run audit events
///
/// Lifecycle events of supervised runs, correlated by workspace run id. Events
/// always go through the `log` facade; after [`init_audit_log`] they are also
/// appended to a JSON-lines audit file.
use crate::config::types::{Result, RunError};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::SystemTime;

/// Event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditSeverity {
    Critical,
    High,
    Medium,
    Low,
}

/// Types of run events we track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunEventType {
    RunStart,
    RunEnd,
    SignalCaught,
    LimitExceeded,
    IsolationUnenforced,
    CleanupFailure,
}

impl RunEventType {
    pub fn default_severity(&self) -> AuditSeverity {
        match self {
            RunEventType::RunStart | RunEventType::RunEnd => AuditSeverity::Low,
            RunEventType::LimitExceeded => AuditSeverity::Medium,
            RunEventType::IsolationUnenforced => AuditSeverity::Medium,
            RunEventType::SignalCaught => AuditSeverity::High,
            RunEventType::CleanupFailure => AuditSeverity::Critical,
        }
    }
}

/// One audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub event_type: RunEventType,
    pub severity: AuditSeverity,
    pub timestamp: SystemTime,
    pub run_id: String,
    pub details: String,
    pub command: Option<Vec<String>>,
    pub path: Option<PathBuf>,
}

impl RunEvent {
    pub fn new(event_type: RunEventType, run_id: &str, details: String) -> Self {
        Self {
            event_type,
            severity: event_type.default_severity(),
            timestamp: SystemTime::now(),
            run_id: run_id.to_string(),
            details,
            command: None,
            path: None,
        }
    }

    pub fn with_command(mut self, command: &[String]) -> Self {
        self.command = Some(command.to_vec());
        self
    }

    pub fn with_path(mut self, path: &Path) -> Self {
        self.path = Some(path.to_path_buf());
        self
    }

    pub fn with_severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// JSON-lines record written to the audit file
    pub fn to_json(&self) -> serde_json::Value {
        let mut entry = serde_json::json!({
            "timestamp": self.timestamp
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            "event_type": self.event_type,
            "severity": self.severity,
            "run_id": self.run_id,
            "details": self.details,
            "process_id": std::process::id(),
        });
        if let Some(command) = &self.command {
            entry["command"] = serde_json::json!(command);
        }
        if let Some(path) = &self.path {
            entry["path"] = serde_json::json!(path.display().to_string());
        }
        entry
    }
}

fn log_event(event: &RunEvent) {
    match event.severity {
        AuditSeverity::Critical | AuditSeverity::High => {
            error!("AUDIT {:?} [{}]: {}", event.event_type, event.run_id, event.details)
        }
        AuditSeverity::Medium => {
            warn!("AUDIT {:?} [{}]: {}", event.event_type, event.run_id, event.details)
        }
        AuditSeverity::Low => {
            info!("AUDIT {:?} [{}]: {}", event.event_type, event.run_id, event.details)
        }
    }
}

/// File-backed audit trail
pub struct AuditLog {
    file: Mutex<File>,
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                RunError::Config(format!("Failed to create audit log directory: {}", e))
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| RunError::Config(format!("Failed to open audit log: {}", e)))?;

        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    pub fn record(&self, event: &RunEvent) {
        log_event(event);

        let Ok(mut file) = self.file.lock() else {
            error!("Failed to acquire lock on audit log");
            return;
        };
        if let Err(e) = writeln!(file, "{}", event.to_json()) {
            error!("Failed to write to audit log: {}", e);
        }
        if let Err(e) = file.flush() {
            error!("Failed to flush audit log: {}", e);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

static AUDIT_LOG: OnceLock<AuditLog> = OnceLock::new();

/// Start appending events to `path`. Only the first call takes effect.
pub fn init_audit_log(path: PathBuf) -> Result<()> {
    let log = AuditLog::new(path)?;
    let path = log.path().to_path_buf();
    if AUDIT_LOG.set(log).is_err() {
        warn!("Audit log already initialized; ignoring {}", path.display());
    } else {
        info!("Audit log initialized at {}", path.display());
    }
    Ok(())
}

/// Record an event through the global audit log, or only through `log`
pub fn record_event(event: RunEvent) {
    match AUDIT_LOG.get() {
        Some(audit) => audit.record(&event),
        None => log_event(&event),
    }
}

/// Convenience functions for the events the supervisor emits
pub mod events {
    use super::*;

    pub fn run_start(run_id: &str, command: &[String]) {
        record_event(
            RunEvent::new(RunEventType::RunStart, run_id, format!("Starting {:?}", command))
                .with_command(command),
        );
    }

    pub fn run_end(run_id: &str, exit_code: i32, termination_reason: Option<&str>) {
        let details = match termination_reason {
            Some(reason) => format!("Exited with {} ({})", exit_code, reason),
            None => format!("Exited with {}", exit_code),
        };
        record_event(RunEvent::new(RunEventType::RunEnd, run_id, details));
    }

    pub fn signal_caught(run_id: &str, signal: i32) {
        record_event(RunEvent::new(
            RunEventType::SignalCaught,
            run_id,
            format!("Run interrupted by signal {}", signal),
        ));
    }

    /// `limit` is in the unit of `kind`: seconds for time, bytes for memory
    pub fn limit_exceeded(run_id: &str, kind: &str, limit: Option<u64>) {
        let details = match limit {
            Some(limit) => format!("{} limit {} exceeded", kind, limit),
            None => format!("{} limit exceeded", kind),
        };
        record_event(RunEvent::new(RunEventType::LimitExceeded, run_id, details));
    }

    pub fn isolation_unenforced(run_id: &str, details: String) {
        record_event(RunEvent::new(RunEventType::IsolationUnenforced, run_id, details));
    }

    pub fn cleanup_failure(run_id: &str, path: &Path, error: &dyn std::fmt::Display) {
        record_event(
            RunEvent::new(
                RunEventType::CleanupFailure,
                run_id,
                format!("Failed to remove workspace: {}", error),
            )
            .with_path(path),
        );
    }
}
