// Run configuration validation.
// Runs before any workspace or engine setup and fails fast with actionable errors,
// so an invalid config never spawns a child.

use crate::config::types::{Result, RunConfig, RunError};
use std::path::{Path, PathBuf};

/// Memory limits below this are accepted but almost certainly a mistake
const SUSPICIOUS_MEMORY_LIMIT: u64 = 1024 * 1024;

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validate a run config.
///
/// Returns the collected warnings on success and a single
/// [`RunError::Config`] listing every error otherwise.
pub fn validate_config(config: &RunConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    validate_command(config, &mut result);
    validate_environment(config, &mut result);
    validate_limits(config, &mut result);
    validate_paths(config, &mut result);

    if !result.is_valid() {
        return Err(RunError::Config(format!(
            "Run config validation failed:\n{}",
            result.errors.join("\n")
        )));
    }

    Ok(result)
}

fn validate_command(config: &RunConfig, result: &mut ValidationResult) {
    match config.command.first() {
        None => result.add_error("command must contain at least the executable".to_string()),
        Some(program) if program.is_empty() => {
            result.add_error("command executable must not be empty".to_string())
        }
        Some(_) => {}
    }

    for (index, arg) in config.command.iter().enumerate() {
        if arg.contains('\0') {
            result.add_error(format!("command argument {} contains a NUL byte", index));
        }
    }
}

fn validate_environment(config: &RunConfig, result: &mut ValidationResult) {
    for (key, value) in &config.environment {
        if key.is_empty() {
            result.add_error("environment variable name must not be empty".to_string());
        }
        if key.contains('=') || key.contains('\0') {
            result.add_error(format!("invalid environment variable name: {:?}", key));
        }
        if value.contains('\0') {
            result.add_error(format!("environment variable {} contains a NUL byte", key));
        }
    }
}

fn validate_limits(config: &RunConfig, result: &mut ValidationResult) {
    if config.soft_time_limit == Some(0) {
        result.add_error("soft_time_limit cannot be zero".to_string());
    }

    if config.hard_time_limit == Some(0) {
        result.add_error("hard_time_limit cannot be zero".to_string());
    }

    if let (Some(soft), Some(hard)) = (config.soft_time_limit, config.hard_time_limit) {
        if hard < soft {
            result.add_error(format!(
                "hard_time_limit ({}s) must be >= soft_time_limit ({}s)",
                hard, soft
            ));
        }
    }

    if let Some(memory_limit) = config.memory_limit {
        if memory_limit == 0 {
            result.add_error("memory_limit cannot be zero".to_string());
        } else if memory_limit < SUSPICIOUS_MEMORY_LIMIT {
            result.add_warning(format!(
                "memory_limit {} is very low (< 1MB), the child may fail to start",
                memory_limit
            ));
        }
    }
}

fn validate_paths(config: &RunConfig, result: &mut ValidationResult) {
    if let Err(e) = resolve_working_dir(&config.working_dir) {
        result.add_error(e.to_string());
    }

    for path in config.dir_modes.keys() {
        if path.as_os_str().is_empty() {
            result.add_error("directory visibility path must not be empty".to_string());
        }
    }

    if config.network_access {
        result.add_warning(
            "network_access is recorded but not enforced while namespace isolation is disabled"
                .to_string(),
        );
    }
}

/// Resolve the working directory to an absolute path and check that it is a
/// reachable directory.
pub fn resolve_working_dir(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| RunError::Config(format!("Cannot determine current directory: {}", e)))?
            .join(path)
    };

    let resolved = absolute.canonicalize().map_err(|e| {
        RunError::Config(format!(
            "working_dir {} is not reachable: {}",
            absolute.display(),
            e
        ))
    })?;

    if !resolved.is_dir() {
        return Err(RunError::Config(format!(
            "working_dir {} is not a directory",
            resolved.display()
        )));
    }

    Ok(resolved)
}
