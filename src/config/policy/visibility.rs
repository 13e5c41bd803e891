/// Filesystem visibility policy for the supervised child
///
/// The visibility map is handed to the isolation layer as-is. Namespace
/// isolation is currently disabled, so the map and the network flag are
/// recorded and reported but not enforced. Callers can check
/// [`IsolationPolicy::is_enforced`] instead of assuming a sandbox.
use crate::config::types::{Result, RunError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

/// Visibility of a directory inside the child's filesystem view
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DirMode {
    #[serde(rename = "read-only")]
    ReadOnly,
    #[serde(rename = "hidden")]
    Hidden,
    #[serde(rename = "full-access")]
    FullAccess,
    #[serde(rename = "overlay")]
    Overlay,
}

impl std::fmt::Display for DirMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirMode::ReadOnly => write!(f, "read-only"),
            DirMode::Hidden => write!(f, "hidden"),
            DirMode::FullAccess => write!(f, "full-access"),
            DirMode::Overlay => write!(f, "overlay"),
        }
    }
}

/// Baseline visibility applied to every run before caller overrides.
pub const BASELINE_DIR_MODES: &[(&str, DirMode)] = &[
    ("/", DirMode::ReadOnly),
    ("/home", DirMode::Hidden),
    ("/run", DirMode::Hidden),
    ("/tmp", DirMode::FullAccess),
    ("/var", DirMode::Hidden),
];

/// Whether the isolation layer actually enforces the policy
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Enforcement {
    /// Namespaces are set up and the policy is applied
    #[serde(rename = "enforced")]
    Enforced,
    /// Policy is recorded but the child sees the host filesystem and network
    #[serde(rename = "unenforced")]
    Unenforced,
}

/// Isolation configuration for one run
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IsolationPolicy {
    dir_modes: BTreeMap<PathBuf, DirMode>,
    network_access: bool,
    enforcement: Enforcement,
}

impl IsolationPolicy {
    /// Build the policy from caller overrides. Namespace isolation is off, so
    /// the result is always [`Enforcement::Unenforced`].
    pub fn new(overrides: &BTreeMap<PathBuf, DirMode>, network_access: bool) -> Result<Self> {
        Ok(Self {
            dir_modes: merge_dir_modes(overrides)?,
            network_access,
            enforcement: Enforcement::Unenforced,
        })
    }

    pub fn dir_modes(&self) -> &BTreeMap<PathBuf, DirMode> {
        &self.dir_modes
    }

    pub fn mode_of(&self, path: &Path) -> Option<DirMode> {
        self.dir_modes.get(path).copied()
    }

    pub fn network_access(&self) -> bool {
        self.network_access
    }

    pub fn enforcement(&self) -> Enforcement {
        self.enforcement
    }

    pub fn is_enforced(&self) -> bool {
        self.enforcement == Enforcement::Enforced
    }

    /// True when the caller asked for something beyond the baseline, i.e. when
    /// running unenforced silently differs from what was requested.
    pub fn deviates_from_baseline(&self) -> bool {
        self.network_access
            || self.dir_modes.len() != BASELINE_DIR_MODES.len()
            || BASELINE_DIR_MODES
                .iter()
                .any(|(path, mode)| self.dir_modes.get(Path::new(path)) != Some(mode))
    }
}

/// Merge caller overrides over [`BASELINE_DIR_MODES`].
///
/// Overrides replace baseline entries only for the exact same normalized path;
/// overriding a parent leaves baseline children untouched.
pub fn merge_dir_modes(overrides: &BTreeMap<PathBuf, DirMode>) -> Result<BTreeMap<PathBuf, DirMode>> {
    let mut merged: BTreeMap<PathBuf, DirMode> = BASELINE_DIR_MODES
        .iter()
        .map(|(path, mode)| (PathBuf::from(path), *mode))
        .collect();

    for (path, mode) in overrides {
        merged.insert(normalize_visibility_path(path)?, *mode);
    }

    Ok(merged)
}

/// Normalize a visibility path to absolute form.
///
/// Absolute paths are cleaned lexically (`.`, `..` and trailing separators).
/// Relative paths are resolved against the current directory, following
/// symlinks when the target exists.
pub fn normalize_visibility_path(path: &Path) -> Result<PathBuf> {
    if path.as_os_str().is_empty() {
        return Err(RunError::Config(
            "Directory visibility path must not be empty".to_string(),
        ));
    }

    if path.is_absolute() {
        return Ok(lexically_normalize(path));
    }

    let cwd = std::env::current_dir().map_err(|e| {
        RunError::Config(format!(
            "Cannot resolve relative visibility path {}: {}",
            path.display(),
            e
        ))
    })?;
    let joined = cwd.join(path);
    match joined.canonicalize() {
        Ok(resolved) => Ok(resolved),
        Err(_) => Ok(lexically_normalize(&joined)),
    }
}

fn lexically_normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
            Component::RootDir => normalized.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(part) => normalized.push(part),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_is_present_without_overrides() {
        let merged = merge_dir_modes(&BTreeMap::new()).unwrap();
        assert_eq!(merged.len(), 5);
        assert_eq!(merged[Path::new("/")], DirMode::ReadOnly);
        assert_eq!(merged[Path::new("/home")], DirMode::Hidden);
        assert_eq!(merged[Path::new("/run")], DirMode::Hidden);
        assert_eq!(merged[Path::new("/tmp")], DirMode::FullAccess);
        assert_eq!(merged[Path::new("/var")], DirMode::Hidden);
    }

    #[test]
    fn override_replaces_only_exact_path() {
        let mut overrides = BTreeMap::new();
        overrides.insert(PathBuf::from("/tmp"), DirMode::Hidden);
        let merged = merge_dir_modes(&overrides).unwrap();

        assert_eq!(merged[Path::new("/tmp")], DirMode::Hidden);
        assert_eq!(merged[Path::new("/var")], DirMode::Hidden);
        assert_eq!(merged[Path::new("/")], DirMode::ReadOnly);
    }

    #[test]
    fn parent_override_does_not_touch_children() {
        let mut overrides = BTreeMap::new();
        overrides.insert(PathBuf::from("/"), DirMode::FullAccess);
        let merged = merge_dir_modes(&overrides).unwrap();

        assert_eq!(merged[Path::new("/")], DirMode::FullAccess);
        assert_eq!(merged[Path::new("/home")], DirMode::Hidden);
    }

    #[test]
    fn override_paths_are_normalized() {
        let mut overrides = BTreeMap::new();
        overrides.insert(PathBuf::from("/tmp/./"), DirMode::Overlay);
        overrides.insert(PathBuf::from("/opt/tools/../data"), DirMode::ReadOnly);
        let merged = merge_dir_modes(&overrides).unwrap();

        assert_eq!(merged[Path::new("/tmp")], DirMode::Overlay);
        assert_eq!(merged[Path::new("/opt/data")], DirMode::ReadOnly);
        assert!(merged.keys().all(|p| p.is_absolute()));
    }

    #[test]
    fn relative_paths_become_absolute() {
        let normalized = normalize_visibility_path(Path::new("some/relative/dir")).unwrap();
        assert!(normalized.is_absolute());
        assert!(normalized.ends_with("some/relative/dir"));
    }

    #[test]
    fn empty_path_is_rejected() {
        assert!(matches!(
            normalize_visibility_path(Path::new("")),
            Err(RunError::Config(_))
        ));
    }

    #[test]
    fn policy_reports_unenforced() {
        let policy = IsolationPolicy::new(&BTreeMap::new(), false).unwrap();
        assert_eq!(policy.enforcement(), Enforcement::Unenforced);
        assert!(!policy.is_enforced());
        assert!(!policy.deviates_from_baseline());

        let policy = IsolationPolicy::new(&BTreeMap::new(), true).unwrap();
        assert!(policy.deviates_from_baseline());
    }
}
