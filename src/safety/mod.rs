//! Safety and cleanup
//!
//! Run-scoped workspaces and their symlink-safe removal.

pub mod safe_cleanup;
pub mod workspace;

pub use workspace::{default_workspace_root, Workspace};
