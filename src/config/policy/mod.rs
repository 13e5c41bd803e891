//! Policy modules

pub mod visibility;

pub use visibility::{merge_dir_modes, DirMode, Enforcement, IsolationPolicy};
