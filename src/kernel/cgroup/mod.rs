//! Cgroup v2 accounting

pub mod v2;

pub use v2::{is_cgroup_v2_available, own_cgroup_dir, parse_unified_cgroup, CgroupV2, CGROUP_ROOT};
