//! Thin wrappers around Linux kernel primitives.
//!
//! Most `unsafe` code is concentrated here with explicit SAFETY comments.

pub mod cgroup;
pub mod energy;
pub mod signal;
