//! Execution control
//!
//! The engine seam and its default process-based implementation.

pub mod engine;
pub mod process;
pub mod resolve;
