//! Run supervision.
//!
//! The supervisor owns the run lifecycle: workspace, signal scope, engine
//! call and result normalization. Process handling itself lives behind the
//! engine seam in [`crate::exec`].

pub mod supervisor;
pub mod types;
