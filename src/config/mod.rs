//! Configuration and policy
//!
//! Run description, validation, and isolation policy.

pub mod policy;
pub mod types;
pub mod validator;
