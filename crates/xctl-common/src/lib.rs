//! # xctl Common
//!
//! Common types and errors shared across the xctl crates.
//!
//! This crate provides the foundational pieces every other xctl crate
//! builds upon: the target/endpoint domain types and the general error
//! taxonomy used outside the companion core.

pub mod errors;
pub mod types;

// Re-export commonly used items
pub use errors::{Error, ProcessError, ProcessResult, Result};
pub use types::{Endpoint, Platform, Udid};
