//! # xctl Process
//!
//! Low-level process operations used by the companion supervisor.
//!
//! This crate provides primitives for:
//! - Process existence verification
//! - Process-group termination (graceful and forced)
//!
//! The companion is spawned as the leader of its own process group, so
//! signalling the group reaches every descendant it forks.

pub mod check;
pub mod terminate;

pub use check::*;
pub use terminate::*;
