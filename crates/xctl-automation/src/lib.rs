//! # xctl Automation
//!
//! Device and simulator automation on top of the companion core.
//!
//! An [`AutomationSession`] owns one supervisor/channel pair for one
//! target. Each verb goes through the resilient executor, so a corrupted
//! channel is rebuilt transparently; screenshots additionally fall back to
//! `xcrun simctl` when the companion cannot deliver one.

pub mod error;
pub mod fallback;
pub mod session;

pub use error::{AutomationError, AutomationResult};
pub use fallback::{CaptureFallback, SimctlScreenshot};
pub use session::{AutomationSession, Destination, InstalledArtifact, LogTail, XctestRun};
