//! Port discovery from companion output.
//!
//! The companion announces its listening port on stdout or stderr in one
//! of two shapes:
//!
//! ```text
//! {"grpc_swift_port":10883,"grpc_port":10882}
//! Started GRPC server on [::]:10882
//! ```
//!
//! [`parse_port_announcement`] recognises both. [`PortSignal`] turns the
//! per-line callbacks from two independent readers into a single value
//! the startup routine can await: the first offer wins, later offers are
//! ignored.

use lazy_static::lazy_static;
use parking_lot::Mutex;
use regex::Regex;
use std::sync::Arc;
use tokio::sync::oneshot;

lazy_static! {
    /// `"port": N` or `"grpc_port": N` anywhere in the line.
    static ref STRUCTURED_PORT: Regex =
        Regex::new(r#""(?:grpc_)?port"\s*:\s*(-?\d+)"#).expect("structured port pattern");

    /// Free-text banner ending in `:N`.
    static ref BANNER_PORT: Regex = Regex::new(
        r"(?i)\b(?:server started on|started (?:grpc )?server on)\b.*:(-?\d+)\b"
    )
    .expect("banner port pattern");
}

/// Extracts an announced port from one output line.
///
/// Only values in `1..=65535` count; zero, negative, and out-of-range
/// numbers in an announcement-shaped line are ignored.
pub fn parse_port_announcement(line: &str) -> Option<u16> {
    STRUCTURED_PORT
        .captures_iter(line)
        .chain(BANNER_PORT.captures_iter(line))
        .filter_map(|caps| caps.get(1))
        .find_map(|m| valid_port(m.as_str()))
}

fn valid_port(raw: &str) -> Option<u16> {
    let value: i64 = raw.parse().ok()?;
    if (1..=i64::from(u16::MAX)).contains(&value) {
        Some(value as u16)
    } else {
        None
    }
}

/// One-shot, first-writer-wins port signal.
///
/// Clones share the same slot. When every clone is dropped without an
/// offer, the receiver observes a closed channel.
#[derive(Debug, Clone)]
pub struct PortSignal {
    sender: Arc<Mutex<Option<oneshot::Sender<u16>>>>,
}

impl PortSignal {
    pub fn new() -> (Self, oneshot::Receiver<u16>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                sender: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Resolves the signal. Returns `true` only for the winning offer.
    pub fn offer(&self, port: u16) -> bool {
        match self.sender.lock().take() {
            Some(tx) => tx.send(port).is_ok(),
            None => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.sender.lock().is_none()
    }
}
