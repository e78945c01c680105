//! Core domain types used throughout xctl.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Target identifier - the UDID of a device or simulator.
///
/// # Example
/// ```
/// use xctl_common::Udid;
///
/// let udid = Udid::from("00008030-001A2D5E0C12802E");
/// assert_eq!(udid.as_str(), "00008030-001A2D5E0C12802E");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Udid(String);

impl Udid {
    /// Creates a new Udid from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the UDID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<&str> for Udid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Udid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for Udid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A network address announced by the companion process.
///
/// The port is always non-zero: an endpoint is only constructed from
/// evidence that the companion actually bound it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Creates an endpoint. Returns `None` for port 0.
    pub fn new(host: impl Into<String>, port: u16) -> Option<Self> {
        if port == 0 {
            return None;
        }
        Some(Self {
            host: host.into(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// URI suitable for a plaintext HTTP/2 channel.
    ///
    /// ```
    /// use xctl_common::Endpoint;
    ///
    /// let endpoint = Endpoint::new("localhost", 10882).unwrap();
    /// assert_eq!(endpoint.uri(), "http://localhost:10882");
    /// ```
    pub fn uri(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            // Bare IPv6 literal
            format!("http://[{}]:{}", self.host, self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Host operating system family.
///
/// The companion binary only exists for macOS, so most of xctl gates on
/// this before touching the filesystem or spawning anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    MacOs,
    Linux,
    Windows,
    Other,
}

impl Platform {
    /// The platform this binary was compiled for.
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "windows") {
            Platform::Windows
        } else {
            Platform::Other
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::MacOs => write!(f, "macos"),
            Platform::Linux => write!(f, "linux"),
            Platform::Windows => write!(f, "windows"),
            Platform::Other => write!(f, "other"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_rejects_zero_port() {
        assert!(Endpoint::new("localhost", 0).is_none());
        assert!(Endpoint::new("localhost", 1).is_some());
    }

    #[test]
    fn test_endpoint_uri() {
        let ep = Endpoint::new("127.0.0.1", 54321).unwrap();
        assert_eq!(ep.uri(), "http://127.0.0.1:54321");
        assert_eq!(ep.to_string(), "127.0.0.1:54321");

        let v6 = Endpoint::new("::1", 8080).unwrap();
        assert_eq!(v6.uri(), "http://[::1]:8080");
    }

    #[test]
    fn test_udid_empty() {
        assert!(Udid::from("  ").is_empty());
        assert!(!Udid::from("booted").is_empty());
    }
}
