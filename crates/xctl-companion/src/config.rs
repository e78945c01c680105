//! Companion configuration.
//!
//! `CompanionOptions` is supplied once when a supervisor is built and is
//! read-only afterwards. It can be assembled in code with the builder
//! methods or loaded from YAML:
//!
//! ```yaml
//! companion:
//!   target: 5A1B7C2E-0D3F-4E8A-9B6C-1D2E3F4A5B6C
//!   binary_path: /opt/homebrew/bin/idb_companion
//!   startup_timeout: 20s
//!   operation_timeout: 2m
//!   verbose: true
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use xctl_common::Udid;

/// Environment variable that overrides the companion binary location.
pub const BINARY_ENV_VAR: &str = "IDB_COMPANION_PATH";

/// Top-level configuration file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanionConfig {
    pub companion: CompanionOptions,
}

/// Immutable companion configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanionOptions {
    /// Explicit binary path. When set, no other location is consulted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_path: Option<PathBuf>,

    /// Port requested from the companion (0 = let it choose).
    #[serde(default)]
    pub requested_port: u16,

    /// Host the channel connects to once the port is known.
    #[serde(default = "default_host")]
    pub host: String,

    /// Device or simulator UDID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Udid>,

    #[serde(default = "default_startup_timeout", with = "duration_serde")]
    pub startup_timeout: Duration,

    #[serde(default = "default_shutdown_timeout", with = "duration_serde")]
    pub shutdown_timeout: Duration,

    #[serde(default = "default_operation_timeout", with = "duration_serde")]
    pub operation_timeout: Duration,

    /// Channel rebuilds allowed per logical call.
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: u32,

    /// Pass `--log DEBUG` to the companion.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for CompanionOptions {
    fn default() -> Self {
        Self {
            binary_path: None,
            requested_port: 0,
            host: default_host(),
            target: None,
            startup_timeout: default_startup_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
            operation_timeout: default_operation_timeout(),
            max_reconnects: default_max_reconnects(),
            verbose: false,
        }
    }
}

impl CompanionOptions {
    pub fn new(target: impl Into<Udid>) -> Self {
        Self {
            target: Some(target.into()),
            ..Default::default()
        }
    }

    pub fn with_binary_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.binary_path = Some(path.into());
        self
    }

    pub fn with_requested_port(mut self, port: u16) -> Self {
        self.requested_port = port;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_max_reconnects(mut self, max_reconnects: u32) -> Self {
        self.max_reconnects = max_reconnects;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Validate the options
    pub fn validate(&self) -> Result<()> {
        if self.startup_timeout.is_zero() {
            bail!("startup_timeout must be greater than zero");
        }
        if self.shutdown_timeout.is_zero() {
            bail!("shutdown_timeout must be greater than zero");
        }
        if self.operation_timeout.is_zero() {
            bail!("operation_timeout must be greater than zero");
        }
        if self.host.trim().is_empty() {
            bail!("host must not be empty");
        }
        if let Some(target) = &self.target {
            if target.is_empty() {
                bail!("target must not be blank when set");
            }
        }
        Ok(())
    }
}

impl CompanionConfig {
    /// Load configuration from a YAML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        Self::load_from_string(&content)
    }

    /// Load configuration from a YAML string
    pub fn load_from_string(content: &str) -> Result<Self> {
        let config: CompanionConfig =
            serde_yaml::from_str(content).context("Failed to parse YAML configuration")?;

        config.companion.validate()?;
        Ok(config)
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_startup_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_operation_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_max_reconnects() -> u32 {
    3
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Parses `"250ms"`, `"10s"` or `"2m"`.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    // "ms" before "s" since "ms" ends with 's'
    if let Some(num) = s.strip_suffix("ms") {
        let millis: u64 = num.parse().map_err(|_| format!("Invalid duration: {}", s))?;
        Ok(Duration::from_millis(millis))
    } else if let Some(num) = s.strip_suffix('s') {
        let secs: u64 = num.parse().map_err(|_| format!("Invalid duration: {}", s))?;
        Ok(Duration::from_secs(secs))
    } else if let Some(num) = s.strip_suffix('m') {
        let mins: u64 = num.parse().map_err(|_| format!("Invalid duration: {}", s))?;
        Ok(Duration::from_secs(mins * 60))
    } else {
        Err(format!("Duration must end with 's', 'ms', or 'm': {}", s))
    }
}
