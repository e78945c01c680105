//! Companion binary resolution.
//!
//! Resolution order, first match wins:
//!
//! 1. explicit `binary_path` from [`CompanionOptions`]
//! 2. the `IDB_COMPANION_PATH` environment variable
//! 3. a copy bundled next to the running executable
//!    (platform subdirectory, then flat, then development tree)
//! 4. common system install locations
//!
//! An explicit path or environment override that points at nothing fails
//! immediately; it never falls through to the later strategies.

use std::path::{Path, PathBuf};
use tracing::debug;
use xctl_common::Platform;

use crate::config::{CompanionOptions, BINARY_ENV_VAR};
use crate::error::{CompanionError, CompanionResult};

/// File name of the companion executable.
pub const BINARY_NAME: &str = "idb_companion";

/// The only platform the companion binary is built for.
pub const REQUIRED_PLATFORM: Platform = Platform::MacOs;

/// Resolves an absolute path to the companion executable.
#[derive(Debug, Clone)]
pub struct BinaryLocator {
    explicit: Option<PathBuf>,
    env_override: Option<PathBuf>,
    install_dir: Option<PathBuf>,
    system_paths: Vec<PathBuf>,
    host: Platform,
}

impl BinaryLocator {
    /// Builds a locator from options plus the live process environment.
    pub fn from_options(options: &CompanionOptions) -> Self {
        Self {
            explicit: options.binary_path.clone(),
            env_override: std::env::var_os(BINARY_ENV_VAR)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from),
            install_dir: std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(Path::to_path_buf)),
            system_paths: default_system_paths(),
            host: Platform::current(),
        }
    }

    /// A locator with no sources configured.
    pub fn empty() -> Self {
        Self {
            explicit: None,
            env_override: None,
            install_dir: None,
            system_paths: Vec::new(),
            host: Platform::current(),
        }
    }

    pub fn with_explicit_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit = Some(path.into());
        self
    }

    pub fn with_env_override(mut self, path: Option<PathBuf>) -> Self {
        self.env_override = path;
        self
    }

    pub fn with_install_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.install_dir = dir;
        self
    }

    pub fn with_system_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.system_paths = paths;
        self
    }

    /// Overrides the detected host platform.
    ///
    /// Used by tooling that drives a companion through a compatible shim
    /// on another OS.
    pub fn with_host_platform(mut self, host: Platform) -> Self {
        self.host = host;
        self
    }

    /// Resolves the companion path.
    pub fn locate(&self) -> CompanionResult<PathBuf> {
        if self.host != REQUIRED_PLATFORM {
            return Err(CompanionError::UnsupportedPlatform {
                required: REQUIRED_PLATFORM,
                actual: self.host,
            });
        }

        if let Some(explicit) = &self.explicit {
            return require_existing(explicit, "explicit binary path does not exist");
        }

        if let Some(env_path) = &self.env_override {
            return require_existing(
                env_path,
                &format!("{} points to a missing file", BINARY_ENV_VAR),
            );
        }

        let mut searched = Vec::new();

        if let Some(dir) = &self.install_dir {
            for candidate in bundled_candidates(dir) {
                if candidate.is_file() {
                    debug!(path = %candidate.display(), "Using bundled companion");
                    return Ok(absolute(candidate));
                }
                searched.push(candidate);
            }
        }

        for candidate in &self.system_paths {
            if candidate.is_file() {
                debug!(path = %candidate.display(), "Using system companion");
                return Ok(absolute(candidate.clone()));
            }
            searched.push(candidate.clone());
        }

        Err(CompanionError::binary_not_found(
            "no candidate location contains the companion",
            searched,
        ))
    }

    /// Same resolution as [`locate`](Self::locate), reported as a boolean.
    pub fn can_locate(&self) -> bool {
        self.locate().is_ok()
    }
}

/// Bundled layouts relative to the running executable, in priority order.
pub fn bundled_candidates(install_dir: &Path) -> Vec<PathBuf> {
    let platform_dir = format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH);
    vec![
        install_dir
            .join("companion")
            .join(platform_dir)
            .join("bin")
            .join(BINARY_NAME),
        install_dir.join(BINARY_NAME),
        // target/<profile>/ -> workspace vendor directory
        install_dir
            .join("..")
            .join("..")
            .join("vendor")
            .join("idb-companion")
            .join("bin")
            .join(BINARY_NAME),
    ]
}

/// Common Homebrew install locations.
pub fn default_system_paths() -> Vec<PathBuf> {
    [
        "/opt/homebrew/bin/idb_companion",
        "/usr/local/bin/idb_companion",
        "/opt/homebrew/opt/idb-companion/bin/idb_companion",
        "/usr/local/opt/idb-companion/bin/idb_companion",
    ]
    .iter()
    .map(PathBuf::from)
    .collect()
}

fn require_existing(path: &Path, reason: &str) -> CompanionResult<PathBuf> {
    if path.is_file() {
        Ok(absolute(path.to_path_buf()))
    } else {
        Err(CompanionError::binary_not_found(
            reason,
            vec![path.to_path_buf()],
        ))
    }
}

fn absolute(path: PathBuf) -> PathBuf {
    std::fs::canonicalize(&path).unwrap_or(path)
}
