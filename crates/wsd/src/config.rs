// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;
use std::path::PathBuf;

/// Configuration for the document coordinator.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "docbay-wsd", about = "Collaborative document WebSocket coordinator.")]
pub struct WsdConfig {
    /// Port number to listen on.
    #[arg(long, default_value_t = 9980, env = "DOCBAY_PORT")]
    pub port: u16,

    /// Directory where the persistent tile cache is kept.
    #[arg(long, default_value = "/var/cache/docbay", env = "DOCBAY_CACHE")]
    pub cache: PathBuf,

    /// Template tree with shared libraries etc used as source for worker
    /// chroot jails.
    #[arg(long, env = "DOCBAY_SYSTEMPLATE")]
    pub systemplate: Option<PathBuf>,

    /// Office installation tree copied (linked) into worker jails.
    #[arg(long, env = "DOCBAY_LOTEMPLATE")]
    pub lotemplate: Option<PathBuf>,

    /// Directory under which the chroot jails for workers are created.
    #[arg(long, env = "DOCBAY_CHILDROOT")]
    pub childroot: Option<PathBuf>,

    /// Relative path where the office tree lives inside a jail.
    #[arg(long, default_value = "lo", env = "DOCBAY_LOSUBPATH")]
    pub losubpath: String,

    /// Number of workers kept started in advance, waiting for new clients.
    #[arg(long, default_value_t = 10, env = "DOCBAY_NUMPRESPAWNS")]
    pub numprespawns: usize,

    /// Interactive testing.
    #[arg(long)]
    pub test: bool,

    /// Admin console credentials. Environment-only; the admin endpoint stays
    /// disabled while these are unset.
    #[arg(long, hide = true, env = "DOCBAY_ADMIN_USER")]
    pub admin_user: Option<String>,

    #[arg(long, hide = true, env = "DOCBAY_ADMIN_PASSWORD")]
    pub admin_password: Option<String>,
}

/// Configuration failures, mapped to sysexits-style codes in `main`.
#[derive(Debug)]
pub enum ConfigError {
    /// A required option is missing: exit 78 (configuration error).
    MissingOption(&'static str),
    /// The cache directory is unusable: exit 69 (service unavailable).
    CacheUnusable(PathBuf, String),
}

impl ConfigError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::MissingOption(_) => 78,
            Self::CacheUnusable(..) => 69,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingOption(name) => write!(f, "missing required option --{name}"),
            Self::CacheUnusable(path, err) => {
                write!(
                    f,
                    "unable to access {}, please make sure it exists with write permission: {err}",
                    path.display()
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl WsdConfig {
    /// Check option presence and cache usability; adjust test-mode defaults.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.systemplate.is_none() {
            return Err(ConfigError::MissingOption("systemplate"));
        }
        if self.lotemplate.is_none() {
            return Err(ConfigError::MissingOption("lotemplate"));
        }
        if self.childroot.is_none() {
            return Err(ConfigError::MissingOption("childroot"));
        }

        std::fs::create_dir_all(&self.cache)
            .and_then(|()| {
                let probe = self.cache.join(".docbay-probe");
                std::fs::write(&probe, b"")?;
                std::fs::remove_file(&probe)
            })
            .map_err(|e| ConfigError::CacheUnusable(self.cache.clone(), e.to_string()))?;

        if self.test {
            self.numprespawns = 1;
        }
        Ok(())
    }

    /// The jail parent directory; callers run `validate` first.
    pub fn child_root(&self) -> PathBuf {
        self.childroot.clone().unwrap_or_else(|| PathBuf::from("."))
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
