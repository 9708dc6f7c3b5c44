use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::SessionError;

// Embed the default config at compile time
const DEFAULT_CONFIG: &str = include_str!("../../default-config.toml");

/// Fixed capacities of a session's arena regions and the pool bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionLimits {
    /// Password region capacity in bytes
    pub max_pass_len: usize,
    /// Salt region capacity in bytes
    pub max_salt_len: usize,
    /// Derived-key region capacity in bytes (at least 32)
    pub max_dk_len: usize,
    /// Maximum number of execution units (0 = auto-detect)
    pub max_thread: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_pass_len: 64,
            max_salt_len: 64,
            max_dk_len: 64,
            max_thread: 4,
        }
    }
}

impl SessionLimits {
    /// Load limits from the embedded defaults and `PARASCRYPT_*` environment variables
    pub fn load() -> Result<Self> {
        Self::extract(Self::figment(None))
    }

    /// Load limits with a custom TOML file layered between defaults and environment
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("Config file not found: {}", path.display());
        }
        Self::extract(Self::figment(Some(path)))
            .with_context(|| format!("Failed to load limits from {}", path.display()))
    }

    fn figment(custom_config: Option<&Path>) -> Figment {
        let mut figment = Figment::new().merge(Toml::string(DEFAULT_CONFIG));

        if let Some(custom_path) = custom_config {
            figment = figment.merge(Toml::file(custom_path));
        }

        // Environment variables always have highest priority
        figment.merge(Env::prefixed("PARASCRYPT_"))
    }

    fn extract(figment: Figment) -> Result<Self> {
        tracing::trace!("CONFIG LOAD: extracting session limits");
        let limits: SessionLimits = figment
            .extract()
            .context("Invalid session limits configuration")?;
        limits.validate()?;
        tracing::debug!("CONFIG LOAD: {:?}", limits);
        Ok(limits)
    }

    /// Effective pool bound, resolving `0` to the number of CPU cores
    pub fn resolved_max_thread(&self) -> usize {
        if self.max_thread > 0 {
            self.max_thread
        } else {
            std::cmp::max(1, num_cpus::get())
        }
    }

    /// Reject limits the finalization step cannot honour
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.max_dk_len < 32 {
            return Err(SessionError::InvalidConfig(format!(
                "max_dk_len must be at least 32, got {}",
                self.max_dk_len
            )));
        }
        Ok(())
    }
}
