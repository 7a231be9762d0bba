//! Configuration for the sync core.
//!
//! Stored at `~/.config/datasync/config.json`; missing fields fall back to
//! defaults and a few values can be overridden from the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cache::{
    CachePolicy, RevalidationFailure, SessionMirror, DEFAULT_QUOTA_BYTES, DEFAULT_STALE_MS,
    DEFAULT_TTL_MS,
};
use crate::connectivity::{DEFAULT_HEALTH_TIMEOUT_MS, DEFAULT_POLL_DOWN_MS, DEFAULT_POLL_HEALTHY_MS};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "datasync";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Subdirectory of the cache dir holding the session mirror
const SESSION_DIR: &str = "session";

const DEFAULT_HEALTH_URL: &str = "http://localhost:8000/health";

pub const ENV_HEALTH_URL: &str = "DATASYNC_HEALTH_URL";
pub const ENV_HEALTH_TIMEOUT_MS: &str = "DATASYNC_HEALTH_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub health_url: String,
    pub health_timeout_ms: u64,
    pub poll_healthy_ms: u64,
    pub poll_down_ms: u64,
    pub default_ttl_ms: u64,
    pub default_stale_ms: u64,
    pub mirror_quota_bytes: u64,
    pub revalidation_failure: RevalidationFailure,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            health_url: DEFAULT_HEALTH_URL.to_string(),
            health_timeout_ms: DEFAULT_HEALTH_TIMEOUT_MS,
            poll_healthy_ms: DEFAULT_POLL_HEALTHY_MS,
            poll_down_ms: DEFAULT_POLL_DOWN_MS,
            default_ttl_ms: DEFAULT_TTL_MS,
            default_stale_ms: DEFAULT_STALE_MS,
            mirror_quota_bytes: DEFAULT_QUOTA_BYTES,
            revalidation_failure: RevalidationFailure::default(),
        }
    }
}

impl SyncConfig {
    /// Load from the default location, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply overrides from a variable lookup (the process environment in `load`).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup(ENV_HEALTH_URL) {
            self.health_url = url;
        }
        if let Some(timeout) = lookup(ENV_HEALTH_TIMEOUT_MS) {
            self.health_timeout_ms = timeout
                .trim()
                .parse()
                .with_context(|| format!("Invalid {}: {}", ENV_HEALTH_TIMEOUT_MS, timeout))?;
        }
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn session_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME).join(SESSION_DIR))
    }

    pub fn default_policy(&self) -> CachePolicy {
        CachePolicy::ttl(Duration::from_millis(self.default_ttl_ms))
            .stale_after(Duration::from_millis(self.default_stale_ms))
    }

    pub fn session_mirror(&self) -> Result<SessionMirror> {
        SessionMirror::new(self.session_dir()?, self.mirror_quota_bytes)
    }
}
