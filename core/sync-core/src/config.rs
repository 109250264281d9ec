//! Runtime configuration for the sync core.
//!
//! Loaded from `~/.leadsync/config.toml`. Every field has a default, so a
//! missing file (or a partial one) is valid. `LEADSYNC_API_URL` overrides the
//! endpoint after the file is read.

use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::{BACKOFF_CEILING_MS, BACKOFF_FLOOR_MS};
use crate::error::{Result, SyncError};

pub const API_URL_ENV: &str = "LEADSYNC_API_URL";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub notification_poll_secs: u64,
    pub notification_page_size: u32,
    pub presence_poll_secs: u64,
    pub token_retry_secs: u64,
    pub backoff_floor_ms: u64,
    pub backoff_ceiling_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000".to_string(),
            notification_poll_secs: 30,
            notification_page_size: 20,
            presence_poll_secs: 10,
            token_retry_secs: 5,
            backoff_floor_ms: BACKOFF_FLOOR_MS,
            backoff_ceiling_ms: BACKOFF_CEILING_MS,
        }
    }
}

impl SyncConfig {
    pub fn notification_poll_interval(&self) -> Duration {
        Duration::from_secs(self.notification_poll_secs.max(1))
    }

    pub fn presence_poll_interval(&self) -> Duration {
        Duration::from_secs(self.presence_poll_secs.max(1))
    }

    pub fn token_retry_interval(&self) -> Duration {
        Duration::from_secs(self.token_retry_secs.max(1))
    }

    /// Applies environment overrides on top of file values.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(url) = env::var(API_URL_ENV)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
        {
            self.api_base_url = url;
        }
        self
    }
}

/// Reads the TOML config at `path`, returning defaults when it does not exist.
pub fn load_config(path: &Path) -> Result<SyncConfig> {
    if !path.exists() {
        return Ok(SyncConfig::default());
    }

    let content = fs_err::read_to_string(path)
        .map_err(|err| SyncError::io(format!("reading {}", path.display()), err))?;
    toml::from_str::<SyncConfig>(&content).map_err(|err| SyncError::Config {
        path: path.to_path_buf(),
        details: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_config_defaults_when_file_missing() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let config = load_config(&temp_dir.path().join("missing.toml")).expect("load");
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.presence_poll_interval(), Duration::from_secs(10));
        assert_eq!(config.token_retry_interval(), Duration::from_secs(5));
    }

    #[test]
    fn load_config_merges_partial_file_with_defaults() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(
            &path,
            r#"
api_base_url = "https://api.example.test"
notification_poll_secs = 15
"#,
        )
        .expect("write config");

        let config = load_config(&path).expect("load");
        assert_eq!(config.api_base_url, "https://api.example.test");
        assert_eq!(config.notification_poll_secs, 15);
        assert_eq!(config.presence_poll_secs, 10);
        assert_eq!(config.backoff_ceiling_ms, 30_000);
    }

    #[test]
    fn load_config_rejects_malformed_toml() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(&path, "api_base_url = [").expect("write config");

        let err = load_config(&path).expect_err("malformed");
        assert!(matches!(err, SyncError::Config { .. }));
    }

    #[test]
    fn zero_intervals_are_clamped_to_one_second() {
        let config = SyncConfig {
            notification_poll_secs: 0,
            presence_poll_secs: 0,
            ..SyncConfig::default()
        };
        assert_eq!(config.notification_poll_interval(), Duration::from_secs(1));
        assert_eq!(config.presence_poll_interval(), Duration::from_secs(1));
    }
}
