//! Path management for leadsync's local files.
//!
//! Production code uses `StoragePaths::from_home()` which points to `~/.leadsync/`.
//! Tests use `StoragePaths::with_root(temp_dir)` for isolation.

use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};

const ROOT_DIR_NAME: &str = ".leadsync";

#[derive(Debug, Clone)]
pub struct StoragePaths {
    root: PathBuf,
}

impl StoragePaths {
    /// Resolves `~/.leadsync`.
    pub fn from_home() -> Result<Self> {
        let home = dirs::home_dir().ok_or(SyncError::HomeDirNotFound)?;
        Ok(Self {
            root: home.join(ROOT_DIR_NAME),
        })
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to config.toml (endpoint and interval settings).
    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    /// Path to preferences.json (sound / desktop notification flags).
    pub fn preferences_file(&self) -> PathBuf {
        self.root.join("preferences.json")
    }

    /// Path to the auth token file, rewritten by whatever performs login.
    pub fn token_file(&self) -> PathBuf {
        self.root.join("token")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}
