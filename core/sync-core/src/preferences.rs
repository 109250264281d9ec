//! Persisted user preferences, read as raw strings.
//!
//! Values are opaque strings owned by an external key-value store. The gates
//! below compare them exactly and are read fresh at every call:
//!
//! - desktop notifications are on only when the value is exactly `"true"`
//! - sound is on unless the value is exactly `"false"`
//!
//! The asymmetric defaults are a product decision. Do not normalize them into
//! booleans.

use std::collections::HashMap;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{Result, SyncError};

pub const SOUND_ENABLED_KEY: &str = "sound_enabled";
pub const BROWSER_NOTIFICATIONS_KEY: &str = "browser_notifications_enabled";

pub trait PreferenceSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Desktop notifications default to off.
pub fn desktop_notifications_enabled(prefs: &dyn PreferenceSource) -> bool {
    prefs.get(BROWSER_NOTIFICATIONS_KEY).as_deref() == Some("true")
}

/// Sound defaults to on.
pub fn sound_enabled(prefs: &dyn PreferenceSource) -> bool {
    prefs.get(SOUND_ENABLED_KEY).as_deref() != Some("false")
}

/// Flat JSON object, re-read on every `get`. Only string values count; other
/// keys are preserved on write but read as unset.
#[derive(Debug, Clone)]
pub struct FilePreferences {
    path: PathBuf,
}

impl FilePreferences {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is empty; an unreadable or non-object file is an error.
    fn load(&self) -> Result<Map<String, Value>> {
        let content = match fs_err::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Map::new()),
            Err(err) => return Err(SyncError::io("reading preferences", err)),
        };
        serde_json::from_str(&content).map_err(|err| SyncError::json("parsing preferences", err))
    }

    /// Writes one key atomically (temp file + rename), keeping every other key.
    /// Refuses to overwrite a file it cannot parse.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.load()?;
        values.insert(key.to_string(), Value::String(value.to_string()));

        let parent_dir = self
            .path
            .parent()
            .ok_or_else(|| SyncError::Config {
                path: self.path.clone(),
                details: "preferences path has no parent directory".to_string(),
            })?;
        fs_err::create_dir_all(parent_dir)
            .map_err(|err| SyncError::io("creating preferences directory", err))?;

        let content = serde_json::to_string_pretty(&values)
            .map_err(|err| SyncError::json("serializing preferences", err))?;
        let mut temp_file = NamedTempFile::new_in(parent_dir)
            .map_err(|err| SyncError::io("creating temp preferences file", err))?;
        temp_file
            .write_all(content.as_bytes())
            .map_err(|err| SyncError::io("writing temp preferences file", err))?;
        temp_file
            .persist(&self.path)
            .map_err(|err| SyncError::io("persisting preferences file", err.error))?;
        Ok(())
    }
}

impl PreferenceSource for FilePreferences {
    fn get(&self, key: &str) -> Option<String> {
        let mut values = match self.load() {
            Ok(values) => values,
            Err(err) => {
                debug!(error = %err, "Preferences unreadable; treating as unset");
                return None;
            }
        };
        match values.remove(key) {
            Some(Value::String(value)) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryPreferences {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: &str) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
    }

    pub fn remove(&self, key: &str) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

impl PreferenceSource for MemoryPreferences {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}
