//! Auth token sources.
//!
//! Tokens are owned and rotated outside the core. Every provider reads the
//! current value on each call; nothing here caches a token between attempts.

use std::env;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

pub const TOKEN_ENV: &str = "LEADSYNC_TOKEN";

pub trait AuthTokenProvider: Send + Sync {
    /// Returns the current token, or `None` while the user is logged out.
    fn token(&self) -> Option<String>;
}

impl<P: AuthTokenProvider + ?Sized> AuthTokenProvider for Arc<P> {
    fn token(&self) -> Option<String> {
        (**self).token()
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Reads `LEADSYNC_TOKEN` on every call.
#[derive(Debug, Clone, Default)]
pub struct EnvTokenProvider;

impl AuthTokenProvider for EnvTokenProvider {
    fn token(&self) -> Option<String> {
        env::var(TOKEN_ENV).ok().and_then(non_empty)
    }
}

/// Reads a token file on every call. A missing or blank file means logged out.
#[derive(Debug, Clone)]
pub struct FileTokenProvider {
    path: PathBuf,
}

impl FileTokenProvider {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl AuthTokenProvider for FileTokenProvider {
    fn token(&self) -> Option<String> {
        fs_err::read_to_string(&self.path).ok().and_then(non_empty)
    }
}

/// Holds a token in memory; `set` simulates login, logout and rotation.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenProvider {
    token: Arc<Mutex<Option<String>>>,
}

impl StaticTokenProvider {
    pub fn new(token: Option<&str>) -> Self {
        Self {
            token: Arc::new(Mutex::new(token.map(str::to_string))),
        }
    }

    pub fn set(&self, token: Option<&str>) {
        if let Ok(mut guard) = self.token.lock() {
            *guard = token.map(str::to_string);
        }
    }
}

impl AuthTokenProvider for StaticTokenProvider {
    fn token(&self) -> Option<String> {
        self.token.lock().ok().and_then(|guard| guard.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_provider_reads_fresh_value_each_call() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("token");
        let provider = FileTokenProvider::new(path.clone());
        assert_eq!(provider.token(), None);

        fs_err::write(&path, "first\n").expect("write token");
        assert_eq!(provider.token().as_deref(), Some("first"));

        fs_err::write(&path, "rotated").expect("rotate token");
        assert_eq!(provider.token().as_deref(), Some("rotated"));

        fs_err::write(&path, "   \n").expect("blank token");
        assert_eq!(provider.token(), None);
    }

    #[test]
    fn static_provider_tracks_login_and_logout() {
        let provider = StaticTokenProvider::new(None);
        assert_eq!(provider.token(), None);
        provider.set(Some("abc"));
        assert_eq!(provider.token().as_deref(), Some("abc"));
        provider.set(None);
        assert_eq!(provider.token(), None);
    }
}
