//! # leadsync-core
//!
//! Real-time sync core for the lead inbox: a push channel with reconnect
//! backoff, a notification store reconciled against periodic snapshots,
//! workload counters, and preference-gated alerts.
//!
//! ## Design Principles
//!
//! - **Never crash the host**: background failures are logged and retried;
//!   only user-initiated actions return a [`UserNotice`].
//! - **No work after teardown**: every component's `stop()` is idempotent, and
//!   deferred callbacks re-check liveness before touching state.
//! - **Alert once**: a first observation is a baseline, never an alert.
//! - **Requires tokio**: components spawn tasks on the ambient runtime.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use leadsync_core::{load_config, EnvTokenProvider, StoragePaths, SyncEngine};
//!
//! let paths = StoragePaths::from_home()?;
//! let config = load_config(&paths.config_file())?.with_env_overrides();
//! let engine = SyncEngine::new(config, Arc::new(EnvTokenProvider), dispatcher);
//! engine.start();
//! ```

pub mod alerts;
pub mod api;
pub mod auth;
pub mod backoff;
pub mod config;
pub mod engine;
pub mod error;
pub mod notice;
pub mod notifications;
pub mod preferences;
pub mod presence;
pub mod storage;
pub mod stream;

pub use alerts::{
    AlertDispatcher, AlertEvent, AlertSink, AlertSource, DesktopNotifier, DispatchOutcome,
    LogNotifier, TerminalBell, TonePlayer,
};
pub use api::ApiClient;
pub use auth::{AuthTokenProvider, EnvTokenProvider, FileTokenProvider, StaticTokenProvider};
pub use backoff::ReconnectionPolicy;
pub use config::{load_config, SyncConfig};
pub use engine::{SyncEngine, SyncServices};
pub use error::{Result, SyncError};
pub use notice::{NoticeKind, UserNotice};
pub use notifications::{NotificationApi, NotificationState, NotificationStateStore};
pub use preferences::{
    desktop_notifications_enabled, sound_enabled, FilePreferences, MemoryPreferences,
    PreferenceSource, BROWSER_NOTIFICATIONS_KEY, SOUND_ENABLED_KEY,
};
pub use presence::{PresenceCounterTracker, PresenceCounters, WorkloadSource};
pub use storage::StoragePaths;
pub use stream::{ConnectionState, EventStreamClient, StreamTransport};
