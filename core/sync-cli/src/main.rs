//! leadsync: terminal host for the real-time sync core.
//!
//! ## Subcommands
//!
//! - `watch`: run the engine until Ctrl-C, logging events, counters and notices
//! - `notifications`: print one page of notifications and the unread count
//! - `mark-read` / `mark-all-read`: notification mutations
//! - `prefs`: read or write alert preferences

mod logging;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use leadsync_core::{
    desktop_notifications_enabled, load_config, sound_enabled, AlertDispatcher, ApiClient,
    AuthTokenProvider, EnvTokenProvider, FilePreferences, FileTokenProvider, LogNotifier,
    NotificationApi, PreferenceSource, StoragePaths, SyncConfig, SyncEngine, SyncError,
    TerminalBell, UserNotice, BROWSER_NOTIFICATIONS_KEY, SOUND_ENABLED_KEY,
};
use leadsync_protocol::Notification;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "leadsync")]
#[command(about = "Live notifications and workload counters for the lead inbox")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stay connected and report activity until interrupted
    Watch,

    /// Print one page of notifications
    Notifications {
        #[arg(long, default_value_t = 20)]
        limit: u32,

        #[arg(long, default_value_t = 0)]
        offset: u32,

        /// Print the raw records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Mark one notification as read
    MarkRead {
        #[arg(value_name = "ID")]
        id: String,
    },

    /// Mark every notification as read
    MarkAllRead,

    /// Read or write alert preferences
    Prefs {
        #[command(subcommand)]
        action: PrefsAction,
    },
}

#[derive(Subcommand)]
enum PrefsAction {
    /// Print a preference and whether it is in effect
    Get {
        #[arg(value_name = "KEY")]
        key: String,
    },
    /// Store a preference value verbatim
    Set {
        #[arg(value_name = "KEY")]
        key: String,
        #[arg(value_name = "VALUE")]
        value: String,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Notice(#[from] UserNotice),

    #[error("Unknown preference '{0}' (expected sound_enabled or browser_notifications_enabled)")]
    UnknownPreference(String),

    #[error("Failed to start runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

/// `LEADSYNC_TOKEN` wins; otherwise `~/.leadsync/token`.
struct CliTokenProvider {
    file: FileTokenProvider,
}

impl AuthTokenProvider for CliTokenProvider {
    fn token(&self) -> Option<String> {
        EnvTokenProvider.token().or_else(|| self.file.token())
    }
}

fn main() {
    let cli = Cli::parse();
    let paths = StoragePaths::from_home();
    let _logging_guard = logging::init(paths.as_ref().ok().map(|p| p.logs_dir()).as_deref());

    let result = paths.map_err(CliError::from).and_then(|paths| {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(CliError::Runtime)?;
        runtime.block_on(run(cli.command, paths))
    });

    if let Err(e) = result {
        tracing::error!(error = %e, "leadsync failed");
        std::process::exit(1);
    }
}

async fn run(command: Commands, paths: StoragePaths) -> Result<(), CliError> {
    let config = load_config(&paths.config_file())?.with_env_overrides();
    let auth: Arc<dyn AuthTokenProvider> = Arc::new(CliTokenProvider {
        file: FileTokenProvider::new(paths.token_file()),
    });
    let api = ApiClient::new(&config.api_base_url, auth.clone());

    match command {
        Commands::Watch => watch(config, auth, &paths).await,
        Commands::Notifications {
            limit,
            offset,
            json,
        } => {
            let page = api.list(limit, offset).await?;
            let unread = match page.unread_count {
                Some(count) => count,
                None => api.unread_count().await?,
            };
            if json {
                let body = serde_json::to_string_pretty(&page.items)
                    .map_err(|err| SyncError::json("printing notifications", err))?;
                println!("{}", body);
            } else {
                for item in &page.items {
                    println!("{}", format_notification(item));
                }
            }
            println!("{} unread", unread);
            Ok(())
        }
        Commands::MarkRead { id } => {
            api.mark_read(&id)
                .await
                .map_err(|err| UserNotice::action_failed("mark notification as read", &err))?;
            println!("Marked {} as read", id);
            Ok(())
        }
        Commands::MarkAllRead => {
            api.mark_all_read()
                .await
                .map_err(|err| UserNotice::action_failed("mark all notifications as read", &err))?;
            println!("Marked all notifications as read");
            Ok(())
        }
        Commands::Prefs { action } => prefs(action, &paths),
    }
}

fn format_notification(item: &Notification) -> String {
    let marker = if item.read { " " } else { "*" };
    format!(
        "{} {:<10} {}  {}  {}",
        marker,
        item.id,
        item.created_at.format("%Y-%m-%d %H:%M"),
        item.title,
        item.body
    )
}

fn prefs(action: PrefsAction, paths: &StoragePaths) -> Result<(), CliError> {
    let store = FilePreferences::new(paths.preferences_file());
    match action {
        PrefsAction::Get { key } => {
            let effective = match key.as_str() {
                SOUND_ENABLED_KEY => sound_enabled(&store),
                BROWSER_NOTIFICATIONS_KEY => desktop_notifications_enabled(&store),
                _ => return Err(CliError::UnknownPreference(key)),
            };
            let raw = store.get(&key);
            println!(
                "{} = {} ({})",
                key,
                raw.as_deref().unwrap_or("<unset>"),
                if effective { "enabled" } else { "disabled" }
            );
            Ok(())
        }
        PrefsAction::Set { key, value } => {
            if key != SOUND_ENABLED_KEY && key != BROWSER_NOTIFICATIONS_KEY {
                return Err(CliError::UnknownPreference(key));
            }
            store.set(&key, &value)?;
            Ok(())
        }
    }
}

async fn watch(
    config: SyncConfig,
    auth: Arc<dyn AuthTokenProvider>,
    paths: &StoragePaths,
) -> Result<(), CliError> {
    let dispatcher = AlertDispatcher::new(
        Arc::new(FilePreferences::new(paths.preferences_file())),
        Arc::new(TerminalBell),
        Arc::new(LogNotifier),
    );
    tracing::info!(api = %config.api_base_url, "Starting sync");
    let engine = SyncEngine::new(config, auth, Arc::new(dispatcher));

    let mut events = engine.events();
    let mut notices = engine.notices();
    let mut alerts = engine.alerts();
    let mut connected = engine.connection_status();
    let mut counters = engine.subscribe_presence();
    let mut notifications = engine.subscribe_notifications();
    engine.start();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = events.recv() => match event {
                Ok(event) => tracing::info!(
                    kind = event.kind(),
                    lead_id = event.payload().and_then(|payload| payload.lead_id.as_deref()),
                    "Push event"
                ),
                Err(RecvError::Lagged(skipped)) => tracing::debug!(skipped, "Event log lagged"),
                Err(RecvError::Closed) => break,
            },
            notice = notices.recv() => match notice {
                Ok(notice) => tracing::warn!(kind = ?notice.kind, "{}", notice.message),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            alert = alerts.recv() => match alert {
                Ok(alert) => tracing::info!(source = ?alert.source, delta = alert.delta, "{}: {}", alert.title, alert.body),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            changed = connected.changed() => {
                if changed.is_err() {
                    break;
                }
                let online = *connected.borrow_and_update();
                if online {
                    tracing::info!("Connected");
                } else {
                    tracing::warn!("Offline; reconnecting");
                }
            },
            changed = counters.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *counters.borrow_and_update();
                tracing::info!(active = current.active, waiting = current.waiting, "Workload");
            },
            changed = notifications.changed() => {
                if changed.is_err() {
                    break;
                }
                let unread = notifications.borrow_and_update().unread_count;
                tracing::info!(unread, "Notifications");
            },
        }
    }

    engine.stop();
    tracing::info!("Stopped");
    Ok(())
}
