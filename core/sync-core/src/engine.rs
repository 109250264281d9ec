//! SyncEngine - composes the sync components behind one handle.
//!
//! The engine owns:
//! - the push-channel client
//! - the notification store and its poll loop
//! - the presence tracker and its poll loop
//! - a router task that feeds push events into the store and hands alerts to
//!   the dispatcher
//!
//! The router runs under a supervisor. A panic inside it is logged, surfaced as
//! an [`NoticeKind::Unexpected`](crate::notice::NoticeKind) notice, and the
//! router is restarted; the host keeps running.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! let engine = SyncEngine::new(config, auth, dispatcher);
//! engine.start();
//! let mut notices = engine.notices();
//! // ...
//! engine.stop();
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use leadsync_protocol::StreamEvent;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::alerts::{AlertEvent, AlertSink};
use crate::api::ApiClient;
use crate::auth::AuthTokenProvider;
use crate::backoff::ReconnectionPolicy;
use crate::config::SyncConfig;
use crate::notice::UserNotice;
use crate::notifications::{NotificationApi, NotificationState, NotificationStateStore};
use crate::presence::{PresenceCounterTracker, PresenceCounters, WorkloadSource};
use crate::stream::{ConnectionState, EventStreamClient, StreamTransport};

const ALERT_CHANNEL_CAPACITY: usize = 64;
const NOTICE_CHANNEL_CAPACITY: usize = 64;

/// Network seams the engine talks through. `ApiClient` implements all three.
pub struct SyncServices {
    pub transport: Arc<dyn StreamTransport>,
    pub notifications: Arc<dyn NotificationApi>,
    pub workload: Arc<dyn WorkloadSource>,
    pub auth: Arc<dyn AuthTokenProvider>,
}

impl SyncServices {
    pub fn from_api(api: ApiClient, auth: Arc<dyn AuthTokenProvider>) -> Self {
        let api = Arc::new(api);
        Self {
            transport: api.clone(),
            notifications: api.clone(),
            workload: api,
            auth,
        }
    }
}

/// Alert sink handed to the store and tracker; the router drains it.
struct QueuedAlerts {
    sender: broadcast::Sender<AlertEvent>,
}

impl AlertSink for QueuedAlerts {
    fn alert(&self, event: AlertEvent) {
        let _ = self.sender.send(event);
    }
}

struct RouterContext {
    stream: Arc<EventStreamClient>,
    notifications: Arc<NotificationStateStore>,
    alerts: broadcast::Sender<AlertEvent>,
    output: Arc<dyn AlertSink>,
    page_size: u32,
}

struct Running {
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
}

pub struct SyncEngine {
    config: SyncConfig,
    stream: Arc<EventStreamClient>,
    notifications: Arc<NotificationStateStore>,
    presence: Arc<PresenceCounterTracker>,
    alerts: broadcast::Sender<AlertEvent>,
    notices: broadcast::Sender<UserNotice>,
    output: Arc<dyn AlertSink>,
    running: Mutex<Option<Running>>,
}

impl SyncEngine {
    /// Builds an engine that talks HTTP to `config.api_base_url`.
    pub fn new(
        config: SyncConfig,
        auth: Arc<dyn AuthTokenProvider>,
        output: Arc<dyn AlertSink>,
    ) -> Self {
        let api = ApiClient::new(&config.api_base_url, auth.clone());
        Self::with_services(config, SyncServices::from_api(api, auth), output)
    }

    /// Builds an engine over custom services. Used by tests and embedders.
    pub fn with_services(
        config: SyncConfig,
        services: SyncServices,
        output: Arc<dyn AlertSink>,
    ) -> Self {
        let (alerts, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        let queued: Arc<dyn AlertSink> = Arc::new(QueuedAlerts {
            sender: alerts.clone(),
        });

        let policy = ReconnectionPolicy::new(
            std::time::Duration::from_millis(config.backoff_floor_ms),
            std::time::Duration::from_millis(config.backoff_ceiling_ms),
        );
        let stream = EventStreamClient::with_policy(
            services.transport,
            services.auth,
            policy,
            config.token_retry_interval(),
        );
        let notifications = NotificationStateStore::with_settings(
            services.notifications,
            queued.clone(),
            config.notification_page_size,
            config.notification_poll_interval(),
        );
        let presence = PresenceCounterTracker::with_interval(
            services.workload,
            queued,
            config.presence_poll_interval(),
        );

        Self {
            config,
            stream: Arc::new(stream),
            notifications: Arc::new(notifications),
            presence: Arc::new(presence),
            alerts,
            notices,
            output,
            running: Mutex::new(None),
        }
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────────

    /// Starts every component. Calling it while running is a no-op.
    pub fn start(&self) {
        let mut running = self.lock_running();
        if running.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let context = Arc::new(RouterContext {
            stream: Arc::clone(&self.stream),
            notifications: Arc::clone(&self.notifications),
            alerts: self.alerts.clone(),
            output: Arc::clone(&self.output),
            page_size: self.config.notification_page_size,
        });

        // Subscribe before the sources start so nothing early is missed.
        let supervisor = {
            let cancel = cancel.clone();
            supervise("router", self.notices.clone(), cancel.clone(), move || {
                let events = context.stream.subscribe();
                let alerts = context.alerts.subscribe();
                route(Arc::clone(&context), events, alerts, cancel.clone())
            })
        };

        self.stream.start();
        self.notifications.start();
        self.presence.start();
        *running = Some(Running { cancel, supervisor });
        debug!("Sync engine started");
    }

    /// Stops every component. Idempotent.
    pub fn stop(&self) {
        let running = self.lock_running().take();
        self.stream.stop();
        self.notifications.stop();
        self.presence.stop();
        if let Some(running) = running {
            running.cancel.cancel();
            running.supervisor.abort();
            debug!("Sync engine stopped");
        }
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // State
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn notification_state(&self) -> NotificationState {
        self.notifications.state()
    }

    pub fn subscribe_notifications(&self) -> watch::Receiver<NotificationState> {
        self.notifications.subscribe()
    }

    pub fn presence_counters(&self) -> PresenceCounters {
        self.presence.counters()
    }

    pub fn subscribe_presence(&self) -> watch::Receiver<PresenceCounters> {
        self.presence.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.stream.state()
    }

    pub fn connection_status(&self) -> watch::Receiver<bool> {
        self.stream.connection_status()
    }

    pub fn events(&self) -> broadcast::Receiver<StreamEvent> {
        self.stream.subscribe()
    }

    pub fn alerts(&self) -> broadcast::Receiver<AlertEvent> {
        self.alerts.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<UserNotice> {
        self.notices.subscribe()
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // User actions
    // ─────────────────────────────────────────────────────────────────────────────

    pub async fn refresh(&self) -> Result<(), UserNotice> {
        let result = self.notifications.refresh().await;
        self.publish_failure(result)
    }

    pub async fn mark_read(&self, id: &str) -> Result<(), UserNotice> {
        let result = self.notifications.mark_read(id).await;
        self.publish_failure(result)
    }

    pub async fn mark_all_read(&self) -> Result<(), UserNotice> {
        let result = self.notifications.mark_all_read().await;
        self.publish_failure(result)
    }

    fn publish_failure(&self, result: Result<(), UserNotice>) -> Result<(), UserNotice> {
        if let Err(notice) = &result {
            let _ = self.notices.send(notice.clone());
        }
        result
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Runs `make()` as a task and restarts it after a panic, reporting each panic
/// as an unexpected-error notice. The first `make()` happens before this
/// returns. Ends once the task finishes normally or `cancel` fires.
fn supervise<F, Fut>(
    name: &'static str,
    notices: broadcast::Sender<UserNotice>,
    cancel: CancellationToken,
    make: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let first = make();
    tokio::spawn(async move {
        let mut current = first;
        loop {
            match tokio::spawn(current).await {
                Ok(()) => return,
                Err(err) if err.is_panic() => {
                    error!(task = name, "Background task panicked; restarting");
                    let _ = notices.send(UserNotice::unexpected());
                    if cancel.is_cancelled() {
                        return;
                    }
                    current = make();
                }
                Err(_) => return,
            }
        }
    })
}

async fn route(
    context: Arc<RouterContext>,
    mut events: broadcast::Receiver<StreamEvent>,
    mut alerts: broadcast::Receiver<AlertEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => match event {
                Ok(event) => handle_event(&context, &cancel, event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Router lagged behind push events");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            alert = alerts.recv() => match alert {
                Ok(alert) => context.output.alert(alert),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Router lagged behind alerts");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

async fn handle_event(context: &RouterContext, cancel: &CancellationToken, event: StreamEvent) {
    let kind = event.kind();
    let lead_id = event
        .payload()
        .and_then(|payload| payload.lead_id.clone());
    match event {
        StreamEvent::Notification(notification) => context.notifications.upsert(notification),
        StreamEvent::NewMessage(_) | StreamEvent::DmAssigned(_) | StreamEvent::NewLead(_) => {
            debug!(kind, lead_id = lead_id.as_deref(), "Refreshing notifications after push event");
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = context.notifications.fetch_snapshot(context.page_size, 0) => {}
            }
        }
        _ => {}
    }
}
