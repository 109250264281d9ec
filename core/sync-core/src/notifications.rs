//! Notification state merged from snapshot polls and pushed records.
//!
//! Two unordered sources feed this store:
//!
//! 1. **Snapshot polls** replace the visible page and the unread count. A
//!    server-declared count wins over counting the page, because the full unread
//!    set can be larger than one page.
//! 2. **Pushed records** are merged by `id` and kept newest first. A known id
//!    is replaced, moving only if its `created_at` changed.
//!
//! User actions (`mark_read`, `mark_all_read`) are applied optimistically and
//! never rolled back; the next poll reconciles with the server.
//!
//! # Alerts
//!
//! The first successful snapshot records every id as seen and never alerts.
//! After that, each unread id seen for the first time, from either source,
//! contributes to exactly one alert. Remembered ids are the latest page plus
//! the most recent pushes, so an id that drops out of both can alert again.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use leadsync_protocol::{Notification, NotificationPage};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::alerts::{AlertEvent, AlertSink, AlertSource};
use crate::error::Result;
use crate::notice::UserNotice;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Pushed ids remembered across snapshots, so a push that the page has not
/// caught up with yet does not alert a second time.
const RECENT_PUSH_LIMIT: usize = 256;

#[async_trait]
pub trait NotificationApi: Send + Sync {
    async fn list(&self, limit: u32, offset: u32) -> Result<NotificationPage>;
    async fn unread_count(&self) -> Result<u64>;
    async fn mark_read(&self, id: &str) -> Result<()>;
    async fn mark_all_read(&self) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationState {
    /// Newest first.
    pub items: Vec<Notification>,
    pub unread_count: u64,
}

struct Inner {
    state: NotificationState,
    /// `None` until the first snapshot sets the alert baseline. Afterwards it
    /// holds the latest page plus `recent_pushes`.
    seen: Option<HashSet<String>>,
    recent_pushes: VecDeque<String>,
    generation: u64,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

struct Core {
    api: Arc<dyn NotificationApi>,
    alerts: Arc<dyn AlertSink>,
    inner: Mutex<Inner>,
    updates: watch::Sender<NotificationState>,
}

impl Core {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn generation(&self) -> u64 {
        self.lock().generation
    }

    fn publish(&self, state: &NotificationState) {
        self.updates.send_replace(state.clone());
    }

    async fn fetch_snapshot(&self, generation: u64, limit: u32, offset: u32) -> Result<()> {
        let page = self.api.list(limit, offset).await?;
        self.apply_snapshot(generation, page);
        Ok(())
    }

    fn apply_snapshot(&self, generation: u64, page: NotificationPage) {
        let alert = {
            let mut inner = self.lock();
            if inner.generation != generation {
                debug!("Discarding notification snapshot after teardown");
                return;
            }

            let derived = page.items.iter().filter(|item| !item.read).count() as u64;
            let unread_count = page.unread_count.unwrap_or(derived);

            let fresh: Vec<&Notification> = match inner.seen.as_ref() {
                Some(seen) => page
                    .items
                    .iter()
                    .filter(|item| !seen.contains(&item.id) && !item.read)
                    .collect(),
                None => Vec::new(),
            };
            let alert = snapshot_alert(&fresh);

            let mut retained: HashSet<String> =
                page.items.iter().map(|item| item.id.clone()).collect();
            retained.extend(inner.recent_pushes.iter().cloned());
            inner.seen = Some(retained);

            inner.state = NotificationState {
                items: page.items,
                unread_count,
            };
            self.publish(&inner.state);
            alert
        };

        if let Some(alert) = alert {
            self.alerts.alert(alert);
        }
    }

    async fn fetch_unread_count(&self, generation: u64) -> Result<()> {
        let count = self.api.unread_count().await?;
        let mut inner = self.lock();
        if inner.generation == generation {
            inner.state.unread_count = count;
            self.publish(&inner.state);
        }
        Ok(())
    }
}

fn snapshot_alert(fresh: &[&Notification]) -> Option<AlertEvent> {
    match fresh {
        [] => None,
        [single] => Some(notification_alert(single)),
        many => Some(AlertEvent {
            source: AlertSource::Notifications,
            delta: many.len() as u32,
            title: "New notifications".to_string(),
            body: format!("You have {} new notifications", many.len()),
        }),
    }
}

fn notification_alert(notification: &Notification) -> AlertEvent {
    AlertEvent {
        source: AlertSource::Notifications,
        delta: 1,
        title: notification.title.clone(),
        body: notification.body.clone(),
    }
}

pub struct NotificationStateStore {
    core: Arc<Core>,
    page_size: u32,
    poll_interval: Duration,
}

impl NotificationStateStore {
    pub fn new(api: Arc<dyn NotificationApi>, alerts: Arc<dyn AlertSink>) -> Self {
        Self::with_settings(api, alerts, DEFAULT_PAGE_SIZE, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_settings(
        api: Arc<dyn NotificationApi>,
        alerts: Arc<dyn AlertSink>,
        page_size: u32,
        poll_interval: Duration,
    ) -> Self {
        let (updates, _) = watch::channel(NotificationState::default());
        Self {
            core: Arc::new(Core {
                api,
                alerts,
                inner: Mutex::new(Inner {
                    state: NotificationState::default(),
                    seen: None,
                    recent_pushes: VecDeque::new(),
                    generation: 0,
                    cancel: None,
                    task: None,
                }),
                updates,
            }),
            page_size,
            poll_interval,
        }
    }

    pub fn state(&self) -> NotificationState {
        self.core.lock().state.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<NotificationState> {
        self.core.updates.subscribe()
    }

    /// Replaces the item list with one page from the server. Failures are
    /// silent and leave the state untouched.
    pub async fn fetch_snapshot(&self, limit: u32, offset: u32) {
        let generation = self.core.generation();
        if let Err(err) = self.core.fetch_snapshot(generation, limit, offset).await {
            debug!(error = %err, "Notification snapshot failed");
        }
    }

    /// Replaces only the unread count with the server's value. Silent on failure.
    pub async fn fetch_unread_count(&self) {
        let generation = self.core.generation();
        if let Err(err) = self.core.fetch_unread_count(generation).await {
            debug!(error = %err, "Unread count poll failed");
        }
    }

    /// User-triggered snapshot of the first page; failures become a notice.
    pub async fn refresh(&self) -> std::result::Result<(), UserNotice> {
        let generation = self.core.generation();
        self.core
            .fetch_snapshot(generation, self.page_size, 0)
            .await
            .map_err(|err| UserNotice::action_failed("refresh notifications", &err))
    }

    pub async fn mark_read(&self, id: &str) -> std::result::Result<(), UserNotice> {
        {
            let mut inner = self.core.lock();
            let mut changed = false;
            if let Some(item) = inner.state.items.iter_mut().find(|item| item.id == id) {
                if !item.read {
                    item.read = true;
                    changed = true;
                }
            }
            if changed {
                inner.state.unread_count = inner.state.unread_count.saturating_sub(1);
                self.core.publish(&inner.state);
            }
        }

        self.core
            .api
            .mark_read(id)
            .await
            .map_err(|err| UserNotice::action_failed("mark notification as read", &err))
    }

    pub async fn mark_all_read(&self) -> std::result::Result<(), UserNotice> {
        {
            let mut inner = self.core.lock();
            for item in inner.state.items.iter_mut() {
                item.read = true;
            }
            inner.state.unread_count = 0;
            self.core.publish(&inner.state);
        }

        self.core
            .api
            .mark_all_read()
            .await
            .map_err(|err| UserNotice::action_failed("mark all notifications as read", &err))
    }

    /// Merges one pushed notification by id.
    pub fn upsert(&self, notification: Notification) {
        let alert = {
            let mut inner = self.core.lock();
            let Inner {
                state,
                seen,
                recent_pushes,
                ..
            } = &mut *inner;

            let first_sighting = match seen.as_mut() {
                Some(seen) => seen.insert(notification.id.clone()),
                None => false,
            };
            let alert = (first_sighting && !notification.read)
                .then(|| notification_alert(&notification));

            if !recent_pushes.contains(&notification.id) {
                if recent_pushes.len() == RECENT_PUSH_LIMIT {
                    recent_pushes.pop_front();
                }
                recent_pushes.push_back(notification.id.clone());
            }

            let previous = state
                .items
                .iter()
                .position(|item| item.id == notification.id)
                .map(|index| (index, !state.items[index].read));

            match previous {
                Some((_, true)) if notification.read => {
                    state.unread_count = state.unread_count.saturating_sub(1);
                }
                Some((_, false)) | None if !notification.read => state.unread_count += 1,
                _ => {}
            }

            match previous {
                Some((index, _)) if state.items[index].created_at == notification.created_at => {
                    state.items[index] = notification;
                }
                _ => {
                    if let Some((index, _)) = previous {
                        state.items.remove(index);
                    }
                    let position = state
                        .items
                        .iter()
                        .position(|item| item.created_at <= notification.created_at)
                        .unwrap_or(state.items.len());
                    state.items.insert(position, notification);
                }
            }

            self.core.publish(state);
            alert
        };

        if let Some(alert) = alert {
            self.core.alerts.alert(alert);
        }
    }

    /// Starts the poll cycle (first poll immediately). No-op if running.
    pub fn start(&self) {
        let mut inner = self.core.lock();
        if inner.cancel.is_some() {
            return;
        }
        inner.generation += 1;
        let generation = inner.generation;
        let cancel = CancellationToken::new();
        inner.cancel = Some(cancel.clone());

        let core = Arc::clone(&self.core);
        let page_size = self.page_size;
        let poll_interval = self.poll_interval;
        inner.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if let Err(err) = core.fetch_snapshot(generation, page_size, 0).await {
                    debug!(error = %err, "Notification poll failed");
                }
            }
        }));
    }

    /// Stops polling; results of requests already in flight are discarded.
    pub fn stop(&self) {
        let mut inner = self.core.lock();
        inner.generation += 1;
        if let Some(cancel) = inner.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = inner.task.take() {
            task.abort();
        }
    }
}

impl Drop for NotificationStateStore {
    fn drop(&mut self) {
        self.stop();
    }
}
