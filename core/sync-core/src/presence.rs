//! Live-workload counters with increase-only alerting.
//!
//! Each tick fetches the full active set. `active` is its size and `waiting`
//! counts items that need a response. The first successful tick is a baseline
//! and never alerts; later ticks alert once when `waiting` grows, carrying the
//! delta. A failed tick changes nothing.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use leadsync_protocol::WorkloadItem;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::alerts::{AlertEvent, AlertSink};
use crate::error::Result;

pub const DEFAULT_PRESENCE_INTERVAL: Duration = Duration::from_secs(10);

#[async_trait]
pub trait WorkloadSource: Send + Sync {
    async fn fetch_active(&self) -> Result<Vec<WorkloadItem>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PresenceCounters {
    pub active: u32,
    pub waiting: u32,
}

impl PresenceCounters {
    pub fn from_items(items: &[WorkloadItem]) -> Self {
        Self {
            active: items.len() as u32,
            waiting: items.iter().filter(|item| item.needs_response).count() as u32,
        }
    }
}

/// Baseline bookkeeping, separate from the published counters.
#[derive(Debug, Default)]
struct WaitingBaseline {
    prev_waiting: Option<u32>,
}

impl WaitingBaseline {
    fn observe(&mut self, waiting: u32) -> Option<AlertEvent> {
        let previous = self.prev_waiting.replace(waiting)?;
        (waiting > previous).then(|| AlertEvent::waiting_increased(waiting - previous))
    }
}

struct Inner {
    counters: PresenceCounters,
    baseline: WaitingBaseline,
    generation: u64,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

struct Core {
    source: Arc<dyn WorkloadSource>,
    alerts: Arc<dyn AlertSink>,
    inner: Mutex<Inner>,
    updates: watch::Sender<PresenceCounters>,
}

impl Core {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn tick(&self, generation: u64) -> Option<AlertEvent> {
        let items = match self.source.fetch_active().await {
            Ok(items) => items,
            Err(err) => {
                debug!(error = %err, "Workload poll failed");
                return None;
            }
        };
        let counters = PresenceCounters::from_items(&items);

        let alert = {
            let mut inner = self.lock();
            if inner.generation != generation {
                debug!("Discarding workload poll after teardown");
                return None;
            }
            inner.counters = counters;
            self.updates.send_replace(counters);
            inner.baseline.observe(counters.waiting)
        };

        if let Some(alert) = &alert {
            self.alerts.alert(alert.clone());
        }
        alert
    }
}

pub struct PresenceCounterTracker {
    core: Arc<Core>,
    interval: Duration,
}

impl PresenceCounterTracker {
    pub fn new(source: Arc<dyn WorkloadSource>, alerts: Arc<dyn AlertSink>) -> Self {
        Self::with_interval(source, alerts, DEFAULT_PRESENCE_INTERVAL)
    }

    pub fn with_interval(
        source: Arc<dyn WorkloadSource>,
        alerts: Arc<dyn AlertSink>,
        interval: Duration,
    ) -> Self {
        let (updates, _) = watch::channel(PresenceCounters::default());
        Self {
            core: Arc::new(Core {
                source,
                alerts,
                inner: Mutex::new(Inner {
                    counters: PresenceCounters::default(),
                    baseline: WaitingBaseline::default(),
                    generation: 0,
                    cancel: None,
                    task: None,
                }),
                updates,
            }),
            interval,
        }
    }

    pub fn counters(&self) -> PresenceCounters {
        self.core.lock().counters
    }

    pub fn subscribe(&self) -> watch::Receiver<PresenceCounters> {
        self.core.updates.subscribe()
    }

    /// Runs one poll. Returns the alert it raised, if any.
    pub async fn tick(&self) -> Option<AlertEvent> {
        let generation = self.core.lock().generation;
        self.core.tick(generation).await
    }

    /// Starts the fixed-interval poll (first tick immediately). No-op if running.
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
        let period = self.interval;
        inner.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                core.tick(generation).await;
            }
        }));
    }

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

impl Drop for PresenceCounterTracker {
    fn drop(&mut self) {
        self.stop();
    }
}
