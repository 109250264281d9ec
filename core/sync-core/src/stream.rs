//! Push-channel client.
//!
//! `EventStreamClient` owns at most one live connection. Each attempt fetches a
//! fresh token; a missing token waits on a fixed interval, while transport
//! failures and server closes go through [`ReconnectionPolicy`].
//!
//! # State machine
//!
//! ```text
//! Idle -> Connecting -> Connected -> Backoff -> Connecting -> ...
//! ```
//!
//! `stop()` is reachable from every state. It cancels the running task and bumps
//! a generation counter; every deferred step re-checks that counter under the
//! lock before it mutates state or emits, so a timer that fires after `stop()`
//! does nothing.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, Stream, StreamExt};
use leadsync_protocol::{event_data, parse_event, StreamEvent};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::AuthTokenProvider;
use crate::backoff::ReconnectionPolicy;
use crate::error::{Result, SyncError};

const EVENT_CHANNEL_CAPACITY: usize = 256;
pub const TOKEN_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Raw lines read from an open push connection.
pub type LineStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Opens one push connection. Dropping the returned stream closes it.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn open(&self, token: &str) -> Result<LineStream>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Backoff,
}

/// Splits a chunked byte stream into lines. A trailing partial line is flushed
/// when the stream ends; the first error ends the stream.
pub fn byte_lines<S, B, E>(bytes: S) -> LineStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<SyncError> + Send + 'static,
{
    let state = (Box::pin(bytes), Vec::<u8>::new(), false);
    Box::pin(stream::unfold(
        state,
        |(mut bytes, mut buffer, mut done)| async move {
            loop {
                if let Some(pos) = buffer.iter().position(|byte| *byte == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let text = String::from_utf8_lossy(&line).into_owned();
                    return Some((Ok(text), (bytes, buffer, done)));
                }
                if done {
                    if buffer.is_empty() {
                        return None;
                    }
                    let text = String::from_utf8_lossy(&buffer).into_owned();
                    buffer.clear();
                    return Some((Ok(text), (bytes, buffer, done)));
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(chunk.as_ref()),
                    Some(Err(err)) => {
                        buffer.clear();
                        done = true;
                        return Some((Err(err.into()), (bytes, buffer, done)));
                    }
                    None => done = true,
                }
            }
        },
    ))
}

struct Inner {
    state: ConnectionState,
    next_delay: Duration,
    generation: u64,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

struct Shared {
    inner: Mutex<Inner>,
    events: broadcast::Sender<StreamEvent>,
    connected: watch::Sender<bool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct EventStreamClient {
    transport: Arc<dyn StreamTransport>,
    auth: Arc<dyn AuthTokenProvider>,
    policy: ReconnectionPolicy,
    token_retry: Duration,
    shared: Arc<Shared>,
}

impl EventStreamClient {
    pub fn new(transport: Arc<dyn StreamTransport>, auth: Arc<dyn AuthTokenProvider>) -> Self {
        Self::with_policy(transport, auth, ReconnectionPolicy::default(), TOKEN_RETRY_DELAY)
    }

    pub fn with_policy(
        transport: Arc<dyn StreamTransport>,
        auth: Arc<dyn AuthTokenProvider>,
        policy: ReconnectionPolicy,
        token_retry: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (connected, _) = watch::channel(false);
        let next_delay = policy.current_delay();
        Self {
            transport,
            auth,
            policy,
            token_retry,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: ConnectionState::Idle,
                    next_delay,
                    generation: 0,
                    cancel: None,
                    task: None,
                }),
                events,
                connected,
            }),
        }
    }

    /// Starts connecting. Calling it while already running is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut inner = self.shared.lock();
        if inner.cancel.is_some() {
            return;
        }

        inner.generation += 1;
        inner.state = ConnectionState::Connecting;
        inner.next_delay = self.policy.current_delay();
        let cancel = CancellationToken::new();
        inner.cancel = Some(cancel.clone());

        let run = Run {
            shared: Arc::clone(&self.shared),
            generation: inner.generation,
            cancel,
        };
        inner.task = Some(tokio::spawn(run.connect_loop(
            Arc::clone(&self.transport),
            Arc::clone(&self.auth),
            self.policy.clone(),
            self.token_retry,
        )));
    }

    /// Tears the connection down. Idempotent; nothing is emitted afterwards.
    pub fn stop(&self) {
        let mut inner = self.shared.lock();
        inner.generation += 1;
        if let Some(cancel) = inner.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = inner.task.take() {
            task.abort();
        }
        if inner.state != ConnectionState::Idle {
            debug!("Push channel stopped");
        }
        inner.state = ConnectionState::Idle;
        inner.next_delay = self.policy.current_delay();
        self.shared.connected.send_replace(false);
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Delay of the pending reconnect while in `Backoff`; otherwise the delay the
    /// next failure would wait.
    pub fn next_delay(&self) -> Duration {
        self.shared.lock().next_delay
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.shared.events.subscribe()
    }

    pub fn connection_status(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }
}

impl Drop for EventStreamClient {
    fn drop(&mut self) {
        self.stop();
    }
}

enum PumpEnd {
    Cancelled,
    Closed,
    Failed(SyncError),
}

/// Handle held by one running connect loop.
struct Run {
    shared: Arc<Shared>,
    generation: u64,
    cancel: CancellationToken,
}

impl Run {
    /// Applies `update` only if this run has not been superseded by `stop()`.
    fn with_live<F>(&self, update: F) -> bool
    where
        F: FnOnce(&mut Inner),
    {
        let mut inner = self.shared.lock();
        if inner.generation != self.generation || self.cancel.is_cancelled() {
            return false;
        }
        update(&mut inner);
        true
    }

    fn enter(&self, state: ConnectionState, next_delay: Duration) -> bool {
        let connected = state == ConnectionState::Connected;
        self.with_live(|inner| {
            inner.state = state;
            inner.next_delay = next_delay;
            self.shared.connected.send_if_modified(|current| {
                let changed = *current != connected;
                *current = connected;
                changed
            });
        })
    }

    fn emit(&self, event: StreamEvent) -> bool {
        self.with_live(|_| {
            // No subscribers is fine; the event is simply not observed.
            let _ = self.shared.events.send(event);
        })
    }

    /// Sleeps unless cancelled first. Returns whether the run is still live.
    async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => self.with_live(|_| {}),
        }
    }

    async fn connect_loop(
        self,
        transport: Arc<dyn StreamTransport>,
        auth: Arc<dyn AuthTokenProvider>,
        mut policy: ReconnectionPolicy,
        token_retry: Duration,
    ) {
        loop {
            if !self.enter(ConnectionState::Connecting, policy.current_delay()) {
                return;
            }

            let Some(token) = auth.token() else {
                debug!(
                    retry_secs = token_retry.as_secs(),
                    "No auth token; waiting for login"
                );
                if !self.sleep(token_retry).await {
                    return;
                }
                continue;
            };

            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return,
                opened = transport.open(&token) => opened,
            };

            match opened {
                Ok(lines) => {
                    policy.on_success();
                    if !self.enter(ConnectionState::Connected, policy.current_delay()) {
                        return;
                    }
                    info!("Push channel connected");
                    match self.pump(lines).await {
                        PumpEnd::Cancelled => return,
                        PumpEnd::Closed => info!("Push channel closed by server"),
                        PumpEnd::Failed(err) => warn!(error = %err, "Push channel dropped"),
                    }
                }
                Err(err) => debug!(error = %err, "Push channel connect failed"),
            }

            let delay = policy.on_failure();
            if !self.enter(ConnectionState::Backoff, delay) {
                return;
            }
            debug!(delay_ms = delay.as_millis() as u64, "Push channel reconnect scheduled");
            if !self.sleep(delay).await {
                return;
            }
        }
    }

    async fn pump(&self, mut lines: LineStream) -> PumpEnd {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return PumpEnd::Cancelled,
                next = lines.next() => next,
            };
            let line = match next {
                None => return PumpEnd::Closed,
                Some(Err(err)) => return PumpEnd::Failed(err),
                Some(Ok(line)) => line,
            };
            let Some(data) = event_data(&line) else {
                continue;
            };
            match parse_event(data) {
                Ok(StreamEvent::Unknown) => debug!("Ignoring push event of unknown type"),
                Ok(event) => {
                    debug!(kind = event.kind(), "Push event received");
                    if !self.emit(event) {
                        return PumpEnd::Cancelled;
                    }
                }
                Err(err) => debug!(error = %err, "Dropping malformed push payload"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenProvider;
    use std::collections::VecDeque;
    use tokio::time::Instant;

    enum Step {
        Fail,
        Lines(Vec<&'static str>),
        LinesThenHang(Vec<&'static str>),
    }

    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<Step>>,
        attempts: Mutex<Vec<(Instant, String)>>,
    }

    impl ScriptedTransport {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(steps.into()),
                attempts: Mutex::new(Vec::new()),
            })
        }

        fn attempts(&self) -> Vec<(Instant, String)> {
            self.attempts.lock().expect("attempts").clone()
        }

        fn gaps_secs(&self) -> Vec<u64> {
            self.attempts()
                .windows(2)
                .map(|pair| (pair[1].0 - pair[0].0).as_secs())
                .collect()
        }
    }

    #[async_trait]
    impl StreamTransport for ScriptedTransport {
        async fn open(&self, token: &str) -> Result<LineStream> {
            self.attempts
                .lock()
                .expect("attempts")
                .push((Instant::now(), token.to_string()));
            let step = self
                .script
                .lock()
                .expect("script")
                .pop_front()
                .unwrap_or(Step::Fail);
            let to_lines = |lines: Vec<&'static str>| {
                lines
                    .into_iter()
                    .map(|line| Ok(line.to_string()))
                    .collect::<Vec<Result<String>>>()
            };
            match step {
                Step::Fail => Err(SyncError::Status {
                    status: 502,
                    url: "test".to_string(),
                }),
                Step::Lines(lines) => Ok(Box::pin(stream::iter(to_lines(lines)))),
                Step::LinesThenHang(lines) => Ok(Box::pin(
                    stream::iter(to_lines(lines)).chain(stream::pending()),
                )),
            }
        }
    }

    fn client(transport: Arc<ScriptedTransport>, auth: StaticTokenProvider) -> EventStreamClient {
        EventStreamClient::new(transport, Arc::new(auth))
    }

    async fn advance(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn consecutive_failures_back_off_exponentially() {
        let transport = ScriptedTransport::new(vec![]);
        let client = client(Arc::clone(&transport), StaticTokenProvider::new(Some("t")));

        client.start();
        advance(100).await;

        assert_eq!(transport.gaps_secs(), vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(client.state(), ConnectionState::Backoff);
        assert!(!client.is_connected());
        client.stop();
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn successful_open_resets_backoff() {
        let transport = ScriptedTransport::new(vec![
            Step::Fail,
            Step::Fail,
            Step::Lines(vec![r#"{"type":"connected"}"#]),
            Step::Fail,
        ]);
        let client = client(Arc::clone(&transport), StaticTokenProvider::new(Some("t")));

        client.start();
        advance(7).await;

        // fail(1s) fail(2s) open+close(1s) fail(2s)
        assert_eq!(transport.gaps_secs(), vec![1, 2, 1, 2]);
        client.stop();
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn stop_cancels_pending_reconnect() {
        let transport = ScriptedTransport::new(vec![]);
        let client = client(Arc::clone(&transport), StaticTokenProvider::new(Some("t")));
        let mut events = client.subscribe();
        let status = client.connection_status();

        client.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(client.state(), ConnectionState::Backoff);
        assert_eq!(client.next_delay(), Duration::from_secs(1));
        assert_eq!(transport.attempts().len(), 1);

        client.stop();
        advance(120).await;

        assert_eq!(transport.attempts().len(), 1);
        assert_eq!(client.state(), ConnectionState::Idle);
        assert!(!*status.borrow());
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));

        client.stop();
        assert_eq!(client.state(), ConnectionState::Idle);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn missing_token_waits_on_fixed_interval_then_connects() {
        let transport = ScriptedTransport::new(vec![Step::LinesThenHang(vec![])]);
        let auth = StaticTokenProvider::new(None);
        let client = client(Arc::clone(&transport), auth.clone());

        client.start();
        advance(12).await;
        assert!(transport.attempts().is_empty());
        assert_eq!(client.state(), ConnectionState::Connecting);

        auth.set(Some("fresh"));
        advance(5).await;

        let attempts = transport.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].1, "fresh");
        assert_eq!(client.state(), ConnectionState::Connected);
        assert!(client.is_connected());
        client.stop();
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn each_attempt_uses_the_current_token() {
        let transport = ScriptedTransport::new(vec![Step::Fail, Step::Fail]);
        let auth = StaticTokenProvider::new(Some("first"));
        let client = client(Arc::clone(&transport), auth.clone());

        client.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        auth.set(Some("second"));
        advance(1).await;

        let tokens: Vec<String> = transport
            .attempts()
            .into_iter()
            .map(|(_, token)| token)
            .collect();
        assert_eq!(tokens, vec!["first".to_string(), "second".to_string()]);
        client.stop();
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn malformed_payloads_are_dropped_without_closing() {
        let transport = ScriptedTransport::new(vec![Step::LinesThenHang(vec![
            "data: {\"type\":\"connected\"}\n",
            "\n",
            "{not json\n",
            ": keep-alive\n",
            "data: {\"type\":\"typing\"}\n",
            "data: {\"type\":\"new_lead\",\"leadId\":7}\n",
        ])]);
        let client = client(Arc::clone(&transport), StaticTokenProvider::new(Some("t")));
        let mut events = client.subscribe();

        client.start();
        let first = events.recv().await.expect("connected event");
        let second = events.recv().await.expect("new_lead event");

        assert_eq!(first.kind(), "connected");
        let StreamEvent::NewLead(payload) = second else {
            panic!("expected new_lead");
        };
        assert_eq!(payload.lead_id.as_deref(), Some("7"));
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(transport.attempts().len(), 1);
        client.stop();
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn start_is_idempotent() {
        let transport = ScriptedTransport::new(vec![Step::LinesThenHang(vec![])]);
        let client = client(Arc::clone(&transport), StaticTokenProvider::new(Some("t")));

        client.start();
        client.start();
        advance(1).await;
        client.start();
        advance(1).await;

        assert_eq!(transport.attempts().len(), 1);
        client.stop();
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn restart_after_stop_connects_again() {
        let transport = ScriptedTransport::new(vec![
            Step::LinesThenHang(vec![]),
            Step::LinesThenHang(vec![]),
        ]);
        let client = client(Arc::clone(&transport), StaticTokenProvider::new(Some("t")));

        client.start();
        advance(1).await;
        client.stop();
        client.start();
        advance(1).await;

        assert_eq!(transport.attempts().len(), 2);
        assert!(client.is_connected());
        client.stop();
    }

    #[tokio::test]
    async fn byte_lines_splits_across_chunks() {
        let chunks: Vec<std::result::Result<Vec<u8>, SyncError>> = vec![
            Ok(b"data: {\"type\":".to_vec()),
            Ok(b"\"connected\"}\n\nda".to_vec()),
            Ok(b"ta: tail".to_vec()),
        ];
        let lines: Vec<String> = byte_lines(stream::iter(chunks))
            .map(|line| line.expect("line"))
            .collect()
            .await;
        assert_eq!(
            lines,
            vec![
                "data: {\"type\":\"connected\"}\n".to_string(),
                "\n".to_string(),
                "data: tail".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn byte_lines_ends_after_error() {
        let chunks: Vec<std::result::Result<Vec<u8>, SyncError>> = vec![
            Ok(b"partial".to_vec()),
            Err(SyncError::StreamClosed),
            Ok(b"never\n".to_vec()),
        ];
        let results: Vec<Result<String>> = byte_lines(stream::iter(chunks)).collect().await;
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }
}
