//! End-to-end runs of `SyncEngine` against a mock HTTP backend.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use leadsync_core::{
    AlertEvent, AlertSink, NoticeKind, StaticTokenProvider, SyncConfig, SyncEngine,
};
use leadsync_protocol::StreamEvent;
use serde_json::json;
use tokio::sync::watch;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Default)]
struct CollectingSink {
    events: Mutex<Vec<AlertEvent>>,
}

impl AlertSink for CollectingSink {
    fn alert(&self, event: AlertEvent) {
        self.events.lock().expect("events").push(event);
    }
}

async fn wait_for<T, F>(receiver: &mut watch::Receiver<T>, mut done: F)
where
    F: FnMut(&T) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if done(&receiver.borrow_and_update()) {
                return;
            }
            receiver.changed().await.expect("sender alive");
        }
    })
    .await
    .expect("condition reached in time");
}

async fn mock_backend() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/sse/events"))
        .and(query_param("token", "tok-live"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            ": heartbeat\n\ndata: {\"type\":\"connected\"}\n\ndata: {\"type\":\"typing\"}\n\n",
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/notifications"))
        .and(header("authorization", "Bearer tok-live"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "notifications": [
                {"id": 2, "title": "Lead replied", "body": "Ada wrote back", "read": false,
                 "created_at": "2026-02-14T11:00:00Z"},
                {"id": 1, "title": "Assigned", "body": "New DM", "read": true,
                 "created_at": "2026-02-14T10:00:00Z"}
            ],
            "unreadCount": 3
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/workload/active"))
        .and(query_param("sort", "recent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "dms": [{"needs_response": true}, {"needs_response": false}]
        })))
        .mount(&server)
        .await;
    server
}

fn engine_for(server: &MockServer, sink: Arc<CollectingSink>) -> SyncEngine {
    let config = SyncConfig {
        api_base_url: server.uri(),
        ..SyncConfig::default()
    };
    SyncEngine::new(
        config,
        Arc::new(StaticTokenProvider::new(Some("tok-live"))),
        sink,
    )
}

#[tokio::test]
async fn engine_syncs_snapshot_counters_and_push_channel() {
    let server = mock_backend().await;
    let sink = Arc::new(CollectingSink::default());
    let engine = engine_for(&server, sink.clone());

    let mut events = engine.events();
    let mut notifications = engine.subscribe_notifications();
    let mut counters = engine.subscribe_presence();
    engine.start();

    let first = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event in time")
        .expect("event");
    assert!(matches!(first, StreamEvent::Connected(_)));

    wait_for(&mut notifications, |state| state.unread_count == 3).await;
    let state = engine.notification_state();
    assert_eq!(state.items.len(), 2);
    assert_eq!(state.items[0].id, "2");

    wait_for(&mut counters, |counters| counters.active == 2).await;
    assert_eq!(engine.presence_counters().waiting, 1);

    // Baselines only: nothing has increased yet.
    assert!(sink.events.lock().expect("events").is_empty());

    engine.stop();
    assert!(!*engine.connection_status().borrow());
}

#[tokio::test]
async fn failed_mark_read_keeps_optimistic_state_and_publishes_notice() {
    let server = mock_backend().await;
    Mock::given(method("POST"))
        .and(path("/notifications/2/read"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let engine = engine_for(&server, Arc::new(CollectingSink::default()));
    let mut notices = engine.notices();
    engine.refresh().await.expect("refresh");
    assert_eq!(engine.notification_state().unread_count, 3);

    let notice = engine.mark_read("2").await.expect_err("server rejects");
    assert_eq!(notice.kind, NoticeKind::ActionFailed);
    assert_eq!(notices.recv().await.expect("published"), notice);

    let state = engine.notification_state();
    assert_eq!(state.unread_count, 2);
    assert!(state.items[0].read);
}
