//! Wire types for the leadsync push channel and REST endpoints.
//!
//! This crate is shared by the sync core and its hosts to prevent schema drift.
//! Decoding is deliberately tolerant: ids may arrive as strings or numbers,
//! list endpoints may return a bare array, and unknown fields are kept rather
//! than rejected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

pub const SSE_EVENTS_PATH: &str = "/api/sse/events";
pub const NOTIFICATIONS_PATH: &str = "/notifications";
pub const UNREAD_COUNT_PATH: &str = "/notifications/unread-count";
pub const READ_ALL_PATH: &str = "/notifications/read-all";
pub const WORKLOAD_PATH: &str = "/workload/active";

// ═══════════════════════════════════════════════════════════════════════════════
// Push Channel
// ═══════════════════════════════════════════════════════════════════════════════

/// A single message delivered over the push channel, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Connected(EventPayload),
    NewMessage(EventPayload),
    SuggestionReady(EventPayload),
    DmAssigned(EventPayload),
    LeadUpdated(EventPayload),
    NewLead(EventPayload),
    Notification(Notification),
    #[serde(other)]
    Unknown,
}

impl StreamEvent {
    /// Stable name of the variant, matching the wire `type` value.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Connected(_) => "connected",
            StreamEvent::NewMessage(_) => "new_message",
            StreamEvent::SuggestionReady(_) => "suggestion_ready",
            StreamEvent::DmAssigned(_) => "dm_assigned",
            StreamEvent::LeadUpdated(_) => "lead_updated",
            StreamEvent::NewLead(_) => "new_lead",
            StreamEvent::Notification(_) => "notification",
            StreamEvent::Unknown => "unknown",
        }
    }

    pub fn payload(&self) -> Option<&EventPayload> {
        match self {
            StreamEvent::Connected(payload)
            | StreamEvent::NewMessage(payload)
            | StreamEvent::SuggestionReady(payload)
            | StreamEvent::DmAssigned(payload)
            | StreamEvent::LeadUpdated(payload)
            | StreamEvent::NewLead(payload) => Some(payload),
            StreamEvent::Notification(_) | StreamEvent::Unknown => None,
        }
    }
}

/// Optional fields shared by the lead/conversation events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    #[serde(default, deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub lead_id: Option<String>,
    #[serde(default, deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub suggestion_id: Option<String>,
    #[serde(default, deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Strips push-channel framing from one line and returns the JSON body, if any.
///
/// Accepts bare JSON lines as well as server-sent-event `data:` lines. Blank
/// lines, `:` heartbeats and the other SSE field lines carry no event.
pub fn event_data(line: &str) -> Option<&str> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() || line.starts_with(':') {
        return None;
    }
    if let Some(data) = line.strip_prefix("data:") {
        let data = data.trim();
        return if data.is_empty() { None } else { Some(data) };
    }
    for field in ["event:", "id:", "retry:"] {
        if line.starts_with(field) {
            return None;
        }
    }
    Some(line.trim())
}

/// Decodes one push-channel JSON body.
pub fn parse_event(data: &str) -> Result<StreamEvent, serde_json::Error> {
    serde_json::from_str(data)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Notifications
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(deserialize_with = "required_string_or_number")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub read: bool,
    #[serde(alias = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// One page of `GET /notifications`, normalized from either response shape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationPage {
    pub items: Vec<Notification>,
    /// Server-declared unread total; may exceed the unread items on this page.
    pub unread_count: Option<u64>,
}

/// Raw list body. Records stay undecoded here so one bad record cannot reject
/// the whole page.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum NotificationListResponse {
    Wrapped {
        notifications: Vec<Value>,
        #[serde(default, rename = "unreadCount", alias = "unread_count")]
        unread_count: Option<u64>,
    },
    Bare(Vec<Value>),
}

impl From<NotificationListResponse> for NotificationPage {
    fn from(response: NotificationListResponse) -> Self {
        let (records, unread_count) = match response {
            NotificationListResponse::Wrapped {
                notifications,
                unread_count,
            } => (notifications, unread_count),
            NotificationListResponse::Bare(records) => (records, None),
        };
        let items = records
            .into_iter()
            .filter_map(|record| match serde_json::from_value::<Notification>(record) {
                Ok(notification) => Some(notification),
                Err(err) => {
                    debug!(error = %err, "Skipping undecodable notification record");
                    None
                }
            })
            .collect();
        NotificationPage {
            items,
            unread_count,
        }
    }
}

/// Body of `GET /notifications/unread-count`; both field spellings are seen.
#[derive(Debug, Default, Deserialize)]
pub struct UnreadCountResponse {
    #[serde(default)]
    pub count: Option<u64>,
    #[serde(default, alias = "unreadCount")]
    pub unread_count: Option<u64>,
}

impl UnreadCountResponse {
    pub fn value(&self) -> Option<u64> {
        self.count.or(self.unread_count)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Workload
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default, Deserialize)]
pub struct WorkloadResponse {
    #[serde(default)]
    pub dms: Vec<WorkloadItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadItem {
    #[serde(default)]
    pub needs_response: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════════════

fn id_from_value(value: Value) -> Option<String> {
    match value {
        Value::String(value) => Some(value),
        Value::Number(value) => Some(value.to_string()),
        _ => None,
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(id_from_value))
}

fn required_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    id_from_value(value).ok_or_else(|| serde::de::Error::custom("id must be a string or number"))
}
