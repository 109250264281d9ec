//! HTTP client for the sync endpoints.
//!
//! Every request reads a fresh token from the [`AuthTokenProvider`]. REST calls
//! send it as a bearer header and are not sent at all without one; the push
//! channel passes it as a query parameter.

use std::sync::Arc;

use async_trait::async_trait;
use leadsync_protocol::{
    NotificationListResponse, NotificationPage, UnreadCountResponse, WorkloadItem,
    WorkloadResponse, NOTIFICATIONS_PATH, READ_ALL_PATH, SSE_EVENTS_PATH, UNREAD_COUNT_PATH,
    WORKLOAD_PATH,
};
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::auth::AuthTokenProvider;
use crate::error::{Result, SyncError};
use crate::notifications::NotificationApi;
use crate::presence::WorkloadSource;
use crate::stream::{byte_lines, LineStream, StreamTransport};

#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    auth: Arc<dyn AuthTokenProvider>,
}

impl ApiClient {
    pub fn new(base_url: &str, auth: Arc<dyn AuthTokenProvider>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Appends percent-encoded path segments to the base URL.
    fn segment_url(&self, segments: &[&str]) -> Result<Url> {
        let invalid = |details: String| SyncError::InvalidUrl {
            url: self.base_url.clone(),
            details,
        };
        let mut url = Url::parse(&self.base_url).map_err(|err| invalid(err.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| invalid("cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        let token = self.auth.token().ok_or(SyncError::AuthUnavailable)?;
        Ok(request.bearer_auth(token))
    }

    async fn send(&self, request: RequestBuilder, url: &str) -> Result<Response> {
        let response = self.authorized(request)?.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = self.url(path);
        let response = self.send(self.client.get(&url).query(query), &url).await?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|err| SyncError::Decode(format!("{}: {}", url, err)))
    }

    async fn post(&self, url: Url) -> Result<()> {
        let display = url.to_string();
        self.send(self.client.post(url), &display).await?;
        Ok(())
    }
}

#[async_trait]
impl StreamTransport for ApiClient {
    async fn open(&self, token: &str) -> Result<LineStream> {
        let url = self.url(SSE_EVENTS_PATH);
        debug!(url = %url, "Opening push channel");
        let response = self
            .client
            .get(&url)
            .query(&[("token", token)])
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Status {
                status: status.as_u16(),
                url,
            });
        }
        Ok(byte_lines(response.bytes_stream()))
    }
}

#[async_trait]
impl NotificationApi for ApiClient {
    async fn list(&self, limit: u32, offset: u32) -> Result<NotificationPage> {
        let response: NotificationListResponse = self
            .get_json(
                NOTIFICATIONS_PATH,
                &[("limit", limit.to_string()), ("offset", offset.to_string())],
            )
            .await?;
        Ok(response.into())
    }

    async fn unread_count(&self) -> Result<u64> {
        let response: UnreadCountResponse = self.get_json(UNREAD_COUNT_PATH, &[]).await?;
        response
            .value()
            .ok_or_else(|| SyncError::Decode("unread count missing from response".to_string()))
    }

    async fn mark_read(&self, id: &str) -> Result<()> {
        let url = self.segment_url(&[NOTIFICATIONS_PATH.trim_start_matches('/'), id, "read"])?;
        self.post(url).await
    }

    async fn mark_all_read(&self) -> Result<()> {
        let segments: Vec<&str> = READ_ALL_PATH.split('/').filter(|s| !s.is_empty()).collect();
        let url = self.segment_url(&segments)?;
        self.post(url).await
    }
}

#[async_trait]
impl WorkloadSource for ApiClient {
    async fn fetch_active(&self) -> Result<Vec<WorkloadItem>> {
        let response: WorkloadResponse = self
            .get_json(WORKLOAD_PATH, &[("sort", "recent".to_string())])
            .await?;
        Ok(response.dms)
    }
}
