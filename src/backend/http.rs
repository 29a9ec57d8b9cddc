use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::session::{FeedId, FeedOp};

use super::types::{
    Ack, AnalysisBody, AnalysisOutcome, AnomalyBody, AnomalyOutcome, ApiEnvelope, BackendError,
    BackendResult, ChatEntry, ChatHistoryBody, ChatReply, ContextProbe, Frame, FrameBody, Report, ReportsBody,
};
use super::{ChatBackend, FeedBackend};

/// JSON-over-HTTP client for the processing backend.
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> BackendResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| BackendError::Transport(format!("failed to build HTTP client: {err}")))?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        info!("[HttpBackend] Using API base URL {}", base_url);

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URLs pass through; everything else hangs off the API base.
    pub fn build_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> BackendResult<T> {
        let url = self.build_url(path);
        self.execute(&url, self.client.get(&url)).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: serde_json::Value) -> BackendResult<T> {
        let url = self.build_url(path);
        self.execute(&url, self.client.post(&url).json(&body)).await
    }

    /// Sends a request and decodes the `{success, error?}` envelope.
    async fn execute<T: DeserializeOwned>(&self, url: &str, request: RequestBuilder) -> BackendResult<T> {
        self.execute_raw::<ApiEnvelope<T>>(url, request)
            .await?
            .into_result()
    }

    async fn execute_raw<T: DeserializeOwned>(&self, url: &str, request: RequestBuilder) -> BackendResult<T> {
        debug!("[HttpBackend] {url}");
        let response = request.send().await.map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|err| BackendError::Decode(err.to_string()))
    }
}

fn transport_error(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout
    } else {
        BackendError::Transport(err.to_string())
    }
}

fn feed_body<F: FeedId>(feed: F) -> serde_json::Value {
    match feed.wire_id() {
        Some(id) => json!({ "camera_id": id }),
        None => json!({}),
    }
}

#[async_trait]
impl<F: FeedId> FeedBackend<F> for HttpBackend {
    async fn start(&self, feed: F, url: &str) -> BackendResult<()> {
        let mut body = feed_body(feed);
        body["camera_url"] = json!(url);
        self.post::<Ack>(&feed.route(FeedOp::Start), body).await?;
        Ok(())
    }

    async fn stop(&self, feed: F) -> BackendResult<()> {
        self.post::<Ack>(&feed.route(FeedOp::Stop), feed_body(feed)).await?;
        Ok(())
    }

    async fn frame(&self, feed: F) -> BackendResult<Frame> {
        self.get::<FrameBody>(&feed.route(FeedOp::Frame))
            .await?
            .into_frame()
    }

    async fn reports(&self, feed: F) -> BackendResult<Vec<Report>> {
        Ok(self
            .get::<ReportsBody>(&feed.route(FeedOp::Reports))
            .await?
            .into_reports())
    }

    async fn analyze(&self, feed: F) -> BackendResult<AnalysisOutcome> {
        Ok(self
            .post::<AnalysisBody>(&feed.route(FeedOp::Analyze), json!({}))
            .await?
            .into())
    }

    async fn anomaly_check(&self, feed: F) -> BackendResult<AnomalyOutcome> {
        Ok(self
            .post::<AnomalyBody>(&feed.route(FeedOp::Anomaly), json!({}))
            .await?
            .into())
    }

    async fn set_report_interval(&self, seconds: u64) -> BackendResult<()> {
        self.post::<Ack>("/set-processing-interval", json!({ "interval": seconds }))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn send_message(&self, message: &str, context_source: &str) -> BackendResult<ChatReply> {
        self.post::<ChatReply>(
            "/chat/message",
            json!({ "message": message, "context_source": context_source }),
        )
        .await
    }

    async fn context_probe(&self) -> BackendResult<ContextProbe> {
        let url = self.build_url("/chat/context");
        self.execute_raw::<ContextProbe>(&url, self.client.get(&url)).await
    }

    async fn history(&self) -> BackendResult<Vec<ChatEntry>> {
        let url = self.build_url("/chat/history");
        Ok(self
            .execute_raw::<ChatHistoryBody>(&url, self.client.get(&url))
            .await?
            .history)
    }

    async fn clear_history(&self) -> BackendResult<()> {
        self.post::<Ack>("/chat/clear", json!({})).await?;
        Ok(())
    }
}
