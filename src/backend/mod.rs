pub mod http;
pub mod types;

use async_trait::async_trait;

use crate::session::FeedId;

pub use http::HttpBackend;
pub use types::{
    parse_timestamp, AnalysisOutcome, AnomalyOutcome, BackendError, BackendResult, ChatEntry,
    ChatReply, ChatRole, ContextProbe, Frame, Report, ReportKind,
};

/// Per-feed operations of the processing backend.
///
/// One implementation serves both the live monitor and the cameras; the feed
/// id decides the route.
#[async_trait]
pub trait FeedBackend<F: FeedId>: Send + Sync {
    async fn start(&self, feed: F, url: &str) -> BackendResult<()>;

    async fn stop(&self, feed: F) -> BackendResult<()>;

    async fn frame(&self, feed: F) -> BackendResult<Frame>;

    async fn reports(&self, feed: F) -> BackendResult<Vec<Report>>;

    async fn analyze(&self, feed: F) -> BackendResult<AnalysisOutcome>;

    async fn anomaly_check(&self, feed: F) -> BackendResult<AnomalyOutcome>;

    /// Tells the backend how often to produce automatic reports.
    async fn set_report_interval(&self, seconds: u64) -> BackendResult<()>;
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn send_message(&self, message: &str, context_source: &str) -> BackendResult<ChatReply>;

    async fn context_probe(&self) -> BackendResult<ContextProbe>;

    /// Conversation as stored server side, oldest first.
    async fn history(&self) -> BackendResult<Vec<ChatEntry>>;

    async fn clear_history(&self) -> BackendResult<()>;
}
