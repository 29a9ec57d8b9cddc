use chrono::{DateTime, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend unreachable: {0}")]
    Transport(String),
    #[error("backend request timed out")]
    Timeout,
    #[error("backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("backend rejected request: {0}")]
    Rejected(String),
    #[error("malformed backend response: {0}")]
    Decode(String),
}

impl BackendError {
    pub fn rejected(message: impl Into<String>) -> Self {
        BackendError::Rejected(message.into())
    }
}

/// Wire shape shared by every backend reply: `{success, error?, ...payload}`.
///
/// Decoded once at the boundary and turned into a `BackendResult` so nothing
/// past the HTTP layer ever looks at `success` again.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(flatten)]
    pub body: T,
}

impl<T> ApiEnvelope<T> {
    pub fn into_result(self) -> BackendResult<T> {
        if self.success {
            Ok(self.body)
        } else {
            Err(BackendError::Rejected(
                self.error
                    .unwrap_or_else(|| "request was not successful".to_string()),
            ))
        }
    }
}

/// Body for replies that carry nothing besides `success`/`error`.
#[derive(Debug, Default, Deserialize)]
pub struct Ack {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    /// Renderable image payload, typically a `data:image/jpeg;base64,...` URL.
    pub data: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct FrameBody {
    #[serde(default)]
    pub frame: Option<String>,
}

impl FrameBody {
    pub fn into_frame(self) -> BackendResult<Frame> {
        match self.frame {
            Some(data) if !data.is_empty() => Ok(Frame {
                data,
                received_at: Utc::now(),
            }),
            _ => Err(BackendError::Rejected("no frame available".to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReportKind {
    Analysis,
    Anomaly,
    Summary,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub content: String,
    #[serde(rename = "type", default = "default_report_kind")]
    pub kind: ReportKind,
    #[serde(default = "Utc::now", deserialize_with = "lenient_timestamp")]
    pub timestamp: DateTime<Utc>,
}

fn default_report_kind() -> ReportKind {
    ReportKind::Other
}

impl Report {
    pub fn new(kind: ReportKind, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind,
            timestamp: Utc::now(),
        }
    }
}

/// Accepts RFC 3339, a naive `YYYY-MM-DDTHH:MM:SS[.f]` (taken as UTC) or a bare
/// `HH:MM:SS` (today, UTC). Anything else becomes "now".
pub fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return parsed.with_timezone(&Utc);
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return naive.and_utc();
    }
    if let Ok(time) = NaiveTime::parse_from_str(raw, "%H:%M:%S") {
        return Utc::now().date_naive().and_time(time).and_utc();
    }
    Utc::now()
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.as_deref().map(parse_timestamp).unwrap_or_else(Utc::now))
}

/// The live endpoint historically answers with one pre-rendered text blob
/// instead of a list, so both shapes are accepted.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ReportsField {
    Batch(Vec<Report>),
    Text(String),
}

#[derive(Debug, Deserialize)]
pub struct ReportsBody {
    #[serde(default)]
    pub reports: Option<ReportsField>,
}

impl ReportsBody {
    pub fn into_reports(self) -> Vec<Report> {
        match self.reports {
            Some(ReportsField::Batch(reports)) => reports,
            Some(ReportsField::Text(text)) if !text.trim().is_empty() => {
                vec![Report::new(ReportKind::Other, text)]
            }
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AnalysisBody {
    #[serde(default)]
    pub report: Option<String>,
    /// Older servers return the whole report log under `analysis`.
    #[serde(default)]
    pub analysis: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisOutcome {
    pub report: Option<String>,
}

impl From<AnalysisBody> for AnalysisOutcome {
    fn from(body: AnalysisBody) -> Self {
        Self {
            report: body.report.or(body.analysis),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AnomalyBody {
    #[serde(default)]
    pub anomalies_detected: bool,
    #[serde(default)]
    pub anomaly_count: Option<u64>,
    #[serde(default)]
    pub report: Option<String>,
    #[serde(default)]
    pub analysis: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnomalyOutcome {
    pub detected: bool,
    /// Number of anomalies to count; at least one when `detected`.
    pub count: u64,
    pub report: Option<String>,
}

impl From<AnomalyBody> for AnomalyOutcome {
    fn from(body: AnomalyBody) -> Self {
        let count = if body.anomalies_detected {
            body.anomaly_count.filter(|n| *n > 0).unwrap_or(1)
        } else {
            0
        };
        Self {
            detected: body.anomalies_detected,
            count,
            report: body.report.or(body.analysis),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatReply {
    #[serde(default)]
    pub response: String,
    #[serde(default, alias = "context_type")]
    pub context_source: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    #[serde(other)]
    System,
}

/// One stored chat message as the backend keeps it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub role: ChatRole,
    pub content: String,
    #[serde(default = "Utc::now", deserialize_with = "lenient_timestamp")]
    pub timestamp: DateTime<Utc>,
}

/// `GET /chat/history` answers without `success`, so it is read raw.
#[derive(Debug, Default, Deserialize)]
pub struct ChatHistoryBody {
    #[serde(default)]
    pub history: Vec<ChatEntry>,
}

/// `GET /chat/context` is not wrapped in the `{success}` envelope.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ContextProbe {
    #[serde(default)]
    pub current_context_source: Option<String>,
    #[serde(default)]
    pub has_live_context: bool,
    #[serde(default)]
    pub has_uploaded_context: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode<T: serde::de::DeserializeOwned>(raw: &str) -> BackendResult<T> {
        serde_json::from_str::<ApiEnvelope<T>>(raw)
            .map_err(|err| BackendError::Decode(err.to_string()))?
            .into_result()
    }

    #[test]
    fn failed_envelope_surfaces_backend_message() {
        let err = decode::<Ack>(r#"{"success": false, "error": "camera busy"}"#).unwrap_err();
        assert_eq!(err, BackendError::Rejected("camera busy".into()));

        let err = decode::<Ack>(r#"{}"#).unwrap_err();
        assert!(matches!(err, BackendError::Rejected(_)));
    }

    #[test]
    fn missing_frame_is_a_failure() {
        let body = decode::<FrameBody>(r#"{"success": true}"#).unwrap();
        assert!(body.into_frame().is_err());

        let frame = decode::<FrameBody>(r#"{"success": true, "frame": "data:image/jpeg;base64,AAA"}"#)
            .unwrap()
            .into_frame()
            .unwrap();
        assert_eq!(frame.data, "data:image/jpeg;base64,AAA");
    }

    #[test]
    fn reports_accept_list_and_text() {
        let batch = decode::<ReportsBody>(
            r#"{"success": true, "reports": [
                {"content": "two people", "type": "analysis", "timestamp": "2024-05-01T10:00:00Z"},
                {"content": "door left open", "type": "intrusion"}
            ]}"#,
        )
        .unwrap()
        .into_reports();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].kind, ReportKind::Analysis);
        assert_eq!(batch[1].kind, ReportKind::Other);

        let text = decode::<ReportsBody>(r#"{"success": true, "reports": "LIVE ANALYSIS"}"#)
            .unwrap()
            .into_reports();
        assert_eq!(text.len(), 1);
        assert_eq!(text[0].content, "LIVE ANALYSIS");

        let empty = decode::<ReportsBody>(r#"{"success": true}"#).unwrap().into_reports();
        assert!(empty.is_empty());
    }

    #[test]
    fn backend_timestamps_are_read_leniently() {
        let rfc = parse_timestamp("2024-05-01T10:00:00Z");
        assert_eq!(rfc.to_rfc3339(), "2024-05-01T10:00:00+00:00");

        let naive = parse_timestamp("2024-05-01T10:00:00.250000");
        assert_eq!(naive.timestamp_millis(), rfc.timestamp_millis() + 250);

        let clock = parse_timestamp("14:05:09");
        assert_eq!(clock.format("%H:%M:%S").to_string(), "14:05:09");

        let history: ChatHistoryBody = serde_json::from_str(
            r#"{"history": [
                {"role": "user", "content": "hi", "timestamp": "2024-05-01T10:00:00.5"},
                {"role": "assistant", "content": "hello"}
            ], "timestamp": "2024-05-01T10:00:01"}"#,
        )
        .unwrap();
        assert_eq!(history.history.len(), 2);
        assert_eq!(history.history[1].role, ChatRole::Assistant);
    }

    #[test]
    fn anomaly_count_defaults_to_one_when_detected() {
        let outcome: AnomalyOutcome =
            decode::<AnomalyBody>(r#"{"success": true, "anomalies_detected": true}"#)
                .unwrap()
                .into();
        assert_eq!(outcome.count, 1);

        let outcome: AnomalyOutcome = decode::<AnomalyBody>(
            r#"{"success": true, "anomalies_detected": true, "anomaly_count": 2, "report": "r"}"#,
        )
        .unwrap()
        .into();
        assert_eq!(outcome.count, 2);
        assert_eq!(outcome.report.as_deref(), Some("r"));

        let outcome: AnomalyOutcome =
            decode::<AnomalyBody>(r#"{"success": true, "anomalies_detected": false, "anomaly_count": 4}"#)
                .unwrap()
                .into();
        assert_eq!(outcome.count, 0);
    }
}
