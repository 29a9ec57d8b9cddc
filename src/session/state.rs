use std::fmt::{self, Debug, Display};
use std::hash::Hash;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::{Frame, Report};

use super::scheduler::TimerHandle;

/// Backend operations a feed can be addressed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOp {
    Start,
    Stop,
    Frame,
    Reports,
    Analyze,
    Anomaly,
}

/// Identifies one feed and knows how that feed is addressed on the backend.
///
/// The live monitor and the surveillance cameras share one state machine; only
/// the id type and its routes differ.
pub trait FeedId:
    Copy + Eq + Ord + Hash + Debug + Display + Serialize + Send + Sync + 'static
{
    /// Path (relative to the API base) for `op` on this feed.
    fn route(self, op: FeedOp) -> String;

    /// Numeric id sent in request bodies, if the backend wants one.
    fn wire_id(self) -> Option<u32>;
}

/// The single built-in live camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct LiveFeed;

impl Display for LiveFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Live feed")
    }
}

impl FeedId for LiveFeed {
    fn route(self, op: FeedOp) -> String {
        match op {
            FeedOp::Start => "/live/start",
            FeedOp::Stop => "/live/stop",
            FeedOp::Frame => "/live/frame",
            FeedOp::Reports => "/live/reports",
            FeedOp::Analyze => "/live/analyze",
            FeedOp::Anomaly => "/live/anomaly",
        }
        .to_string()
    }

    fn wire_id(self) -> Option<u32> {
        None
    }
}

/// One of the configured surveillance cameras.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraId(pub u8);

impl Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Camera {}", self.0)
    }
}

impl FeedId for CameraId {
    fn route(self, op: FeedOp) -> String {
        match op {
            FeedOp::Start => "/surveillance/start".to_string(),
            FeedOp::Stop => "/surveillance/stop".to_string(),
            FeedOp::Frame => format!("/surveillance/frame/{}", self.0),
            FeedOp::Reports => format!("/surveillance/reports/{}", self.0),
            FeedOp::Analyze => format!("/surveillance/analyze/{}", self.0),
            FeedOp::Anomaly => format!("/surveillance/anomaly/{}", self.0),
        }
    }

    fn wire_id(self) -> Option<u32> {
        Some(u32::from(self.0))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum SessionPhase {
    #[default]
    Idle,
    Connecting,
    Active,
    Stopping,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Idle => "Idle",
            SessionPhase::Connecting => "Connecting",
            SessionPhase::Active => "Active",
            SessionPhase::Stopping => "Stopping",
        }
    }
}

impl Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Manual reports kept per feed; the report timer replaces the whole batch.
pub const MAX_MERGED_REPORTS: usize = 5;

#[derive(Debug)]
pub struct SessionState<F: FeedId> {
    pub feed: F,
    pub phase: SessionPhase,
    url: String,
    /// Identifies the current Connecting/Active run; late responses from an
    /// earlier run compare unequal and are dropped.
    pub run_id: Option<Uuid>,
    pub frame_timer: Option<TimerHandle>,
    pub report_timer: Option<TimerHandle>,
    pub analysis_count: u64,
    pub anomaly_count: u64,
    pub last_frame: Option<Frame>,
    pub last_reports: Vec<Report>,
    /// Last frame fetch failed; cleared by the next successful fetch.
    pub degraded: bool,
}

impl<F: FeedId> SessionState<F> {
    pub fn new(feed: F, url: impl Into<String>) -> Self {
        Self {
            feed,
            phase: SessionPhase::Idle,
            url: url.into(),
            run_id: None,
            frame_timer: None,
            report_timer: None,
            analysis_count: 0,
            anomaly_count: 0,
            last_frame: None,
            last_reports: Vec::new(),
            degraded: false,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_configured(&self) -> bool {
        !self.url.trim().is_empty()
    }

    pub fn is_current_run(&self, run_id: Uuid) -> bool {
        self.phase == SessionPhase::Active && self.run_id == Some(run_id)
    }

    pub fn has_armed_timers(&self) -> bool {
        self.frame_timer.is_some() || self.report_timer.is_some()
    }

    /// Prepends a manual report, keeping the newest [`MAX_MERGED_REPORTS`].
    pub fn merge_report(&mut self, report: Report) {
        self.last_reports.insert(0, report);
        self.last_reports.truncate(MAX_MERGED_REPORTS);
    }

    pub fn summary(&self) -> SessionSummary<F> {
        SessionSummary {
            feed: self.feed,
            phase: self.phase,
            analysis_count: self.analysis_count,
            anomaly_count: self.anomaly_count,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot<F> {
        SessionSnapshot {
            feed: self.feed,
            phase: self.phase,
            url: self.url.clone(),
            run_id: self.run_id,
            analysis_count: self.analysis_count,
            anomaly_count: self.anomaly_count,
            last_frame: self.last_frame.clone(),
            last_reports: self.last_reports.clone(),
            degraded: self.degraded,
            timers_armed: self.has_armed_timers(),
        }
    }
}

/// The fields the fleet counters are computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary<F: FeedId> {
    pub feed: F,
    pub phase: SessionPhase,
    pub analysis_count: u64,
    pub anomaly_count: u64,
}

/// Read-only copy of a session for rendering.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot<F: FeedId> {
    pub feed: F,
    pub phase: SessionPhase,
    pub url: String,
    pub run_id: Option<Uuid>,
    pub analysis_count: u64,
    pub anomaly_count: u64,
    pub last_frame: Option<Frame>,
    pub last_reports: Vec<Report>,
    pub degraded: bool,
    pub timers_armed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ReportKind;

    #[test]
    fn camera_routes_carry_the_id() {
        assert_eq!(CameraId(2).route(FeedOp::Frame), "/surveillance/frame/2");
        assert_eq!(CameraId(2).route(FeedOp::Start), "/surveillance/start");
        assert_eq!(LiveFeed.route(FeedOp::Anomaly), "/live/anomaly");
        assert_eq!(LiveFeed.wire_id(), None);
        assert_eq!(CameraId(3).wire_id(), Some(3));
    }

    #[test]
    fn merged_reports_are_newest_first_and_capped() {
        let mut state = SessionState::new(CameraId(1), "rtsp://cam");
        for i in 0..7 {
            state.merge_report(Report::new(ReportKind::Analysis, format!("report {i}")));
        }
        assert_eq!(state.last_reports.len(), MAX_MERGED_REPORTS);
        assert_eq!(state.last_reports[0].content, "report 6");
        assert_eq!(state.last_reports[4].content, "report 2");
    }

    #[test]
    fn blank_url_is_not_configured() {
        assert!(!SessionState::new(LiveFeed, "   ").is_configured());
        assert!(SessionState::new(LiveFeed, "cam://a").is_configured());
    }
}
