mod controller;
mod error;
mod events;
mod guard;
mod scheduler;
mod state;

pub use controller::{
    SessionController, SessionDeps, StartOutcome, StopOutcome, DEFAULT_STOP_TIMEOUT,
};
pub use error::{Command, SessionError};
pub use events::{EventBus, NoticeLevel, SessionEvent, EVENT_CHANNEL_CAPACITY};
pub use guard::{Flight, SingleFlightGuard};
pub use scheduler::{
    PollCadence, PollingScheduler, TickFn, TickFuture, TickOutcome, TimerDriver, TimerHandle,
    TimerKind, TokioTimers,
};
pub use state::{
    CameraId, FeedId, FeedOp, LiveFeed, SessionPhase, SessionSnapshot, SessionState,
    SessionSummary, MAX_MERGED_REPORTS,
};

use std::time::Duration;

/// Fastest frame cadence a session will poll at.
pub const MIN_FRAME_INTERVAL: Duration = Duration::from_millis(100);
/// Smallest report interval the backend accepts.
pub const MIN_REPORT_INTERVAL: Duration = Duration::from_secs(5);
/// Largest report interval the backend accepts.
pub const MAX_REPORT_INTERVAL: Duration = Duration::from_secs(60);

pub fn validate_report_interval(every: Duration) -> Result<Duration, SessionError> {
    if every < MIN_REPORT_INTERVAL || every > MAX_REPORT_INTERVAL {
        return Err(SessionError::InvalidCadence(every));
    }
    Ok(every)
}
