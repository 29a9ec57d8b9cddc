use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::state::{FeedId, SessionState};
use super::{MAX_REPORT_INTERVAL, MIN_FRAME_INTERVAL, MIN_REPORT_INTERVAL};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Frame,
    Report,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerKind::Frame => f.write_str("frame"),
            TimerKind::Report => f.write_str("report"),
        }
    }
}

/// What a tick reports back to the timer that fired it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    /// The owning session is no longer in the run this timer was armed for.
    Stale,
}

pub type TickFuture = Pin<Box<dyn Future<Output = TickOutcome> + Send>>;
pub type TickFn = Arc<dyn Fn() -> TickFuture + Send + Sync>;

/// Frame and report cadences for one kind of feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollCadence {
    pub frame: Duration,
    pub report: Duration,
}

impl PollCadence {
    pub const fn new(frame: Duration, report: Duration) -> Self {
        Self { frame, report }
    }

    /// Single live monitor: frame every second, reports every five.
    pub const fn live() -> Self {
        Self::new(Duration::from_millis(1000), Duration::from_millis(5000))
    }

    /// Per surveillance camera: frame every two seconds, reports every ten.
    pub const fn fleet() -> Self {
        Self::new(Duration::from_millis(2000), Duration::from_millis(10_000))
    }

    /// Pulls both periods into the range a session can poll at: frames no
    /// faster than [`MIN_FRAME_INTERVAL`], reports within the backend's bounds.
    pub fn clamped(self) -> Self {
        Self {
            frame: self.frame.max(MIN_FRAME_INTERVAL),
            report: self.report.clamp(MIN_REPORT_INTERVAL, MAX_REPORT_INTERVAL),
        }
    }
}

/// Ownership of one armed timer. Not `Clone`: whoever holds it is the one
/// that has to hand it back to [`TimerDriver::cancel`].
pub struct TimerHandle {
    id: u64,
    kind: TimerKind,
    every: Duration,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TimerHandle {
    pub fn new(kind: TimerKind, every: Duration, token: CancellationToken, task: Option<JoinHandle<()>>) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            every,
            token,
            task,
        }
    }

    /// True once the timer was cancelled, either by its owner or by itself
    /// after a stale tick.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map(|task| task.is_finished()).unwrap_or(true)
    }

    fn cancel(&self) {
        self.token.cancel();
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("every", &self.every)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// The timer primitive. Swappable so tests can count arms and cancels.
pub trait TimerDriver: Send + Sync {
    fn arm(&self, kind: TimerKind, every: Duration, tick: TickFn) -> TimerHandle;

    fn cancel(&self, handle: TimerHandle);
}

/// Recurring tokio task per timer, stopped through a `CancellationToken`.
///
/// Cancelling does not abort a tick that is already awaiting the backend; that
/// tick finishes and its own phase check throws the result away.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioTimers;

impl TimerDriver for TokioTimers {
    fn arm(&self, kind: TimerKind, every: Duration, tick: TickFn) -> TimerHandle {
        let every = if every < MIN_FRAME_INTERVAL {
            log_warn!("{kind} timer asked for a {every:?} period, using {MIN_FRAME_INTERVAL:?}");
            MIN_FRAME_INTERVAL
        } else {
            every
        };
        let token = CancellationToken::new();
        let loop_token = token.clone();

        let task = tokio::spawn(async move {
            // Like a browser interval: the first tick lands one period after arming.
            let mut ticker = time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {
                        if tick().await == TickOutcome::Stale {
                            log_info!("{kind} timer found its session inactive, cancelling itself");
                            loop_token.cancel();
                            break;
                        }
                    }
                }
            }
        });

        TimerHandle::new(kind, every, token, Some(task))
    }

    fn cancel(&self, handle: TimerHandle) {
        handle.cancel();
    }
}

/// Keeps exactly one frame timer and one report timer per active session.
#[derive(Clone)]
pub struct PollingScheduler {
    timers: Arc<dyn TimerDriver>,
    cadence: PollCadence,
}

impl fmt::Debug for PollingScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingScheduler")
            .field("cadence", &self.cadence)
            .finish()
    }
}

impl PollingScheduler {
    pub fn new(timers: Arc<dyn TimerDriver>, cadence: PollCadence) -> Self {
        Self {
            timers,
            cadence: cadence.clamped(),
        }
    }

    pub fn cadence(&self) -> PollCadence {
        self.cadence
    }

    pub fn set_report_cadence(&mut self, every: Duration) {
        self.cadence.report = every;
    }

    /// Arms both timers, disarming whatever the session still held first.
    pub fn arm<F: FeedId>(&self, state: &mut SessionState<F>, frame_tick: TickFn, report_tick: TickFn) {
        self.disarm(state);
        state.frame_timer = Some(self.timers.arm(TimerKind::Frame, self.cadence.frame, frame_tick));
        state.report_timer = Some(self.timers.arm(TimerKind::Report, self.cadence.report, report_tick));
    }

    /// Replaces only the report timer, at the current report cadence.
    pub fn rearm_report<F: FeedId>(&self, state: &mut SessionState<F>, report_tick: TickFn) {
        if let Some(handle) = state.report_timer.take() {
            self.timers.cancel(handle);
        }
        state.report_timer = Some(self.timers.arm(TimerKind::Report, self.cadence.report, report_tick));
    }

    /// Cancels both timers. Returns how many were actually armed.
    pub fn disarm<F: FeedId>(&self, state: &mut SessionState<F>) -> usize {
        let mut cancelled = 0;
        for handle in [state.frame_timer.take(), state.report_timer.take()].into_iter().flatten() {
            self.timers.cancel(handle);
            cancelled += 1;
        }
        cancelled
    }
}
