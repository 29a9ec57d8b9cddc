use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::debug;
use tokio::sync::Mutex;
use tokio::time::timeout;
use uuid::Uuid;

use crate::backend::{AnalysisOutcome, AnomalyOutcome, BackendResult, FeedBackend, Report, ReportKind};
use crate::context::{ContextBroadcaster, ContextPayload, ContextSource};
use crate::fleet::FleetAggregator;
use crate::utils::lock_unpoisoned;

use super::error::{Command, SessionError};
use super::events::{EventBus, NoticeLevel, SessionEvent};
use super::guard::{Flight, SingleFlightGuard};
use super::scheduler::{PollCadence, PollingScheduler, TickFn, TickOutcome, TimerDriver};
use super::state::{FeedId, SessionPhase, SessionSnapshot, SessionState, SessionSummary};
use super::validate_report_interval;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_sampled, log_warn};

/// Share of failed polls that reach the log at warn level.
const POLL_ERROR_LOG_RATE: f64 = 0.1;

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a session needs from the outside, handed in explicitly.
#[derive(Clone)]
pub struct SessionDeps<F: FeedId> {
    pub backend: Arc<dyn FeedBackend<F>>,
    pub timers: Arc<dyn TimerDriver>,
    pub cadence: PollCadence,
    pub context: ContextBroadcaster,
    pub fleet: Arc<FleetAggregator<F>>,
    pub events: EventBus<F>,
    /// How long a backend stop may take before the feed is stopped locally anyway.
    pub stop_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// Already starting or running; nothing was sent to the backend.
    Ignored,
    /// The feed was stopped before the backend answered; the start was rolled back.
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    /// The backend did not confirm the stop; the feed is Idle locally regardless.
    ForcedLocal { reason: String },
    AlreadyIdle,
    /// Another stop for this feed is still running.
    Ignored,
}

impl fmt::Display for StopOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopOutcome::Stopped => f.write_str("stopped"),
            StopOutcome::ForcedLocal { .. } => f.write_str("stopped (forced local)"),
            StopOutcome::AlreadyIdle => f.write_str("already stopped"),
            StopOutcome::Ignored => f.write_str("stop already in progress"),
        }
    }
}

struct SessionInner<F: FeedId> {
    feed: F,
    state: Mutex<SessionState<F>>,
    scheduler: StdMutex<PollingScheduler>,
    backend: Arc<dyn FeedBackend<F>>,
    context: ContextBroadcaster,
    fleet: Arc<FleetAggregator<F>>,
    events: EventBus<F>,
    start_guard: SingleFlightGuard,
    stop_guard: SingleFlightGuard,
    stop_timeout: Duration,
}

/// Lifecycle state machine for one feed.
///
/// Cheap to clone; clones drive the same session. Start and stop run on their
/// own tasks, so a caller that goes away mid-command cannot leave the feed half
/// way between phases.
#[derive(Clone)]
pub struct SessionController<F: FeedId> {
    inner: Arc<SessionInner<F>>,
}

impl<F: FeedId> fmt::Debug for SessionController<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionController")
            .field("feed", &self.inner.feed)
            .finish()
    }
}

impl<F: FeedId> SessionController<F> {
    pub fn new(feed: F, url: impl Into<String>, deps: SessionDeps<F>) -> Self {
        let state = SessionState::new(feed, url);
        deps.fleet.publish(state.summary());

        Self {
            inner: Arc::new(SessionInner {
                feed,
                state: Mutex::new(state),
                scheduler: StdMutex::new(PollingScheduler::new(deps.timers, deps.cadence)),
                backend: deps.backend,
                context: deps.context,
                fleet: deps.fleet,
                events: deps.events,
                start_guard: SingleFlightGuard::new(),
                stop_guard: SingleFlightGuard::new(),
                stop_timeout: deps.stop_timeout,
            }),
        }
    }

    pub fn feed(&self) -> F {
        self.inner.feed
    }

    pub async fn phase(&self) -> SessionPhase {
        self.inner.state.lock().await.phase
    }

    pub async fn summary(&self) -> SessionSummary<F> {
        self.inner.state.lock().await.summary()
    }

    pub async fn snapshot(&self) -> SessionSnapshot<F> {
        self.inner.state.lock().await.snapshot()
    }

    pub fn cadence(&self) -> PollCadence {
        self.inner.scheduler().cadence()
    }

    /// Connects the feed and starts polling.
    ///
    /// A start while one is already in flight, or while the feed is not Idle,
    /// is ignored rather than reported as an error.
    pub async fn start(&self) -> Result<StartOutcome, SessionError> {
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            match inner.start_guard.run(inner.start_inner()).await {
                Flight::Completed(result) => result,
                Flight::Ignored => Ok(StartOutcome::Ignored),
            }
        });

        match task.await {
            Ok(result) => result,
            Err(err) => {
                log_error!("[{}] start task failed: {}", self.inner.feed, err);
                self.inner.force_idle().await;
                Err(SessionError::TaskFailed {
                    feed: self.inner.feed.to_string(),
                    command: Command::Start,
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Stops the feed. Always ends Idle locally, whatever the backend does.
    pub async fn stop(&self) -> StopOutcome {
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            match inner.stop_guard.run(inner.stop_inner()).await {
                Flight::Completed(outcome) => outcome,
                Flight::Ignored => StopOutcome::Ignored,
            }
        });

        match task.await {
            Ok(outcome) => outcome,
            Err(err) => {
                log_error!("[{}] stop task failed: {}", self.inner.feed, err);
                self.inner.force_idle().await;
                StopOutcome::ForcedLocal {
                    reason: err.to_string(),
                }
            }
        }
    }

    /// On-demand analysis of the current scene. Returns the merged report, if
    /// the backend produced one.
    pub async fn analyze(&self) -> Result<Option<Report>, SessionError> {
        let inner = &self.inner;
        let outcome = inner
            .run_command(
                Command::Analyze,
                || inner.backend.analyze(inner.feed),
                |state, outcome: &AnalysisOutcome| {
                    state.analysis_count = state.analysis_count.saturating_add(1);
                    outcome.report.as_deref().map(|text| Report::new(ReportKind::Analysis, text))
                },
            )
            .await?;
        Ok(outcome)
    }

    pub async fn anomaly_check(&self) -> Result<AnomalyOutcome, SessionError> {
        let inner = &self.inner;
        let mut kept = None;
        inner
            .run_command(
                Command::AnomalyCheck,
                || inner.backend.anomaly_check(inner.feed),
                |state, outcome: &AnomalyOutcome| {
                    state.analysis_count = state.analysis_count.saturating_add(1);
                    if outcome.detected {
                        state.anomaly_count = state.anomaly_count.saturating_add(outcome.count);
                    }
                    kept = Some(outcome.clone());
                    outcome.report.as_deref().map(|text| Report::new(ReportKind::Anomaly, text))
                },
            )
            .await?;
        kept.ok_or_else(|| SessionError::Discarded {
            feed: inner.feed.to_string(),
            command: Command::AnomalyCheck,
        })
    }

    /// Changes how often reports are fetched. The backend is told on a best
    /// effort basis; the local cadence changes either way.
    pub async fn set_report_cadence(&self, every: Duration) -> Result<(), SessionError> {
        let every = validate_report_interval(every)?;
        if let Err(err) = self.inner.backend.set_report_interval(every.as_secs()).await {
            log_warn!(
                "[{}] backend did not accept report interval {}s: {}",
                self.inner.feed,
                every.as_secs(),
                err
            );
        }
        self.apply_report_cadence(every).await;
        Ok(())
    }

    /// Local half of [`set_report_cadence`](Self::set_report_cadence), for
    /// callers that already told the backend.
    pub(crate) async fn apply_report_cadence(&self, every: Duration) {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        let scheduler = {
            let mut scheduler = lock_unpoisoned(&inner.scheduler);
            scheduler.set_report_cadence(every);
            scheduler.clone()
        };

        if let (SessionPhase::Active, Some(run_id)) = (state.phase, state.run_id) {
            scheduler.rearm_report(&mut *state, inner.report_tick(run_id));
            log_info!("[{}] report timer re-armed at {}s", inner.feed, every.as_secs());
        }
    }
}

impl<F: FeedId> SessionInner<F> {
    fn scheduler(&self) -> PollingScheduler {
        lock_unpoisoned(&self.scheduler).clone()
    }

    fn publish(&self, state: &SessionState<F>) {
        self.fleet.publish(state.summary());
    }

    fn set_phase(&self, state: &mut SessionState<F>, phase: SessionPhase) {
        state.phase = phase;
        self.events.phase(self.feed, phase);
    }

    async fn start_inner(self: &Arc<Self>) -> Result<StartOutcome, SessionError> {
        let feed = self.feed;

        let (run_id, url) = {
            let mut state = self.state.lock().await;
            if state.phase != SessionPhase::Idle {
                debug!("[{}] start ignored while {}", feed, state.phase);
                return Ok(StartOutcome::Ignored);
            }
            if !state.is_configured() {
                return Err(SessionError::NotConfigured {
                    feed: feed.to_string(),
                });
            }

            let run_id = Uuid::new_v4();
            state.run_id = Some(run_id);
            self.set_phase(&mut state, SessionPhase::Connecting);
            self.publish(&state);
            (run_id, state.url().to_string())
        };

        log_info!("[{}] connecting to {}", feed, url);
        let result = self.backend.start(feed, &url).await;

        let mut state = self.state.lock().await;
        if state.phase != SessionPhase::Connecting || state.run_id != Some(run_id) {
            drop(state);
            log_info!("[{}] start finished after the feed was stopped, rolling back", feed);
            if result.is_ok() {
                self.backend_stop_best_effort().await;
            }
            return Ok(StartOutcome::Superseded);
        }

        match result {
            Ok(()) => {
                self.set_phase(&mut state, SessionPhase::Active);
                self.scheduler()
                    .arm(&mut *state, self.frame_tick(run_id), self.report_tick(run_id));
                self.publish(&state);
                self.context.update(
                    ContextSource::Live,
                    Some(ContextPayload::new(feed.to_string(), format!("{feed} streaming from {url}"))),
                );
                self.events
                    .notice(feed, NoticeLevel::Success, format!("{feed} started"));
                log_info!("[{}] active", feed);
                Ok(StartOutcome::Started)
            }
            Err(err) => {
                state.run_id = None;
                self.set_phase(&mut state, SessionPhase::Idle);
                self.publish(&state);
                self.events.notice(
                    feed,
                    NoticeLevel::Error,
                    format!("Failed to start {feed}: {err}"),
                );
                log_warn!("[{}] start failed: {}", feed, err);
                Err(SessionError::StartFailure {
                    feed: feed.to_string(),
                    source: err,
                })
            }
        }
    }

    async fn stop_inner(&self) -> StopOutcome {
        let feed = self.feed;

        let was_active = {
            let mut state = self.state.lock().await;
            if matches!(state.phase, SessionPhase::Idle | SessionPhase::Stopping) {
                return StopOutcome::AlreadyIdle;
            }

            let was_active = state.phase == SessionPhase::Active;
            let cancelled = self.scheduler().disarm(&mut *state);
            state.run_id = None;
            state.last_frame = None;
            self.set_phase(&mut state, SessionPhase::Stopping);
            self.publish(&state);
            log_info!("[{}] stopping, cancelled {} timer(s)", feed, cancelled);
            was_active
        };

        let outcome = match timeout(self.stop_timeout, self.backend.stop(feed)).await {
            Ok(Ok(())) => StopOutcome::Stopped,
            Ok(Err(err)) => StopOutcome::ForcedLocal {
                reason: err.to_string(),
            },
            Err(_) => StopOutcome::ForcedLocal {
                reason: format!("no reply within {}ms", self.stop_timeout.as_millis()),
            },
        };

        self.finish_stop(was_active).await;

        match &outcome {
            StopOutcome::ForcedLocal { reason } => {
                log_warn!("[{}] backend stop failed ({}), stopped locally", feed, reason);
                self.events
                    .notice(feed, NoticeLevel::Warning, format!("{feed} {outcome}"));
            }
            _ => {
                self.events
                    .notice(feed, NoticeLevel::Info, format!("{feed} {outcome}"));
            }
        }
        outcome
    }

    async fn finish_stop(&self, was_active: bool) {
        let mut state = self.state.lock().await;
        state.degraded = false;
        self.set_phase(&mut state, SessionPhase::Idle);
        self.fleet.publish_and(state.summary(), |view| {
            if was_active && view.active_count == 0 {
                self.context.update(ContextSource::LiveStopped, None);
            }
        });
    }

    /// Last resort when a start or stop task died: nothing may stay stuck
    /// outside Idle.
    async fn force_idle(&self) {
        let mut state = self.state.lock().await;
        if state.phase == SessionPhase::Idle {
            return;
        }
        let was_active = state.phase == SessionPhase::Active;
        self.scheduler().disarm(&mut *state);
        state.run_id = None;
        drop(state);
        self.finish_stop(was_active).await;
    }

    async fn backend_stop_best_effort(&self) {
        match timeout(self.stop_timeout, self.backend.stop(self.feed)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log_warn!("[{}] rollback stop failed: {}", self.feed, err),
            Err(_) => log_warn!("[{}] rollback stop timed out", self.feed),
        }
    }

    /// Shared shape of analyze and anomaly check: precondition under the lock,
    /// backend call without it, then apply only if the same run is still active.
    async fn run_command<T, Call, Fut, Apply>(
        &self,
        command: Command,
        call: Call,
        apply: Apply,
    ) -> Result<Option<Report>, SessionError>
    where
        Call: FnOnce() -> Fut,
        Fut: Future<Output = BackendResult<T>>,
        Apply: FnOnce(&mut SessionState<F>, &T) -> Option<Report>,
    {
        let feed = self.feed;

        let run_id = {
            let state = self.state.lock().await;
            match (state.phase, state.run_id) {
                (SessionPhase::Active, Some(run_id)) => run_id,
                (phase, _) => {
                    return Err(SessionError::CommandRejected {
                        feed: feed.to_string(),
                        command,
                        phase,
                    })
                }
            }
        };

        let result = call().await;

        let mut state = self.state.lock().await;
        if !state.is_current_run(run_id) {
            debug!("[{}] {} result arrived after the session ended", feed, command);
            return Err(SessionError::Discarded {
                feed: feed.to_string(),
                command,
            });
        }

        let value = result.map_err(|err| {
            self.events
                .notice(feed, NoticeLevel::Error, format!("{command} failed for {feed}: {err}"));
            SessionError::CommandFailed {
                feed: feed.to_string(),
                command,
                source: err,
            }
        })?;

        let report = apply(&mut state, &value);
        if let Some(report) = &report {
            state.merge_report(report.clone());
            self.context.update(
                ContextSource::Live,
                Some(ContextPayload::new(feed.to_string(), report.content.clone())),
            );
        }
        self.publish(&state);
        self.events.emit(SessionEvent::ReportsUpdated {
            feed,
            count: state.last_reports.len(),
        });
        Ok(report)
    }

    fn frame_tick(self: &Arc<Self>, run_id: Uuid) -> TickFn {
        let weak = Arc::downgrade(self);
        Arc::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(inner) => inner.poll_frame(run_id).await,
                    None => TickOutcome::Stale,
                }
            })
        })
    }

    fn report_tick(self: &Arc<Self>, run_id: Uuid) -> TickFn {
        let weak = Arc::downgrade(self);
        Arc::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(inner) => inner.poll_reports(run_id).await,
                    None => TickOutcome::Stale,
                }
            })
        })
    }

    async fn poll_frame(&self, run_id: Uuid) -> TickOutcome {
        if !self.state.lock().await.is_current_run(run_id) {
            return TickOutcome::Stale;
        }

        let result = self.backend.frame(self.feed).await;

        let mut state = self.state.lock().await;
        if !state.is_current_run(run_id) {
            debug!("[{}] dropping frame that arrived after stop", self.feed);
            return TickOutcome::Stale;
        }

        match result {
            Ok(frame) => {
                state.last_frame = Some(frame);
                state.degraded = false;
            }
            Err(err) => {
                state.degraded = true;
                log_sampled!(POLL_ERROR_LOG_RATE, "[{}] frame fetch failed: {}", self.feed, err);
            }
        }
        self.events.emit(SessionEvent::FrameUpdated {
            feed: self.feed,
            degraded: state.degraded,
        });
        TickOutcome::Continue
    }

    async fn poll_reports(&self, run_id: Uuid) -> TickOutcome {
        if !self.state.lock().await.is_current_run(run_id) {
            return TickOutcome::Stale;
        }

        let result = self.backend.reports(self.feed).await;

        let mut state = self.state.lock().await;
        if !state.is_current_run(run_id) {
            return TickOutcome::Stale;
        }

        match result {
            Ok(reports) => {
                state.last_reports = reports;
                self.events.emit(SessionEvent::ReportsUpdated {
                    feed: self.feed,
                    count: state.last_reports.len(),
                });
            }
            Err(err) => {
                log_sampled!(POLL_ERROR_LOG_RATE, "[{}] report fetch failed: {}", self.feed, err);
            }
        }
        TickOutcome::Continue
    }
}

impl<F: FeedId> Drop for SessionInner<F> {
    fn drop(&mut self) {
        let scheduler = lock_unpoisoned(&self.scheduler).clone();
        scheduler.disarm(self.state.get_mut());
    }
}
