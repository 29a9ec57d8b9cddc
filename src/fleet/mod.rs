mod aggregator;

pub use aggregator::{FleetAggregator, FleetView};

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinSet;

use crate::backend::{AnomalyOutcome, Report};
use crate::session::{
    validate_report_interval, FeedId, PollCadence, SessionController, SessionDeps, SessionError,
    SessionEvent, SessionPhase, SessionSnapshot, StartOutcome, StopOutcome,
};
use crate::utils::lock_unpoisoned;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

/// Per-feed results of a fleet-wide command.
#[derive(Debug)]
pub struct FleetReport<F: FeedId, T> {
    pub succeeded: Vec<(F, T)>,
    pub failed: Vec<(F, SessionError)>,
}

impl<F: FeedId, T> Default for FleetReport<F, T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<F: FeedId, T> FleetReport<F, T> {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn sort(&mut self) {
        self.succeeded.sort_by_key(|(feed, _)| *feed);
        self.failed.sort_by_key(|(feed, _)| *feed);
    }
}

/// A set of independently controlled feeds sharing one backend, one
/// aggregator and one event stream.
pub struct Fleet<F: FeedId> {
    deps: SessionDeps<F>,
    cadence: StdMutex<PollCadence>,
    sessions: RwLock<BTreeMap<F, SessionController<F>>>,
}

impl<F: FeedId> std::fmt::Debug for Fleet<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fleet")
            .field("cadence", &*lock_unpoisoned(&self.cadence))
            .field("view", &self.view())
            .finish()
    }
}

impl<F: FeedId> Fleet<F> {
    pub fn new(deps: SessionDeps<F>) -> Self {
        Self {
            cadence: StdMutex::new(deps.cadence.clamped()),
            deps,
            sessions: RwLock::new(BTreeMap::new()),
        }
    }

    /// Builds a fleet from `(feed, url)` pairs. Blank urls are skipped.
    pub fn with_feeds<I, S>(deps: SessionDeps<F>, feeds: I) -> Self
    where
        I: IntoIterator<Item = (F, S)>,
        S: Into<String>,
    {
        let mut fleet = Self::new(deps);
        let mut sessions = BTreeMap::new();
        for (feed, url) in feeds {
            let url = url.into();
            if url.trim().is_empty() {
                continue;
            }
            sessions.insert(feed, fleet.spawn_controller(feed, url));
        }
        *fleet.sessions.get_mut() = sessions;
        fleet
    }

    fn spawn_controller(&self, feed: F, url: String) -> SessionController<F> {
        let mut deps = self.deps.clone();
        deps.cadence = *lock_unpoisoned(&self.cadence);
        SessionController::new(feed, url, deps)
    }

    /// Points `feed` at `url`.
    ///
    /// A blank url removes the feed. A different url replaces the session,
    /// resetting its counters; a running feed is stopped first and that stop's
    /// outcome is returned.
    pub async fn configure(&self, feed: F, url: impl Into<String>) -> Option<StopOutcome> {
        let url = url.into();
        if url.trim().is_empty() {
            return self.remove(feed).await;
        }

        if let Some(existing) = self.controller(feed).await {
            if existing.snapshot().await.url == url {
                return None;
            }
        }

        let stopped = self.remove(feed).await;
        let controller = self.spawn_controller(feed, url);
        self.sessions.write().await.insert(feed, controller);
        log_info!("[Fleet] {} configured", feed);
        stopped
    }

    /// Unconfigures `feed`, stopping it first if it is running.
    pub async fn remove(&self, feed: F) -> Option<StopOutcome> {
        let controller = self.sessions.write().await.remove(&feed)?;
        let outcome = match controller.phase().await {
            SessionPhase::Idle => None,
            _ => Some(controller.stop().await),
        };
        self.deps.fleet.forget(feed);
        log_info!("[Fleet] {} removed", feed);
        outcome
    }

    pub async fn controller(&self, feed: F) -> Option<SessionController<F>> {
        self.sessions.read().await.get(&feed).cloned()
    }

    pub async fn feeds(&self) -> Vec<F> {
        self.sessions.read().await.keys().copied().collect()
    }

    async fn lookup(&self, feed: F) -> Result<SessionController<F>, SessionError> {
        self.controller(feed).await.ok_or_else(|| SessionError::UnknownFeed {
            feed: feed.to_string(),
        })
    }

    pub async fn start(&self, feed: F) -> Result<StartOutcome, SessionError> {
        self.lookup(feed).await?.start().await
    }

    pub async fn stop(&self, feed: F) -> Result<StopOutcome, SessionError> {
        Ok(self.lookup(feed).await?.stop().await)
    }

    pub async fn analyze(&self, feed: F) -> Result<Option<Report>, SessionError> {
        self.lookup(feed).await?.analyze().await
    }

    pub async fn anomaly_check(&self, feed: F) -> Result<AnomalyOutcome, SessionError> {
        self.lookup(feed).await?.anomaly_check().await
    }

    /// Controllers whose phase matches `keep`.
    async fn select(&self, keep: impl Fn(SessionPhase) -> bool) -> Vec<SessionController<F>> {
        let controllers: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut selected = Vec::with_capacity(controllers.len());
        for controller in controllers {
            if keep(controller.phase().await) {
                selected.push(controller);
            }
        }
        selected
    }

    /// Runs `command` on every controller concurrently. One feed failing never
    /// holds up or rolls back the others.
    async fn fan_out<T, Cmd, Fut>(controllers: Vec<SessionController<F>>, command: Cmd) -> FleetReport<F, T>
    where
        T: Send + 'static,
        Cmd: Fn(SessionController<F>) -> Fut,
        Fut: Future<Output = Result<T, SessionError>> + Send + 'static,
    {
        let mut tasks = JoinSet::new();
        for controller in controllers {
            let feed = controller.feed();
            let pending = command(controller);
            tasks.spawn(async move { (feed, pending.await) });
        }

        let mut report = FleetReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((feed, Ok(value))) => report.succeeded.push((feed, value)),
                Ok((feed, Err(err))) => {
                    log_warn!("[Fleet] {}", err);
                    report.failed.push((feed, err));
                }
                Err(err) => log_error!("[Fleet] command task failed: {}", err),
            }
        }
        report.sort();
        report
    }

    /// Starts every configured feed.
    pub async fn start_all(&self) -> FleetReport<F, StartOutcome> {
        let controllers = self.select(|_| true).await;
        Self::fan_out(controllers, |controller| async move { controller.start().await }).await
    }

    /// Stops every feed that is not already Idle.
    pub async fn stop_all(&self) -> FleetReport<F, StopOutcome> {
        let controllers = self.select(|phase| phase != SessionPhase::Idle).await;
        Self::fan_out(controllers, |controller| async move { Ok(controller.stop().await) }).await
    }

    pub async fn analyze_all(&self) -> FleetReport<F, Option<Report>> {
        let controllers = self.select(|phase| phase == SessionPhase::Active).await;
        Self::fan_out(controllers, |controller| async move { controller.analyze().await }).await
    }

    pub async fn anomaly_check_all(&self) -> FleetReport<F, AnomalyOutcome> {
        let controllers = self.select(|phase| phase == SessionPhase::Active).await;
        Self::fan_out(controllers, |controller| async move { controller.anomaly_check().await }).await
    }

    /// Sets the report cadence for every feed, current and future.
    ///
    /// The backend interval is global, so it is sent once.
    pub async fn set_report_cadence(&self, every: Duration) -> Result<(), SessionError> {
        let every = validate_report_interval(every)?;
        if let Err(err) = self.deps.backend.set_report_interval(every.as_secs()).await {
            log_warn!("[Fleet] backend did not accept report interval {}s: {}", every.as_secs(), err);
        }

        lock_unpoisoned(&self.cadence).report = every;
        let controllers: Vec<_> = self.sessions.read().await.values().cloned().collect();
        for controller in controllers {
            controller.apply_report_cadence(every).await;
        }
        Ok(())
    }

    pub fn cadence(&self) -> PollCadence {
        *lock_unpoisoned(&self.cadence)
    }

    pub fn view(&self) -> FleetView {
        self.deps.fleet.view()
    }

    pub fn subscribe_view(&self) -> watch::Receiver<FleetView> {
        self.deps.fleet.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent<F>> {
        self.deps.events.subscribe()
    }

    pub async fn snapshots(&self) -> Vec<SessionSnapshot<F>> {
        let controllers: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(controllers.len());
        for controller in controllers {
            snapshots.push(controller.snapshot().await);
        }
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextBroadcaster, ContextSource};
    use crate::session::{CameraId, EventBus, DEFAULT_STOP_TIMEOUT};
    use crate::testing::{CountingTimers, FakeBackend};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use tokio::time::sleep;

    struct Setup {
        backend: Arc<FakeBackend>,
        timers: Arc<CountingTimers>,
        context: ContextBroadcaster,
        fleet: Fleet<CameraId>,
    }

    fn cameras(urls: &[(u8, &str)]) -> Setup {
        let backend = FakeBackend::new();
        let timers = Arc::new(CountingTimers::default());
        let context = ContextBroadcaster::new();
        let deps = SessionDeps {
            backend: backend.clone(),
            timers: timers.clone(),
            cadence: PollCadence::fleet(),
            context: context.clone(),
            fleet: Arc::new(FleetAggregator::new()),
            events: EventBus::new(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        };
        let fleet = Fleet::with_feeds(deps, urls.iter().map(|(id, url)| (CameraId(*id), *url)));
        Setup {
            backend,
            timers,
            context,
            fleet,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn one_failed_start_leaves_the_others_running() {
        let s = cameras(&[(1, "rtsp://a"), (2, "rtsp://b"), (3, "rtsp://c")]);
        s.backend.fail_start(CameraId(2));

        let report = s.fleet.start_all().await;
        assert_eq!(report.succeeded.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, CameraId(2));
        assert!(matches!(report.failed[0].1, SessionError::StartFailure { .. }));

        assert_eq!(s.fleet.view().active_count, 2);
        assert_eq!(s.fleet.view().configured_count, 3);
        let phases: Vec<_> = s.fleet.snapshots().await.into_iter().map(|snap| snap.phase).collect();
        assert_eq!(
            phases,
            vec![SessionPhase::Active, SessionPhase::Idle, SessionPhase::Active]
        );
        assert_eq!(s.timers.armed(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn context_goes_stopped_only_after_the_last_active_feed() {
        let s = cameras(&[(1, "rtsp://a"), (2, "rtsp://b")]);
        s.fleet.start_all().await;
        assert_eq!(s.context.source(), ContextSource::Live);
        let revision = s.context.current().revision;

        s.fleet.stop(CameraId(1)).await.unwrap();
        assert_eq!(s.context.source(), ContextSource::Live);
        assert_eq!(s.context.current().revision, revision);

        s.fleet.stop(CameraId(2)).await.unwrap();
        assert_eq!(s.context.source(), ContextSource::LiveStopped);
        assert_eq!(s.context.current().revision, revision + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fleet_commands_skip_feeds_that_are_not_active() {
        let s = cameras(&[(1, "rtsp://a"), (2, "rtsp://b"), (3, "rtsp://c")]);
        s.fleet.start(CameraId(1)).await.unwrap();
        s.fleet.start(CameraId(3)).await.unwrap();

        let report = s.fleet.analyze_all().await;
        assert!(report.is_clean());
        assert_eq!(report.succeeded.len(), 2);
        assert_eq!(s.fleet.view().total_analyses, 2);

        let report = s.fleet.stop_all().await;
        assert_eq!(report.succeeded.len(), 2);
        assert_eq!(s.fleet.view().active_count, 0);
        assert_eq!(s.timers.live(), 0);
        assert_eq!(s.backend.calls.stops.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_feed_is_an_error() {
        let s = cameras(&[(1, "rtsp://a")]);
        assert_eq!(
            s.fleet.start(CameraId(9)).await.unwrap_err(),
            SessionError::UnknownFeed { feed: "Camera 9".into() }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconfiguring_resets_the_feed() {
        let s = cameras(&[(1, "rtsp://a"), (2, "")]);
        assert_eq!(s.fleet.feeds().await, vec![CameraId(1)]);

        s.fleet.start(CameraId(1)).await.unwrap();
        s.fleet.analyze(CameraId(1)).await.unwrap();
        assert_eq!(s.fleet.view().total_analyses, 1);

        // Same url: nothing happens.
        assert_eq!(s.fleet.configure(CameraId(1), "rtsp://a").await, None);
        assert_eq!(s.fleet.view().active_count, 1);

        let stopped = s.fleet.configure(CameraId(1), "rtsp://moved").await;
        assert_eq!(stopped, Some(StopOutcome::Stopped));
        let snapshot = s.fleet.controller(CameraId(1)).await.unwrap().snapshot().await;
        assert_eq!(snapshot.url, "rtsp://moved");
        assert_eq!(snapshot.phase, SessionPhase::Idle);
        assert_eq!(snapshot.analysis_count, 0);
        assert_eq!(s.fleet.view().total_analyses, 0);

        s.fleet.configure(CameraId(2), "rtsp://b").await;
        assert_eq!(s.fleet.view().configured_count, 2);
        s.fleet.configure(CameraId(1), "").await;
        assert_eq!(s.fleet.feeds().await, vec![CameraId(2)]);
        assert_eq!(s.fleet.view().configured_count, 1);
        assert_eq!(s.timers.live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn report_cadence_applies_to_running_and_future_feeds() {
        let s = cameras(&[(1, "rtsp://a")]);
        s.fleet.start(CameraId(1)).await.unwrap();

        assert!(s.fleet.set_report_cadence(Duration::from_secs(61)).await.is_err());
        s.fleet.set_report_cadence(Duration::from_secs(30)).await.unwrap();
        assert_eq!(s.backend.calls.intervals.load(Ordering::SeqCst), 1);
        assert_eq!(s.fleet.cadence().report, Duration::from_secs(30));

        s.fleet.configure(CameraId(2), "rtsp://b").await;
        let second = s.fleet.controller(CameraId(2)).await.unwrap();
        assert_eq!(second.cadence().report, Duration::from_secs(30));
        assert_eq!(second.cadence().frame, Duration::from_millis(2000));

        sleep(Duration::from_millis(29_000)).await;
        assert_eq!(s.backend.calls.reports.load(Ordering::SeqCst), 0);
        sleep(Duration::from_millis(1_500)).await;
        assert_eq!(s.backend.calls.reports.load(Ordering::SeqCst), 1);
    }
}
