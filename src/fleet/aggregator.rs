use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::watch;

use crate::session::{FeedId, SessionPhase, SessionSummary};
use crate::utils::lock_unpoisoned;

/// Fleet-wide counters derived from per-feed state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetView {
    pub active_count: usize,
    pub configured_count: usize,
    pub total_analyses: u64,
    pub total_anomalies: u64,
}

/// Keeps the last published summary of each feed and recomputes the
/// [`FleetView`] from scratch on every publish.
pub struct FleetAggregator<F: FeedId> {
    summaries: Mutex<BTreeMap<F, SessionSummary<F>>>,
    view: watch::Sender<FleetView>,
}

impl<F: FeedId> Default for FleetAggregator<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: FeedId> std::fmt::Debug for FleetAggregator<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetAggregator")
            .field("view", &self.view())
            .finish()
    }
}

impl<F: FeedId> FleetAggregator<F> {
    pub fn new() -> Self {
        let (view, _) = watch::channel(FleetView::default());
        Self {
            summaries: Mutex::new(BTreeMap::new()),
            view,
        }
    }

    /// Pure recomputation; no incremental bookkeeping to drift.
    pub fn recompute<'a, I>(summaries: I) -> FleetView
    where
        I: IntoIterator<Item = &'a SessionSummary<F>>,
    {
        summaries
            .into_iter()
            .fold(FleetView::default(), |mut view, summary| {
                view.configured_count += 1;
                if summary.phase == SessionPhase::Active {
                    view.active_count += 1;
                }
                view.total_analyses = view.total_analyses.saturating_add(summary.analysis_count);
                view.total_anomalies = view.total_anomalies.saturating_add(summary.anomaly_count);
                view
            })
    }

    /// Records `summary` and returns the refreshed view.
    pub fn publish(&self, summary: SessionSummary<F>) -> FleetView {
        self.publish_and(summary, |_| ())
    }

    /// Like [`publish`](Self::publish), but runs `then` with the new view before
    /// another feed can publish. Used where a decision depends on the fleet as a
    /// whole, e.g. whether the last active feed just stopped.
    pub fn publish_and(&self, summary: SessionSummary<F>, then: impl FnOnce(&FleetView)) -> FleetView {
        let mut summaries = lock_unpoisoned(&self.summaries);
        summaries.insert(summary.feed, summary);
        let view = self.refresh(&summaries);
        then(&view);
        view
    }

    /// Drops a feed that is no longer configured.
    pub fn forget(&self, feed: F) -> FleetView {
        let mut summaries = lock_unpoisoned(&self.summaries);
        summaries.remove(&feed);
        self.refresh(&summaries)
    }

    pub fn view(&self) -> FleetView {
        *self.view.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<FleetView> {
        self.view.subscribe()
    }

    fn refresh(&self, summaries: &BTreeMap<F, SessionSummary<F>>) -> FleetView {
        let view = Self::recompute(summaries.values());
        self.view.send_if_modified(|current| {
            if *current == view {
                return false;
            }
            *current = view;
            true
        });
        view
    }
}
