use serde::Serialize;
use tokio::sync::broadcast;

use super::state::{FeedId, SessionPhase};

pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Everything a renderer needs to follow a fleet.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SessionEvent<F: FeedId> {
    PhaseChanged { feed: F, phase: SessionPhase },
    FrameUpdated { feed: F, degraded: bool },
    ReportsUpdated { feed: F, count: usize },
    Notice { feed: F, level: NoticeLevel, message: String },
}

impl<F: FeedId> SessionEvent<F> {
    pub fn feed(&self) -> F {
        match self {
            SessionEvent::PhaseChanged { feed, .. }
            | SessionEvent::FrameUpdated { feed, .. }
            | SessionEvent::ReportsUpdated { feed, .. }
            | SessionEvent::Notice { feed, .. } => *feed,
        }
    }
}

/// Fan-out of [`SessionEvent`]s. Emitting with no subscribers is fine.
#[derive(Debug, Clone)]
pub struct EventBus<F: FeedId> {
    tx: broadcast::Sender<SessionEvent<F>>,
}

impl<F: FeedId> Default for EventBus<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: FeedId> EventBus<F> {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent<F>> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SessionEvent<F>) {
        let _ = self.tx.send(event);
    }

    pub fn phase(&self, feed: F, phase: SessionPhase) {
        self.emit(SessionEvent::PhaseChanged { feed, phase });
    }

    pub fn notice(&self, feed: F, level: NoticeLevel, message: impl Into<String>) {
        self.emit(SessionEvent::Notice {
            feed,
            level,
            message: message.into(),
        });
    }
}
