use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use crate::utils::lock_unpoisoned;

/// What the chat consumer should treat as the video under discussion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContextSource {
    #[default]
    None,
    Live,
    LiveStopped,
    Uploaded,
}

impl ContextSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextSource::None => "none",
            ContextSource::Live => "live",
            ContextSource::LiveStopped => "live_stopped",
            ContextSource::Uploaded => "uploaded",
        }
    }

    /// Lenient parse of the context a chat reply says it used; older servers
    /// say "live video" / "uploaded video" / "general".
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "live" | "live video" => ContextSource::Live,
            "live_stopped" | "live stopped" => ContextSource::LiveStopped,
            "uploaded" | "uploaded video" => ContextSource::Uploaded,
            _ => ContextSource::None,
        }
    }
}

impl fmt::Display for ContextSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque summary handed to the chat consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextPayload {
    /// Which feed or video the summary describes.
    pub label: String,
    pub summary: String,
    pub updated_at: DateTime<Utc>,
}

impl ContextPayload {
    pub fn new(label: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            summary: summary.into(),
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ContextRecord {
    pub source: ContextSource,
    pub payload: Option<ContextPayload>,
    pub revision: u64,
}

type Subscriber = Box<dyn Fn(&ContextRecord) + Send + Sync>;

struct BroadcasterInner {
    record: Mutex<ContextRecord>,
    subscribers: Mutex<Vec<Subscriber>>,
}

/// Owner of the process-wide [`ContextRecord`].
///
/// Cheap to clone; every clone shares the same record. Subscribers run
/// synchronously inside `update` while the record is locked, so they must not
/// call back into `update`.
#[derive(Clone)]
pub struct ContextBroadcaster {
    inner: Arc<BroadcasterInner>,
}

impl fmt::Debug for ContextBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextBroadcaster")
            .field("record", &self.current())
            .finish()
    }
}

impl Default for ContextBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextBroadcaster {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BroadcasterInner {
                record: Mutex::new(ContextRecord::default()),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn current(&self) -> ContextRecord {
        lock_unpoisoned(&self.inner.record).clone()
    }

    pub fn source(&self) -> ContextSource {
        lock_unpoisoned(&self.inner.record).source
    }

    /// Registers a callback for source changes. Callbacks run in registration order.
    pub fn subscribe<S>(&self, subscriber: S)
    where
        S: Fn(&ContextRecord) + Send + Sync + 'static,
    {
        lock_unpoisoned(&self.inner.subscribers).push(Box::new(subscriber));
    }

    /// The single mutation entry point.
    ///
    /// Same source: the payload is refreshed silently. Different source: the
    /// revision is bumped and subscribers are told once. A `None` payload keeps
    /// whatever payload is already recorded. Returns true when subscribers were
    /// notified.
    pub fn update(&self, candidate: ContextSource, payload: Option<ContextPayload>) -> bool {
        let mut record = lock_unpoisoned(&self.inner.record);

        if let Some(payload) = payload {
            record.payload = Some(payload);
        }

        if record.source == candidate {
            return false;
        }

        info!(
            "Context source {} -> {} (revision {})",
            record.source,
            candidate,
            record.revision + 1
        );
        record.source = candidate;
        record.revision += 1;

        let snapshot = record.clone();
        let subscribers = lock_unpoisoned(&self.inner.subscribers);
        for subscriber in subscribers.iter() {
            subscriber(&snapshot);
        }
        true
    }
}
