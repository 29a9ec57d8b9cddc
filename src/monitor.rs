use std::sync::Arc;

use crate::backend::{BackendResult, ChatBackend, FeedBackend, HttpBackend};
use crate::chat::ChatSession;
use crate::context::{ContextBroadcaster, ContextPayload, ContextSource};
use crate::fleet::{Fleet, FleetAggregator};
use crate::session::{CameraId, EventBus, LiveFeed, SessionDeps, TimerDriver, TokioTimers};
use crate::settings::MonitorSettings;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::log_info;

/// Everything one operator console needs: the live monitor, the camera fleet
/// and the chat, all sharing one context record.
///
/// The two fleets count their active feeds separately. Stopping the last
/// active feed of either one moves the context to `LiveStopped`, even while
/// the other fleet still has feeds running; the next start or manual command
/// on a running feed moves it back to `Live`.
pub struct Monitor {
    context: ContextBroadcaster,
    live: Fleet<LiveFeed>,
    cameras: Fleet<CameraId>,
    chat: ChatSession,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("context", &self.context.current())
            .field("live", &self.live)
            .field("cameras", &self.cameras)
            .finish()
    }
}

impl Monitor {
    /// Wires everything against the HTTP backend described by `settings`.
    pub fn connect(settings: &MonitorSettings) -> BackendResult<Self> {
        let backend = HttpBackend::new(settings.api_base_url.clone(), settings.request_timeout())?;
        Ok(Self::with_backend(settings, Arc::new(backend), Arc::new(TokioTimers)))
    }

    pub fn with_backend<B>(settings: &MonitorSettings, backend: Arc<B>, timers: Arc<dyn TimerDriver>) -> Self
    where
        B: FeedBackend<LiveFeed> + FeedBackend<CameraId> + ChatBackend + 'static,
    {
        let context = ContextBroadcaster::new();

        let live = Fleet::with_feeds(
            SessionDeps {
                backend: backend.clone(),
                timers: timers.clone(),
                cadence: settings.live.cadence(),
                context: context.clone(),
                fleet: Arc::new(FleetAggregator::new()),
                events: EventBus::new(),
                stop_timeout: settings.stop_timeout(),
            },
            [(LiveFeed, settings.live.source.clone())],
        );

        let cameras = Fleet::with_feeds(
            SessionDeps {
                backend: backend.clone(),
                timers,
                cadence: settings.surveillance.cadence(),
                context: context.clone(),
                fleet: Arc::new(FleetAggregator::new()),
                events: EventBus::new(),
                stop_timeout: settings.stop_timeout(),
            },
            settings.surveillance.feeds(),
        );

        let chat = ChatSession::new(backend, context.clone());
        chat.attach();

        Self {
            context,
            live,
            cameras,
            chat,
        }
    }

    pub fn context(&self) -> &ContextBroadcaster {
        &self.context
    }

    pub fn live(&self) -> &Fleet<LiveFeed> {
        &self.live
    }

    pub fn cameras(&self) -> &Fleet<CameraId> {
        &self.cameras
    }

    pub fn chat(&self) -> &ChatSession {
        &self.chat
    }

    /// Hands the result of an uploaded-video analysis to the chat. Always wins
    /// over whatever live context was current.
    pub fn record_upload(&self, label: impl Into<String>, summary: impl Into<String>) -> bool {
        let payload = ContextPayload::new(label, summary);
        log_info!("[Monitor] uploaded analysis for {} recorded", payload.label);
        self.context.update(ContextSource::Uploaded, Some(payload))
    }

    /// Stops everything that is running. Used on shutdown.
    pub async fn shutdown(&self) {
        let live = self.live.stop_all().await;
        let cameras = self.cameras.stop_all().await;
        log_info!(
            "[Monitor] shut down {} live and {} camera feed(s)",
            live.succeeded.len(),
            cameras.succeeded.len()
        );
    }
}
