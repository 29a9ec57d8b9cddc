pub mod backend;
pub mod chat;
mod cli;
pub mod context;
pub mod fleet;
pub mod monitor;
pub mod session;
pub mod settings;
pub mod utils;

#[cfg(test)]
mod testing;

pub use backend::{BackendError, ChatBackend, FeedBackend, HttpBackend};
pub use chat::{ChatError, ChatSession, ChatTurn};
pub use cli::{run, Cli, CliCommand};
pub use context::{ContextBroadcaster, ContextPayload, ContextRecord, ContextSource};
pub use fleet::{Fleet, FleetAggregator, FleetReport, FleetView};
pub use monitor::Monitor;
pub use session::{
    CameraId, FeedId, LiveFeed, PollCadence, SessionController, SessionError, SessionPhase,
    StartOutcome, StopOutcome,
};
pub use settings::{MonitorSettings, SettingsStore};
