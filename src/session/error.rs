use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::backend::BackendError;

use super::state::SessionPhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Analyze,
    AnomalyCheck,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Analyze => "analyze",
            Command::AnomalyCheck => "anomaly check",
        })
    }
}

/// Failures surfaced to whoever issued a session command.
///
/// Failed polls and failed backend stops never show up here: the former are
/// retried on the next tick, the latter already left the feed Idle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("{feed} has no URL configured")]
    NotConfigured { feed: String },
    #[error("failed to start {feed}: {source}")]
    StartFailure {
        feed: String,
        #[source]
        source: BackendError,
    },
    #[error("{feed} cannot {command} while {phase}")]
    CommandRejected {
        feed: String,
        command: Command,
        phase: SessionPhase,
    },
    #[error("{command} failed for {feed}: {source}")]
    CommandFailed {
        feed: String,
        command: Command,
        #[source]
        source: BackendError,
    },
    /// The feed left Active while the request was in flight; the response was dropped.
    #[error("{command} result for {feed} discarded, the session ended first")]
    Discarded { feed: String, command: Command },
    #[error("report interval {0:?} is outside 5s..=60s")]
    InvalidCadence(Duration),
    #[error("{feed} is not configured in this fleet")]
    UnknownFeed { feed: String },
    #[error("{command} task for {feed} did not complete: {reason}")]
    TaskFailed {
        feed: String,
        command: Command,
        reason: String,
    },
}

impl SessionError {
    pub fn is_rejection(&self) -> bool {
        matches!(self, SessionError::CommandRejected { .. })
    }
}
