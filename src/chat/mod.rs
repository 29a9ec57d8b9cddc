use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::backend::{BackendError, ChatBackend, ChatEntry, ChatRole, ContextProbe};
use crate::context::{ContextBroadcaster, ContextRecord, ContextSource};
use crate::session::{Flight, SingleFlightGuard};
use crate::utils::lock_unpoisoned;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    #[error("message is empty")]
    EmptyMessage,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Context the backend says it answered from, for assistant replies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextSource>,
}

impl ChatTurn {
    fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            context: None,
        }
    }
}

impl From<ChatEntry> for ChatTurn {
    fn from(entry: ChatEntry) -> Self {
        Self {
            role: entry.role,
            content: entry.content,
            timestamp: entry.timestamp,
            context: None,
        }
    }
}

/// Exported conversation, as written by [`ChatSession::export`].
#[derive(Debug, Clone, Serialize)]
pub struct ChatExport {
    pub exported_at: DateTime<Utc>,
    pub message_count: usize,
    pub messages: Vec<ChatTurn>,
}

/// Text shown when the context source changes under an ongoing conversation.
pub fn context_notice(record: &ContextRecord) -> Option<String> {
    let label = record
        .payload
        .as_ref()
        .map(|payload| payload.label.as_str())
        .unwrap_or("the video");

    match record.source {
        ContextSource::Live => Some(format!(
            "{label} is live. You can now ask me about what the camera sees."
        )),
        ContextSource::LiveStopped => Some(format!(
            "{label} has stopped. I can still answer questions about what was observed."
        )),
        ContextSource::Uploaded => Some(
            "A new video has been analyzed. You can now ask me questions about the video content!"
                .to_string(),
        ),
        ContextSource::None => None,
    }
}

/// Chat consumer of the current video context.
///
/// Sends carry whichever context source is current at the moment of sending.
/// Only one message is in flight at a time; further sends are ignored.
#[derive(Clone)]
pub struct ChatSession {
    backend: Arc<dyn ChatBackend>,
    context: ContextBroadcaster,
    guard: SingleFlightGuard,
    history: Arc<Mutex<Vec<ChatTurn>>>,
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("turns", &lock_unpoisoned(&self.history).len())
            .field("in_flight", &self.guard.is_in_flight())
            .finish()
    }
}

impl ChatSession {
    pub fn new(backend: Arc<dyn ChatBackend>, context: ContextBroadcaster) -> Self {
        Self {
            backend,
            context,
            guard: SingleFlightGuard::new(),
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Subscribes to context changes so each one leaves a notice in the history.
    pub fn attach(&self) {
        let history = Arc::clone(&self.history);
        self.context.subscribe(move |record| {
            if let Some(notice) = context_notice(record) {
                lock_unpoisoned(&history).push(ChatTurn::new(ChatRole::System, notice));
            }
        });
    }

    pub async fn send(&self, message: &str) -> Result<Flight<ChatTurn>, ChatError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let flight = self
            .guard
            .run(async {
                let source = self.context.source();
                let reply = self.backend.send_message(message, source.as_str()).await?;
                let answered_from = reply.context_source.as_deref().map(ContextSource::parse_lenient);
                if let Some(reported) = answered_from.filter(|reported| *reported != source) {
                    log_warn!(
                        "[Chat] sent with {} context but the backend answered from {}",
                        source,
                        reported
                    );
                }
                let mut answer = ChatTurn::new(ChatRole::Assistant, reply.response);
                answer.context = answered_from;

                let mut history = lock_unpoisoned(&self.history);
                history.push(ChatTurn::new(ChatRole::User, message));
                history.push(answer.clone());
                Ok::<_, ChatError>(answer)
            })
            .await;

        match flight {
            Flight::Completed(Ok(answer)) => Ok(Flight::Completed(answer)),
            Flight::Completed(Err(err)) => {
                log_warn!("[Chat] message failed: {}", err);
                Err(err)
            }
            Flight::Ignored => Ok(Flight::Ignored),
        }
    }

    /// Replaces local history with what the backend has stored.
    pub async fn load_history(&self) -> Result<usize, ChatError> {
        let entries = self.backend.history().await?;
        let mut history = lock_unpoisoned(&self.history);
        *history = entries.into_iter().map(ChatTurn::from).collect();
        Ok(history.len())
    }

    pub async fn clear(&self) -> Result<(), ChatError> {
        self.backend.clear_history().await?;
        lock_unpoisoned(&self.history).clear();
        log_info!("[Chat] history cleared");
        Ok(())
    }

    pub async fn probe(&self) -> Result<ContextProbe, ChatError> {
        Ok(self.backend.context_probe().await?)
    }

    pub fn history(&self) -> Vec<ChatTurn> {
        lock_unpoisoned(&self.history).clone()
    }

    pub fn export(&self) -> ChatExport {
        let messages = self.history();
        ChatExport {
            exported_at: Utc::now(),
            message_count: messages.len(),
            messages,
        }
    }

    pub fn is_sending(&self) -> bool {
        self.guard.is_in_flight()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextPayload;
    use crate::testing::FakeBackend;
    use std::sync::atomic::Ordering;
    use tokio::time::Duration;

    fn session() -> (Arc<FakeBackend>, ContextBroadcaster, ChatSession) {
        let backend = FakeBackend::new();
        let context = ContextBroadcaster::new();
        let chat = ChatSession::new(backend.clone(), context.clone());
        chat.attach();
        (backend, context, chat)
    }

    #[tokio::test]
    async fn empty_message_never_reaches_the_backend() {
        let (backend, _, chat) = session();
        assert_eq!(chat.send("   ").await.unwrap_err(), ChatError::EmptyMessage);
        assert_eq!(backend.calls.chats.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn sends_carry_the_current_context_source() {
        let (backend, context, chat) = session();

        let first = chat.send("hello").await.unwrap().completed().unwrap();
        assert_eq!(first.context, Some(ContextSource::None));
        context.update(ContextSource::Live, Some(ContextPayload::new("Camera 1", "gate")));
        let answer = chat.send("what do you see?").await.unwrap().completed().unwrap();

        assert_eq!(answer.content, "echo: what do you see?");
        assert_eq!(answer.context, Some(ContextSource::Live));
        assert_eq!(backend.chat_context(), vec!["none", "live"]);
    }

    #[tokio::test]
    async fn answers_record_the_context_the_backend_used() {
        let (backend, context, chat) = session();
        context.update(ContextSource::Live, Some(ContextPayload::new("Live feed", "desk")));
        backend.answer_from("uploaded video");

        let answer = chat.send("what happened?").await.unwrap().completed().unwrap();
        assert_eq!(backend.chat_context(), vec!["live"]);
        assert_eq!(answer.context, Some(ContextSource::Uploaded));
        assert_eq!(chat.history().last().unwrap().context, Some(ContextSource::Uploaded));
    }

    #[tokio::test(start_paused = true)]
    async fn second_send_is_ignored_while_one_is_pending() {
        let (backend, _, chat) = session();
        backend.delay_chat(Duration::from_millis(200));

        let (first, second) = tokio::join!(chat.send("one"), chat.send("two"));
        assert!(matches!(first.unwrap(), Flight::Completed(_)));
        assert!(second.unwrap().is_ignored());
        assert_eq!(backend.calls.chats.load(Ordering::SeqCst), 1);
        assert_eq!(chat.history().len(), 2);
    }

    #[tokio::test]
    async fn context_changes_leave_one_notice_each() {
        let (_, context, chat) = session();

        context.update(ContextSource::Live, Some(ContextPayload::new("Camera 2", "yard")));
        context.update(ContextSource::Live, Some(ContextPayload::new("Camera 2", "yard, later")));
        context.update(ContextSource::LiveStopped, None);

        let notices: Vec<_> = chat
            .history()
            .into_iter()
            .filter(|turn| turn.role == ChatRole::System)
            .map(|turn| turn.content)
            .collect();
        assert_eq!(notices.len(), 2);
        assert!(notices[0].starts_with("Camera 2 is live"));
        assert!(notices[1].starts_with("Camera 2 has stopped"));
    }

    #[tokio::test]
    async fn history_can_be_loaded_exported_and_cleared() {
        let (backend, _, chat) = session();

        assert_eq!(chat.load_history().await.unwrap(), 2);
        assert!(chat.send("and now?").await.unwrap().completed().is_some());

        let export = chat.export();
        assert_eq!(export.message_count, 4);
        assert_eq!(export.messages[0].content, "anyone at the gate?");

        chat.clear().await.unwrap();
        assert!(chat.history().is_empty());
        assert_eq!(backend.calls.clears.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn no_notice_for_the_empty_context() {
        assert!(context_notice(&ContextRecord::default()).is_none());
    }
}
