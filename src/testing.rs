//! Test doubles shared by the in-crate unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::{sleep, Duration};

use crate::backend::{
    AnalysisOutcome, AnomalyOutcome, BackendError, BackendResult, ChatBackend, ChatEntry, ChatReply,
    ChatRole, ContextProbe, FeedBackend, Frame, Report, ReportKind,
};
use crate::session::{FeedId, TickFn, TimerDriver, TimerHandle, TimerKind, TokioTimers};

/// Real tokio timers plus arm/cancel bookkeeping.
#[derive(Debug, Default)]
pub struct CountingTimers {
    inner: TokioTimers,
    armed: AtomicUsize,
    cancelled: AtomicUsize,
}

impl CountingTimers {
    pub fn armed(&self) -> usize {
        self.armed.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Timers armed and not yet handed back for cancellation.
    pub fn live(&self) -> usize {
        self.armed() - self.cancelled()
    }
}

impl TimerDriver for CountingTimers {
    fn arm(&self, kind: TimerKind, every: Duration, tick: TickFn) -> TimerHandle {
        self.armed.fetch_add(1, Ordering::SeqCst);
        self.inner.arm(kind, every, tick)
    }

    fn cancel(&self, handle: TimerHandle) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
        self.inner.cancel(handle);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBehavior {
    #[default]
    Ok,
    Fail,
    Hang,
}

#[derive(Debug, Default)]
pub struct Calls {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub frames: AtomicUsize,
    pub reports: AtomicUsize,
    pub analyses: AtomicUsize,
    pub anomaly_checks: AtomicUsize,
    pub intervals: AtomicUsize,
    pub chats: AtomicUsize,
    pub clears: AtomicUsize,
}

#[derive(Debug)]
struct Script {
    start_delay: Duration,
    failing_starts: HashSet<String>,
    stop: StopBehavior,
    frames_fail: bool,
    frame_delay: Duration,
    reports_fail: bool,
    command_delay: Duration,
    commands_fail: bool,
    anomaly: AnomalyOutcome,
    interval_fails: bool,
    chat_delay: Duration,
    chat_context: Vec<String>,
    reply_context: Option<String>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            start_delay: Duration::ZERO,
            failing_starts: HashSet::new(),
            stop: StopBehavior::Ok,
            frames_fail: false,
            frame_delay: Duration::ZERO,
            reports_fail: false,
            command_delay: Duration::ZERO,
            commands_fail: false,
            anomaly: AnomalyOutcome {
                detected: false,
                count: 0,
                report: Some("all clear".to_string()),
            },
            interval_fails: false,
            chat_delay: Duration::ZERO,
            chat_context: Vec::new(),
            reply_context: None,
        }
    }
}

/// Scriptable in-memory backend. Feeds are keyed by their display name.
#[derive(Debug, Default)]
pub struct FakeBackend {
    script: Mutex<Script>,
    pub calls: Calls,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn delay_starts(&self, delay: Duration) {
        self.script.lock().unwrap().start_delay = delay;
    }

    pub fn fail_start(&self, feed: impl std::fmt::Display) {
        self.script.lock().unwrap().failing_starts.insert(feed.to_string());
    }

    pub fn stop_behavior(&self, behavior: StopBehavior) {
        self.script.lock().unwrap().stop = behavior;
    }

    pub fn fail_frames(&self, fail: bool) {
        self.script.lock().unwrap().frames_fail = fail;
    }

    pub fn delay_frames(&self, delay: Duration) {
        self.script.lock().unwrap().frame_delay = delay;
    }

    pub fn fail_reports(&self, fail: bool) {
        self.script.lock().unwrap().reports_fail = fail;
    }

    pub fn fail_commands(&self, fail: bool) {
        self.script.lock().unwrap().commands_fail = fail;
    }

    pub fn delay_commands(&self, delay: Duration) {
        self.script.lock().unwrap().command_delay = delay;
    }

    pub fn anomaly(&self, outcome: AnomalyOutcome) {
        self.script.lock().unwrap().anomaly = outcome;
    }

    pub fn fail_interval(&self, fail: bool) {
        self.script.lock().unwrap().interval_fails = fail;
    }

    pub fn delay_chat(&self, delay: Duration) {
        self.script.lock().unwrap().chat_delay = delay;
    }

    /// Makes chat replies claim this context instead of echoing the one sent.
    pub fn answer_from(&self, context: &str) {
        self.script.lock().unwrap().reply_context = Some(context.to_string());
    }

    /// Context sources the chat endpoint was called with, oldest first.
    pub fn chat_context(&self) -> Vec<String> {
        self.script.lock().unwrap().chat_context.clone()
    }

    fn read<T>(&self, f: impl FnOnce(&Script) -> T) -> T {
        f(&self.script.lock().unwrap())
    }
}

#[async_trait]
impl<F: FeedId> FeedBackend<F> for FakeBackend {
    async fn start(&self, feed: F, _url: &str) -> BackendResult<()> {
        self.calls.starts.fetch_add(1, Ordering::SeqCst);
        let (delay, fails) = self.read(|s| (s.start_delay, s.failing_starts.contains(&feed.to_string())));
        sleep(delay).await;
        if fails {
            return Err(BackendError::rejected("could not open stream"));
        }
        Ok(())
    }

    async fn stop(&self, _feed: F) -> BackendResult<()> {
        self.calls.stops.fetch_add(1, Ordering::SeqCst);
        match self.read(|s| s.stop) {
            StopBehavior::Ok => Ok(()),
            StopBehavior::Fail => Err(BackendError::Transport("connection refused".into())),
            StopBehavior::Hang => {
                sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }
    }

    async fn frame(&self, _feed: F) -> BackendResult<Frame> {
        self.calls.frames.fetch_add(1, Ordering::SeqCst);
        sleep(self.read(|s| s.frame_delay)).await;
        if self.read(|s| s.frames_fail) {
            return Err(BackendError::rejected("no frame available"));
        }
        Ok(Frame {
            data: "data:image/jpeg;base64,AAAA".to_string(),
            received_at: Utc::now(),
        })
    }

    async fn reports(&self, feed: F) -> BackendResult<Vec<Report>> {
        let n = self.calls.reports.fetch_add(1, Ordering::SeqCst) + 1;
        if self.read(|s| s.reports_fail) {
            return Err(BackendError::Timeout);
        }
        Ok(vec![Report::new(ReportKind::Summary, format!("{feed} batch {n}"))])
    }

    async fn analyze(&self, feed: F) -> BackendResult<AnalysisOutcome> {
        self.calls.analyses.fetch_add(1, Ordering::SeqCst);
        sleep(self.read(|s| s.command_delay)).await;
        if self.read(|s| s.commands_fail) {
            return Err(BackendError::rejected("model unavailable"));
        }
        Ok(AnalysisOutcome {
            report: Some(format!("{feed}: two people near the entrance")),
        })
    }

    async fn anomaly_check(&self, _feed: F) -> BackendResult<AnomalyOutcome> {
        self.calls.anomaly_checks.fetch_add(1, Ordering::SeqCst);
        sleep(self.read(|s| s.command_delay)).await;
        if self.read(|s| s.commands_fail) {
            return Err(BackendError::rejected("model unavailable"));
        }
        Ok(self.read(|s| s.anomaly.clone()))
    }

    async fn set_report_interval(&self, _seconds: u64) -> BackendResult<()> {
        self.calls.intervals.fetch_add(1, Ordering::SeqCst);
        if self.read(|s| s.interval_fails) {
            return Err(BackendError::Timeout);
        }
        Ok(())
    }
}

#[async_trait]
impl ChatBackend for FakeBackend {
    async fn send_message(&self, message: &str, context_source: &str) -> BackendResult<ChatReply> {
        self.calls.chats.fetch_add(1, Ordering::SeqCst);
        let (delay, reply_context) = {
            let mut script = self.script.lock().unwrap();
            script.chat_context.push(context_source.to_string());
            (script.chat_delay, script.reply_context.clone())
        };
        sleep(delay).await;
        Ok(ChatReply {
            response: format!("echo: {message}"),
            context_source: Some(reply_context.unwrap_or_else(|| context_source.to_string())),
        })
    }

    async fn context_probe(&self) -> BackendResult<ContextProbe> {
        Ok(ContextProbe {
            current_context_source: Some("live".to_string()),
            has_live_context: true,
            has_uploaded_context: false,
        })
    }

    async fn history(&self) -> BackendResult<Vec<ChatEntry>> {
        Ok(vec![
            ChatEntry {
                role: ChatRole::User,
                content: "anyone at the gate?".to_string(),
                timestamp: Utc::now(),
            },
            ChatEntry {
                role: ChatRole::Assistant,
                content: "one delivery van".to_string(),
                timestamp: Utc::now(),
            },
        ])
    }

    async fn clear_history(&self) -> BackendResult<()> {
        self.calls.clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
