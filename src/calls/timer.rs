//! One-shot, cancellable timers.
//!
//! Callbacks never run inline: each timer is a spawned task that sleeps and
//! then invokes its callback unless it was cancelled first. Callers that need
//! the firing serialized with other work post a message from the callback
//! instead of touching shared state directly.

use log::{debug, trace};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

/// The named timeouts used during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Answer,
    ReceiveAnswer,
    Connection,
    Modify,
}

impl TimerKind {
    pub const ALL: [TimerKind; 4] = [
        TimerKind::Answer,
        TimerKind::ReceiveAnswer,
        TimerKind::Connection,
        TimerKind::Modify,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            TimerKind::Answer => "answer own call",
            TimerKind::ReceiveAnswer => "receive answer",
            TimerKind::Connection => "connection",
            TimerKind::Modify => "modify",
        }
    }

    /// Reason recorded when this timer expires.
    pub fn expiry_reason(self) -> String {
        format!("{} timer", self.name())
    }
}

/// Handle to a scheduled timer.
///
/// Dropping the handle does not cancel the timer.
#[derive(Debug)]
pub struct TimerHandle {
    name: String,
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancel the timer. Safe to call repeatedly and after the timer fired.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            trace!(target: "Call/Timer", "clearing {} timer", self.name);
        }
        self.task.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Schedules timers on the current tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimerService;

impl TimerService {
    pub fn new() -> Self {
        Self
    }

    /// Run `callback` once after `duration` unless cancelled first.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(
        &self,
        name: impl Into<String>,
        duration: Duration,
        callback: F,
    ) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let task_name = name.clone();

        trace!(target: "Call/Timer", "setting {name} timer for {duration:?}");
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if flag.swap(true, Ordering::SeqCst) {
                return;
            }
            debug!(target: "Call/Timer", "{task_name} timer expired");
            callback();
        });

        TimerHandle {
            name,
            cancelled,
            task,
        }
    }
}
