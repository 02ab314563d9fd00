//! Timeout Scheduling
//!
//! One-shot wall-clock timers. A callback is handed the handle it was
//! scheduled under, which lets the receiver tell a live timer from one
//! that was superseded before it fired. Physical cancellation is never
//! required; detecting staleness by handle identity is enough.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Identity token for one scheduled timeout. Compared, never dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(Uuid);

impl TimerHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TimerHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Callback invoked when a timer fires, given the handle it was scheduled under
pub type TimerCallback = Box<dyn FnOnce(TimerHandle) -> BoxFuture<'static, ()> + Send>;

pub trait TimerService: Send + Sync {
    /// Schedules `callback` to run once at `deadline`. Deadlines already in
    /// the past fire immediately.
    fn schedule(&self, deadline: DateTime<Utc>, callback: TimerCallback) -> TimerHandle;
}

/// Timer service that spawns one sleeping task per scheduled timeout
#[derive(Default)]
pub struct TokioTimerService {
    tasks: Mutex<Vec<(TimerHandle, JoinHandle<()>)>>,
}

impl TokioTimerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timers scheduled but not yet fired
    pub fn pending(&self) -> usize {
        let mut tasks = self.tasks.lock();
        tasks.retain(|(_, task)| !task.is_finished());
        tasks.len()
    }

    /// Aborts every timer that has not fired yet.
    pub fn shutdown(&self) {
        for (_, task) in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl TimerService for TokioTimerService {
    fn schedule(&self, deadline: DateTime<Utc>, callback: TimerCallback) -> TimerHandle {
        let handle = TimerHandle::new();
        let delay = (deadline - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback(handle).await;
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|(_, task)| !task.is_finished());
        tasks.push((handle, task));
        handle
    }
}
