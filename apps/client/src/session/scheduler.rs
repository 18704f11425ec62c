//! Keyed timers that feed a session's task channel.
//!
//! Every timer is a tokio task that sleeps and then posts a [`SessionTask`].
//! Scheduling under a key that is already armed replaces the old timer.
//! Dropping the scheduler aborts everything still armed.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use veilchat_shared::api::message::HistoryRecord;
use veilchat_shared::ids::UserId;

/// Work delivered back to the session from timers and background fetches.
#[derive(Debug)]
pub enum SessionTask {
    PeriodicSync,
    ReconnectSync,
    RetryPartnerKey { attempt: u32 },
    PendingTimeout { ts: i64 },
    TypingExpired,
    HealthProbe,
    SyncFetched {
        peer: UserId,
        result: Result<Vec<HistoryRecord>, String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKey {
    PeriodicSync,
    ReconnectSync,
    PartnerKeyRetry,
    PendingTimeout(i64),
    TypingExpiry,
    HealthProbe,
}

pub struct Scheduler {
    tx: mpsc::UnboundedSender<SessionTask>,
    timers: HashMap<TaskKey, JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                timers: HashMap::new(),
            },
            rx,
        )
    }

    /// Channel for one-off background work to report back on.
    pub fn sender(&self) -> mpsc::UnboundedSender<SessionTask> {
        self.tx.clone()
    }

    /// Post `task` once after `delay`.
    pub fn schedule(&mut self, key: TaskKey, delay: Duration, task: SessionTask) {
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(task);
        });
        self.arm(key, handle);
    }

    /// Post a task built by `make` every `period`, first after one period.
    pub fn schedule_every(&mut self, key: TaskKey, period: Duration, make: fn() -> SessionTask) {
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if tx.send(make()).is_err() {
                    break;
                }
            }
        });
        self.arm(key, handle);
    }

    pub fn cancel(&mut self, key: TaskKey) {
        if let Some(handle) = self.timers.remove(&key) {
            handle.abort();
        }
    }

    pub fn is_scheduled(&self, key: TaskKey) -> bool {
        self.timers.get(&key).is_some_and(|h| !h.is_finished())
    }

    pub fn cancel_all(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }

    fn arm(&mut self, key: TaskKey, handle: JoinHandle<()>) {
        if let Some(previous) = self.timers.insert(key, handle) {
            previous.abort();
        }
        self.timers.retain(|_, h| !h.is_finished());
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
