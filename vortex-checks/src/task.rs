//! Cooperative task scheduling interface.
//!
//! A [`CheckTask`] is identified purely by its expire tick. The health-check
//! core never touches the reactor or a raw timer directly — it only queues
//! (creates), reschedules (`set_expire`), and wakes tasks. Waiting for the
//! next firing is implemented on top of `tokio::time`, but that is an
//! implementation detail callers do not need to know about.

use std::sync::Mutex;

use tokio::sync::Notify;

use crate::clock::{Clock, Tick};

/// A cooperative, expire-time-driven task.
///
/// Cloning a [`std::sync::Arc<CheckTask>`] and handing it to connection
/// callbacks is how `on_wake` et al. reschedule a check ahead of its natural
/// expiry (e.g. once a socket becomes readable).
#[derive(Debug)]
pub struct CheckTask {
    expire: Mutex<Tick>,
    notify: Notify,
}

impl CheckTask {
    /// Create a new task, initially expiring immediately (so the first
    /// [`CheckTask::wait`] returns right away and the driver can decide what
    /// to do, per the boot/fanout stagger which sets an explicit first
    /// expiry before the task is ever waited on).
    pub fn new() -> Self {
        Self {
            expire: Mutex::new(Tick::ZERO),
            notify: Notify::new(),
        }
    }

    /// The tick at which this task should next fire.
    pub fn expire(&self) -> Tick {
        *self.expire.lock().expect("task expire lock poisoned")
    }

    /// Reschedule the task to fire at `tick`.
    pub fn set_expire(&self, tick: Tick) {
        *self.expire.lock().expect("task expire lock poisoned") = tick;
    }

    /// Whether the task is due, relative to `now`.
    pub fn is_expired(&self, now: Tick) -> bool {
        self.expire().is_expired(now)
    }

    /// Wake the task immediately, without changing its expiry. Used by
    /// connection callbacks (`on_readable`/`on_writable`/`on_wake`) to pull a
    /// suspended driver loop back in before its timer would otherwise fire.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Suspend until the task is either woken or its expiry tick elapses.
    ///
    /// Returns the tick observed at wake time; the caller re-derives
    /// `expired` from it rather than trusting the wake reason, matching the
    /// spec's "compute `expired := task.expire <= now_ms`" entry point.
    pub async fn wait(&self) -> Tick {
        loop {
            let expire = self.expire();
            match Clock::to_instant(expire) {
                Some(instant) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(instant.into()) => return Clock::now(),
                        _ = self.notify.notified() => return Clock::now(),
                    }
                }
                None => {
                    // Eternity: only an explicit wake can resume us.
                    self.notify.notified().await;
                    return Clock::now();
                }
            }
        }
    }
}

impl Default for CheckTask {
    fn default() -> Self {
        Self::new()
    }
}
