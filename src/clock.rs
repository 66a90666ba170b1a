//! Clock & timer substrate (C1).
//!
//! Every other component that needs "do X every N ms" or "stamp this
//! sample with the current time" goes through here, so tests can swap in
//! a [`FakeClock`] and `tokio::time::pause`/`advance` instead of sleeping
//! in real time.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};

/// Produces realtime timestamps, in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    /// Current realtime clock reading, in milliseconds.
    fn now_ms(&self) -> u64;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
            .try_into()
            .unwrap_or(u64::MAX)
    }
}

/// A clock whose reading is set explicitly, for deterministic tests.
#[derive(Debug, Clone, Default)]
pub struct FakeClock(Arc<AtomicU64>);

impl FakeClock {
    /// Creates a fake clock starting at `start_ms`.
    #[must_use]
    pub fn new(start_ms: u64) -> Self {
        Self(Arc::new(AtomicU64::new(start_ms)))
    }

    /// Advances the clock by `delta`.
    pub fn advance(&self, delta: Duration) {
        self.0.fetch_add(u64::try_from(delta.as_millis()).unwrap_or(u64::MAX), Ordering::Relaxed);
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A cancellable, re-armable periodic timer that delivers a cloneable tag
/// on every tick.
///
/// `set_period(None)` disables the timer; `set_period(Some(period))` (re)arms
/// it, replacing any previously spawned ticking task. This mirrors
/// `stream_set_report_ms`/`stream_set_poll_ms`'s "`0` disables, any other
/// value (re)arms" contract directly.
#[derive(Debug)]
pub struct Periodic<T> {
    tag: T,
    tx: mpsc::Sender<T>,
    task: Option<JoinHandle<()>>,
}

impl<T: Clone + Send + 'static> Periodic<T> {
    /// Creates a disarmed timer that will send `tag` on `tx` once armed.
    pub fn new(tag: T, tx: mpsc::Sender<T>) -> Self {
        Self { tag, tx, task: None }
    }

    /// Whether the timer currently has a period set.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.task.is_some()
    }

    /// (Re)arms or disarms the timer.
    pub fn set_period(&mut self, period: Option<Duration>) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let Some(period) = period.filter(|period| !period.is_zero()) else {
            return;
        };
        let tag = self.tag.clone();
        let tx = self.tx.clone();
        self.task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; consume it so the first
            // real tick happens one period after arming, matching a
            // freshly-started periodic timer rather than an already-due one.
            interval.tick().await;
            loop {
                interval.tick().await;
                if tx.send(tag.clone()).await.is_err() {
                    break;
                }
            }
        }));
    }
}

impl<T> Drop for Periodic<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
