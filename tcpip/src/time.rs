// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Clock and timer plumbing.
//!
//! The stack is sans-io about time: it reads a [`Clock`] and parks future
//! work in a [`TimerQueue`]. An embedder drives the queue by calling
//! [`TimerQueue::poll`] whenever [`TimerQueue::poll_at`] comes due; tests
//! drive it with a [`ManualClock`]. Callbacks always run from `poll`, never
//! from `schedule_at`, so no stack lock is held when a callback re-enters
//! the stack.

pub use smoltcp::time::Duration;
pub use smoltcp::time::Instant;

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Source of the stack's notion of "now".
pub trait Clock: Send + Sync {
    /// The current instant. Must be monotonic.
    fn now(&self) -> Instant;
}

/// A [`Clock`] backed by the OS monotonic clock.
#[derive(Debug)]
pub struct StdClock {
    epoch: std::time::Instant,
}

impl StdClock {
    /// Creates a clock whose zero is now.
    pub fn new() -> Self {
        Self {
            epoch: std::time::Instant::now(),
        }
    }
}

impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for StdClock {
    fn now(&self) -> Instant {
        Instant::from_micros(self.epoch.elapsed().as_micros() as i64)
    }
}

/// A [`Clock`] advanced explicitly. Used by tests to step timer-driven state
/// machines deterministically.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    /// Creates a clock stopped at `start`.
    pub fn new(start: Instant) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Moves the clock forward by `d` and returns the new now.
    pub fn advance(&self, d: Duration) -> Instant {
        let mut now = self.now.lock();
        *now += d;
        *now
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Instant::from_millis(0))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

type TimerFn = Box<dyn FnOnce() + Send>;

struct ScheduledTimer {
    cancelled: Arc<AtomicBool>,
    f: TimerFn,
}

#[derive(Default)]
struct Inner {
    // Keyed by (deadline, sequence) so same-instant timers fire in schedule
    // order.
    timers: BTreeMap<(Instant, u64), ScheduledTimer>,
    next_seq: u64,
}

/// An ordered queue of one-shot timers.
#[derive(Default)]
pub struct TimerQueue {
    inner: Mutex<Inner>,
}

impl TimerQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `f` to run at `at`. Dropping the returned handle cancels
    /// the timer, so the handle must be stored for as long as the timer
    /// should stay armed.
    #[must_use]
    pub fn schedule_at(&self, at: Instant, f: impl FnOnce() + Send + 'static) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.timers.insert(
            (at, seq),
            ScheduledTimer {
                cancelled: cancelled.clone(),
                f: Box::new(f),
            },
        );
        TimerHandle { cancelled }
    }

    /// The earliest pending deadline, if any timer is armed.
    pub fn poll_at(&self) -> Option<Instant> {
        let inner = self.inner.lock();
        inner
            .timers
            .iter()
            .find(|(_, t)| !t.cancelled.load(Ordering::Relaxed))
            .map(|((at, _), _)| *at)
    }

    /// Fires every timer due at or before `now`, returning how many ran.
    ///
    /// Callbacks run with the queue unlocked and may schedule further
    /// timers; newly scheduled timers already due are fired in the same
    /// call.
    pub fn poll(&self, now: Instant) -> usize {
        let mut fired = 0;
        loop {
            let timer = {
                let mut inner = self.inner.lock();
                match inner.timers.first_key_value() {
                    Some(((at, _), _)) if *at <= now => inner.timers.pop_first().map(|(_, t)| t),
                    _ => None,
                }
            };
            let Some(timer) = timer else { break };
            if !timer.cancelled.load(Ordering::Acquire) {
                (timer.f)();
                fired += 1;
            }
        }
        fired
    }
}

/// Handle to a scheduled timer. Dropping it cancels the timer if it has not
/// fired yet.
#[derive(Debug)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Cancels the timer without waiting for the handle to drop.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}
