//! One-shot, rearmable wait timers and the tick clock they run on.
//!
//! Due times are absolute `u64` ticks of 100ns measured from a process-wide
//! monotonic epoch. Ticks compare directly, so the port code can keep the
//! armed due time in a single atomic and race on it with CAS loops.

use crate::utils::thread::spawn_named;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Number of ticks in one millisecond.
pub const TICKS_PER_MS: u64 = 10_000;

/// Sentinel for "no due time armed".
pub const NO_DUE: u64 = u64::MAX;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Current time in ticks.
pub fn now() -> u64 {
    (epoch().elapsed().as_nanos() / 100) as u64
}

/// Absolute due time `ms_from_now` milliseconds in the future.
pub fn absolute_time(ms_from_now: u32) -> u64 {
    now() + ms_from_now as u64 * TICKS_PER_MS
}

pub(crate) fn to_instant(ticks: u64) -> Option<Instant> {
    let nanos = ticks.checked_mul(100)?;
    epoch().checked_add(Duration::from_nanos(nanos))
}

/// A single rearmable one-shot timer.
///
/// Starting an armed timer replaces its due time. A due time already in the
/// past fires as soon as possible.
pub trait WaitTimer: Send + Sync {
    fn start(&self, due: u64);

    fn cancel(&self);

    fn absolute_time(&self, ms_from_now: u32) -> u64 {
        absolute_time(ms_from_now)
    }

    /// Stops the timer for good. Later `start` calls are ignored. Once this
    /// returns the callback is not running, unless `terminate` was called from
    /// the callback itself.
    fn terminate(&self);
}

struct TimerState {
    due: Option<u64>,
    terminated: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    cond: Condvar,
    callback: Box<dyn Fn() + Send + Sync>,
}

/// A `WaitTimer` backed by a dedicated thread, spawned on first `start`.
pub struct ThreadTimer {
    shared: Arc<TimerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ThreadTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ThreadTimer")
            .field("due", &state.due)
            .field("terminated", &state.terminated)
            .finish()
    }
}

impl ThreadTimer {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(TimerShared {
                state: Mutex::new(TimerState {
                    due: None,
                    terminated: false,
                }),
                cond: Condvar::new(),
                callback: Box::new(callback),
            }),
            handle: Mutex::new(None),
        }
    }

    fn ensure_thread(&self) {
        static TIMER_COUNT: AtomicUsize = AtomicUsize::new(0);

        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let name = format!(
            "taskport-timer-{}",
            TIMER_COUNT.fetch_add(1, Ordering::Relaxed)
        );

        match spawn_named(name, None, move || run_timer(shared)) {
            Ok(h) => {
                tracing::debug!(thread = ?h.thread().name(), "timer thread started");
                *handle = Some(h);
            }
            Err(e) => {
                // The due time stays armed, the next `start` retries.
                tracing::error!(error = %e, "failed to spawn timer thread");
            }
        }
    }
}

fn run_timer(shared: Arc<TimerShared>) {
    let mut state = shared.state.lock();

    loop {
        if state.terminated {
            break;
        }

        match state.due.map(|due| (due, to_instant(due))) {
            None | Some((_, None)) => shared.cond.wait(&mut state),
            Some((_, Some(deadline))) => {
                if Instant::now() >= deadline {
                    state.due = None;
                    MutexGuard::unlocked(&mut state, || (shared.callback)());
                } else {
                    shared.cond.wait_until(&mut state, deadline);
                }
            }
        }
    }
}

impl WaitTimer for ThreadTimer {
    fn start(&self, due: u64) {
        {
            let mut state = self.shared.state.lock();
            if state.terminated {
                return;
            }
            state.due = Some(due);
        }

        self.shared.cond.notify_one();
        self.ensure_thread();
    }

    fn cancel(&self) {
        self.shared.state.lock().due = None;
        self.shared.cond.notify_one();
    }

    fn terminate(&self) {
        {
            let mut state = self.shared.state.lock();
            state.terminated = true;
            state.due = None;
        }
        self.shared.cond.notify_one();

        // `start` bails on `terminated`, so the callback cannot respawn the
        // thread once the handle is taken.
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            // Joining ourselves would never return.
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::error!("timer thread panicked");
            }
        }
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::wait_until;
    use anyhow::Result;
    use static_assertions::assert_impl_all;
    use std::sync::atomic::AtomicUsize;

    assert_impl_all!(ThreadTimer: Send, Sync, WaitTimer);

    fn counting_timer() -> (ThreadTimer, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let timer = ThreadTimer::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (timer, fired)
    }

    #[test]
    fn test_clock_is_monotonic() {
        let a = now();
        let b = absolute_time(5);
        assert!(b >= a + 5 * TICKS_PER_MS);
        assert!(now() >= a);
        assert!(to_instant(NO_DUE).is_none());
    }

    #[test]
    fn test_timer_fires_once() -> Result<()> {
        let (timer, fired) = counting_timer();

        let start = Instant::now();
        timer.start(timer.absolute_time(20));

        assert!(wait_until(Duration::from_secs(2), || {
            fired.load(Ordering::SeqCst) == 1
        }));
        assert!(start.elapsed() >= Duration::from_millis(19));

        thread::sleep(Duration::from_millis(30));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn test_past_due_fires_immediately() {
        let (timer, fired) = counting_timer();
        timer.start(0);

        assert!(wait_until(Duration::from_millis(500), || {
            fired.load(Ordering::SeqCst) == 1
        }));
    }

    #[test]
    fn test_cancel_and_rearm() {
        let (timer, fired) = counting_timer();

        timer.start(timer.absolute_time(30));
        timer.cancel();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // Rearming with an earlier due replaces the later one.
        timer.start(timer.absolute_time(10_000));
        timer.start(timer.absolute_time(10));
        assert!(wait_until(Duration::from_secs(2), || {
            fired.load(Ordering::SeqCst) == 1
        }));
    }

    #[test]
    fn test_terminate_ignores_later_starts() {
        let (timer, fired) = counting_timer();
        timer.terminate();
        timer.start(0);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_terminate_from_callback() {
        let slot: Arc<Mutex<Option<Arc<ThreadTimer>>>> = Arc::new(Mutex::new(None));
        let done = Arc::new(AtomicUsize::new(0));

        let timer = {
            let slot = Arc::clone(&slot);
            let done = Arc::clone(&done);
            Arc::new(ThreadTimer::new(move || {
                if let Some(timer) = slot.lock().take() {
                    timer.terminate();
                }
                done.fetch_add(1, Ordering::SeqCst);
            }))
        };

        *slot.lock() = Some(Arc::clone(&timer));
        timer.start(0);

        assert!(wait_until(Duration::from_secs(1), || {
            done.load(Ordering::SeqCst) == 1
        }));
    }
}
