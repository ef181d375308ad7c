use crate::SPILL_TO_HEAP_THRESHOLD;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// How a signaled [`Event`] goes back to unsignaled.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum ResetMode {
    /// Stays signaled until [`Event::reset`].
    #[default]
    Manual,

    /// Releases a single waiter, or is consumed by the subscribers notified
    /// by the `set` call.
    Auto,
}

type Subscriber = Arc<dyn Fn() + Send + Sync + 'static>;

struct EventInner {
    mode: ResetMode,
    signaled: Mutex<bool>,
    cond: Condvar,
    subscribers: Mutex<Vec<(u64, Subscriber)>>,
    next_id: AtomicU64,
}

/// A waitable event. Queues can register callbacks that get queued on one of
/// their ports every time the event is set.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("mode", &self.inner.mode)
            .field("signaled", &self.is_set())
            .finish()
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new(ResetMode::default())
    }
}

impl Event {
    pub fn new(mode: ResetMode) -> Self {
        Self {
            inner: Arc::new(EventInner {
                mode,
                signaled: Mutex::new(false),
                cond: Condvar::new(),
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Signals the event. Every subscriber is notified once per call.
    pub fn set(&self) {
        let subscribers = self
            .inner
            .subscribers
            .lock()
            .iter()
            .map(|(_, s)| Arc::clone(s))
            .collect::<SmallVec<[Subscriber; SPILL_TO_HEAP_THRESHOLD]>>();

        {
            let mut signaled = self.inner.signaled.lock();
            match self.inner.mode {
                ResetMode::Manual => {
                    *signaled = true;
                    self.inner.cond.notify_all();
                }
                ResetMode::Auto if subscribers.is_empty() => {
                    *signaled = true;
                    self.inner.cond.notify_one();
                }
                // Consumed by the subscribers below.
                ResetMode::Auto => {}
            }
        }

        for subscriber in subscribers {
            subscriber();
        }
    }

    pub fn reset(&self) {
        *self.inner.signaled.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.inner.signaled.lock()
    }

    /// Blocks until the event is signaled or `timeout` elapses.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut signaled = self.inner.signaled.lock();

        while !*signaled {
            match deadline {
                None => self.inner.cond.wait(&mut signaled),
                Some(deadline) => {
                    if self
                        .inner
                        .cond
                        .wait_until(&mut signaled, deadline)
                        .timed_out()
                    {
                        break;
                    }
                }
            }
        }

        let was_signaled = *signaled;
        if was_signaled && self.inner.mode == ResetMode::Auto {
            *signaled = false;
        }
        was_signaled
    }

    /// Adds a subscriber. An already signaled event notifies it right away,
    /// consuming the signal in auto reset mode.
    pub(crate) fn subscribe<F>(&self, subscriber: F) -> u64
    where
        F: Fn() + Send + Sync + 'static,
    {
        let subscriber: Subscriber = Arc::new(subscriber);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .push((id, Arc::clone(&subscriber)));

        let pending = {
            let mut signaled = self.inner.signaled.lock();
            let pending = *signaled;
            if pending && self.inner.mode == ResetMode::Auto {
                *signaled = false;
            }
            pending
        };

        if pending {
            subscriber();
        }
        id
    }

    pub(crate) fn unsubscribe(&self, id: u64) -> bool {
        let mut subscribers = self.inner.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    assert_impl_all!(Event: Send, Sync, Clone);

    #[test]
    fn test_manual_reset_stays_set() {
        let event = Event::new(ResetMode::Manual);
        assert!(!event.wait(Some(Duration::from_millis(5))));

        event.set();
        assert!(event.wait(Some(Duration::ZERO)));
        assert!(event.wait(None));

        event.reset();
        assert!(!event.is_set());
    }

    #[test]
    fn test_auto_reset_releases_one_waiter() {
        let event = Event::new(ResetMode::Auto);
        event.set();

        assert!(event.wait(Some(Duration::ZERO)));
        assert!(!event.wait(Some(Duration::from_millis(5))));
    }

    #[test]
    fn test_wait_wakes_on_set() {
        let event = Event::new(ResetMode::Manual);

        let waiter = {
            let event = event.clone();
            thread::spawn(move || event.wait(Some(Duration::from_secs(5))))
        };

        thread::sleep(Duration::from_millis(10));
        event.set();
        assert!(matches!(waiter.join(), Ok(true)));
    }

    #[test]
    fn test_subscribers_notified_per_set() {
        let event = Event::new(ResetMode::Auto);
        let hits = Arc::new(AtomicUsize::new(0));

        let id = {
            let hits = Arc::clone(&hits);
            event.subscribe(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };

        event.set();
        event.set();
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        // Subscribers consumed both signals.
        assert!(!event.is_set());

        assert!(event.unsubscribe(id));
        assert!(!event.unsubscribe(id));
        event.set();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_subscribe_to_signaled_event() {
        let event = Event::new(ResetMode::Manual);
        event.set();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        event.subscribe(move || {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(event.is_set());
    }
}
