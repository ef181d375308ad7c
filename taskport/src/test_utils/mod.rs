use crate::pool::{Builder as PoolBuilder, ThreadPool};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Polls `pred` every millisecond until it holds or `timeout` elapses.
pub(crate) fn wait_until<P: FnMut() -> bool>(timeout: Duration, mut pred: P) -> bool {
    let deadline = Instant::now() + timeout;

    loop {
        if pred() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

/// A small private pool so tests do not share threads with each other.
#[track_caller]
pub(crate) fn test_pool(worker_threads: usize) -> ThreadPool {
    match PoolBuilder::new()
        .worker_threads(worker_threads)
        .thread_name_fn(|| "taskport-test".to_string())
        .try_build()
    {
        Ok(pool) => pool,
        Err(e) => panic!("failed to build test pool: {:?}", e),
    }
}

/// Records values pushed from any thread, in arrival order.
#[derive(Debug)]
pub(crate) struct Recorder<T> {
    inner: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> Recorder<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn push(&self, value: T) {
        self.inner.lock().push(value);
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub(crate) fn snapshot(&self) -> Vec<T> {
        self.inner.lock().clone()
    }
}

/// Tracks how many callbacks overlap.
#[derive(Debug, Default)]
pub(crate) struct ConcurrencyGauge {
    current: AtomicUsize,
    max: AtomicUsize,
    total: AtomicUsize,
}

impl ConcurrencyGauge {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Marks a callback running for `busy`.
    pub(crate) fn run_for(&self, busy: Duration) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);

        thread::sleep(busy);

        self.current.fetch_sub(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    pub(crate) fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}
