//! Thread-pool executor used by the `ThreadPool` and `SerializedThreadPool`
//! dispatch modes.
//!
//! A port registers a single callback with the pool and gets back a
//! [`PoolWork`]. Every [`ThreadPoolExecutor::submit`] queues one invocation of
//! that callback on some pool thread.

use crossbeam_deque::Injector;
use parking_lot::{Condvar, Mutex};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};

mod builder;
pub use builder::Builder;
pub(crate) use builder::PoolConfig;

mod worker;
use worker::Parked;

/// The execution side of a port in a thread pool dispatch mode.
pub trait ThreadPoolExecutor: Send + Sync {
    /// Queues one invocation of the registered callback.
    fn submit(&self);

    /// Stops future invocations and blocks until the in-flight ones have
    /// returned or called [`ActionStatus::complete`]. An invocation that calls
    /// `terminate` on its own work is not waited for.
    fn terminate(&self);
}

pub(crate) type PoolCallback = Box<dyn Fn(&ActionStatus) + Send + Sync + 'static>;

thread_local! {
    static CURRENT_ACTION: RefCell<Option<Rc<ActionStatus>>> = const { RefCell::new(None) };
}

#[derive(Debug, Default)]
struct WorkState {
    in_flight: usize,
    closed: bool,
}

pub(crate) struct WorkShared {
    id: u64,
    callback: PoolCallback,
    state: Mutex<WorkState>,
    drained: Condvar,
}

impl WorkShared {
    fn next_id() -> u64 {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        NEXT_ID.fetch_add(1, Ordering::Relaxed)
    }

    /// Accounts for an invocation about to start. False once closed.
    fn begin(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.in_flight += 1;
        true
    }

    fn finish(&self) {
        self.state.lock().in_flight -= 1;

        // A terminate from inside a callback waits for one, not zero.
        self.drained.notify_all();
    }
}

/// Handed to every invocation of a registered callback.
pub struct ActionStatus {
    work: Arc<WorkShared>,
    pool: Arc<PoolShared>,
    completed: Cell<bool>,
}

impl fmt::Debug for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionStatus")
            .field("work", &self.work.id)
            .field("completed", &self.completed.get())
            .finish()
    }
}

impl ActionStatus {
    /// Marks this invocation finished as far as [`ThreadPoolExecutor::terminate`]
    /// is concerned. Code running after this must not touch anything the
    /// terminating side is about to release.
    pub fn complete(&self) {
        if !self.completed.replace(true) {
            self.work.finish();
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed.get()
    }

    /// Hints that this invocation may block for a long time. The pool starts
    /// an extra thread if none is idle, up to its `max_threads`.
    pub fn may_run_long(&self) {
        if self.pool.num_parked() == 0 && self.pool.spawn_worker(self.pool.cfg.max_threads) {
            tracing::debug!(work = self.work.id, "pool grown for long running callback");
        }
    }
}

/// Calls [`ActionStatus::complete`] on the invocation running on this thread.
/// Returns false when not called from a pool callback.
pub fn complete_current() -> bool {
    CURRENT_ACTION.with(|c| match c.borrow().as_ref() {
        Some(status) => {
            status.complete();
            true
        }
        None => false,
    })
}

/// Calls [`ActionStatus::may_run_long`] on the invocation running on this
/// thread. Returns false when not called from a pool callback.
pub fn may_run_long() -> bool {
    CURRENT_ACTION.with(|c| match c.borrow().as_ref() {
        Some(status) => {
            status.may_run_long();
            true
        }
        None => false,
    })
}

pub(crate) struct PoolShared {
    cfg: PoolConfig,

    injector: Injector<Arc<WorkShared>>,

    /// LIFO collection of parked threads.
    parked: Mutex<VecDeque<Parked>>,

    handles: Mutex<HashMap<ThreadId, JoinHandle<()>>>,

    num_threads: AtomicUsize,

    shutdown: AtomicBool,
}

/// A shared pool of worker threads. Cloning yields another handle to the same
/// pool.
#[derive(Clone)]
pub struct ThreadPool {
    shared: Arc<PoolShared>,
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("cfg", &self.shared.cfg)
            .field("num_threads", &self.num_threads())
            .field("shutdown", &self.shared.shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

impl ThreadPool {
    pub(crate) fn new(cfg: PoolConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                parked: Mutex::new(VecDeque::with_capacity(cfg.worker_threads)),
                handles: Mutex::new(HashMap::with_capacity(cfg.worker_threads)),
                injector: Injector::new(),
                num_threads: AtomicUsize::new(0),
                shutdown: AtomicBool::new(false),
                cfg,
            }),
        }
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    /// The process-wide pool used by queues that are not given one.
    pub fn global() -> ThreadPool {
        static GLOBAL: OnceLock<ThreadPool> = OnceLock::new();
        GLOBAL
            .get_or_init(|| ThreadPool::new(PoolConfig::default()))
            .clone()
    }

    /// Registers `callback`. This is the executor's `Initialize`.
    pub fn register<F>(&self, callback: F) -> PoolWork
    where
        F: Fn(&ActionStatus) + Send + Sync + 'static,
    {
        PoolWork {
            work: Arc::new(WorkShared {
                id: WorkShared::next_id(),
                callback: Box::new(callback),
                state: Mutex::new(WorkState::default()),
                drained: Condvar::new(),
            }),
            pool: self.clone(),
        }
    }

    pub fn num_threads(&self) -> usize {
        self.shared.num_threads.load(Ordering::Acquire)
    }

    fn inject(&self, work: Arc<WorkShared>) {
        self.shared.injector.push(work);

        if !self.shared.unpark_one_thread() {
            self.shared.spawn_worker(self.shared.cfg.worker_threads);
        }
    }

    /// Stops every worker thread and joins them. Queued invocations that have
    /// not started are dropped.
    pub fn shutdown(&self) -> anyhow::Result<()> {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.unpark_all_threads();

        let handles = self.shared.handles.lock().drain().collect::<Vec<_>>();
        let current = thread::current().id();

        let panicked = handles
            .into_iter()
            .filter(|(id, _)| *id != current)
            .filter_map(|(id, handle)| handle.join().err().map(|_| id))
            .count();

        if panicked == 0 {
            Ok(())
        } else {
            Err(anyhow::anyhow!("{} thread(s) panicked", panicked))
        }
    }
}

/// A callback registered with a [`ThreadPool`].
pub struct PoolWork {
    work: Arc<WorkShared>,
    pool: ThreadPool,
}

impl fmt::Debug for PoolWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolWork").field("id", &self.work.id).finish()
    }
}

impl PoolWork {
    fn is_current(&self) -> bool {
        CURRENT_ACTION.with(|c| {
            c.borrow()
                .as_ref()
                .is_some_and(|s| s.work.id == self.work.id && !s.is_complete())
        })
    }
}

impl ThreadPoolExecutor for PoolWork {
    fn submit(&self) {
        if self.work.state.lock().closed {
            return;
        }
        self.pool.inject(Arc::clone(&self.work));
    }

    fn terminate(&self) {
        let own = usize::from(self.is_current());
        let mut state = self.work.state.lock();
        state.closed = true;

        while state.in_flight > own {
            self.work.drained.wait(&mut state);
        }
    }
}

impl Drop for PoolWork {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests;
