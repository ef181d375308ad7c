use crate::pool::{ActionStatus, CURRENT_ACTION, PoolShared, WorkShared};
use crate::utils::ScopeGuard;
use crate::utils::thread::spawn_named;
use crossbeam_deque::{Injector, Steal};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, Thread};

/// A parked worker and the flag it spins on between spurious wakeups.
#[derive(Debug)]
pub(super) struct Parked {
    thread: Thread,
    should_unpark: Arc<AtomicBool>,
}

impl PoolShared {
    /// Reserves a thread slot below `limit` and spawns a worker into it.
    pub(super) fn spawn_worker(self: &Arc<Self>, limit: usize) -> bool {
        let reserved = self
            .num_threads
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok();

        if !reserved || self.shutdown.load(Ordering::Acquire) {
            if reserved {
                self.num_threads.fetch_sub(1, Ordering::AcqRel);
            }
            return false;
        }

        let shared = Arc::clone(self);
        let res = spawn_named(
            self.cfg.thread_name.next_name(),
            self.cfg.thread_stack_size,
            move || run_worker(shared),
        );

        match res {
            Ok(handle) => {
                tracing::debug!(
                    thread = ?handle.thread().name(),
                    num_threads = self.num_threads.load(Ordering::Relaxed),
                    "pool worker started"
                );
                self.handles.lock().insert(handle.thread().id(), handle);
                true
            }
            Err(e) => {
                self.num_threads.fetch_sub(1, Ordering::AcqRel);
                tracing::error!(error = %e, "failed to spawn pool worker");
                false
            }
        }
    }

    /// Parks the current thread until `unpark_one_thread` or shutdown picks
    /// it. Returns immediately if there is queued work.
    fn park_current_thread(&self, should_unpark: &Arc<AtomicBool>) {
        {
            let mut parked = self.parked.lock();

            // Checked *while holding the lock*, an injector push followed by
            // `unpark_one_thread` cannot slip in between.
            if !self.injector.is_empty() || self.shutdown.load(Ordering::Acquire) {
                return;
            }

            should_unpark.store(false, Ordering::Release);
            parked.push_back(Parked {
                thread: thread::current(),
                should_unpark: Arc::clone(should_unpark),
            });
        }

        while !should_unpark.load(Ordering::Acquire) {
            thread::park();
        }
    }

    /// Wakes the most recently parked thread, its cache is the hottest.
    pub(super) fn unpark_one_thread(&self) -> bool {
        if let Some(parked) = self.parked.lock().pop_back() {
            parked.should_unpark.store(true, Ordering::Release);
            parked.thread.unpark();
            true
        } else {
            false
        }
    }

    pub(super) fn unpark_all_threads(&self) -> usize {
        let mut parked = self.parked.lock();
        let mut num_unparked = 0;

        while let Some(p) = parked.pop_back() {
            p.should_unpark.store(true, Ordering::Release);
            p.thread.unpark();
            num_unparked += 1;
        }

        num_unparked
    }

    pub(super) fn num_parked(&self) -> usize {
        self.parked.lock().len()
    }
}

fn steal(injector: &Injector<Arc<WorkShared>>) -> Option<Arc<WorkShared>> {
    loop {
        match injector.steal() {
            Steal::Success(work) => return Some(work),
            Steal::Empty => return None,
            Steal::Retry => continue,
        }
    }
}

fn run_worker(shared: Arc<PoolShared>) {
    let should_unpark = Arc::new(AtomicBool::new(false));
    let _exit = ScopeGuard::new(|| {
        shared.num_threads.fetch_sub(1, Ordering::AcqRel);
    });

    while !shared.shutdown.load(Ordering::Acquire) {
        match steal(&shared.injector) {
            Some(work) => run_work(&shared, work),
            None => shared.park_current_thread(&should_unpark),
        }
    }
}

fn run_work(shared: &Arc<PoolShared>, work: Arc<WorkShared>) {
    if !work.begin() {
        return;
    }

    let status = Rc::new(ActionStatus {
        work,
        pool: Arc::clone(shared),
        completed: std::cell::Cell::new(false),
    });

    let prev = CURRENT_ACTION.with(|c| c.replace(Some(Rc::clone(&status))));
    let _guard = ScopeGuard::new(|| {
        CURRENT_ACTION.with(|c| *c.borrow_mut() = prev);
        status.complete();
    });

    (status.work.callback)(&status);
}
