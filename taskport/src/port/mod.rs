//! Ports hold queued callbacks and decide when, and on which thread, they
//! run.
//!
//! A port keeps two queues. Ready entries wait in a FIFO for the dispatch
//! mode to run them. Delayed entries wait in a due-time ordered queue behind a
//! single rearmable timer, and get promoted to the ready FIFO one per timer
//! fire. Port contexts bind a queue's role to a port; several contexts may
//! share one port.

use crate::errors::{Result, TaskQueueError};
use crate::event::Event;
use crate::pool::{ThreadPool, ThreadPoolExecutor};
use crate::timer::{self, NO_DUE, ThreadTimer, WaitTimer};
use crate::utils::AtomicVector;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

mod context;
pub use context::{PortContext, PortKind, PortStatus};

mod dispatch;

mod entry;
pub use entry::Callback;
use entry::{DelayedQueue, QueueEntry, ReadyQueue};

mod termination;
pub use termination::{TerminationCallback, TerminationToken};
use termination::TerminationRequest;

/// How `wait_for_unwind` polls for in-flight callbacks.
const UNWIND_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Callback of a wait registration, queued every time its event is set.
pub type WaitCallback = Arc<dyn Fn(bool) + Send + Sync + 'static>;

/// Decides where and when a port's ready callbacks run.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum DispatchMode {
    /// Callbacks wait for an explicit `dispatch` call.
    #[default]
    Manual,

    /// Each queued callback is handed to the thread pool on its own.
    ThreadPool,

    /// The thread pool drains the port, at most one callback at a time.
    SerializedThreadPool,

    /// Callbacks run on the queuing thread before `submit` returns.
    Immediate,
}

/// A weak reference to a port, used to build composite queues that share
/// ports with existing ones.
#[derive(Clone, Debug)]
pub struct PortHandle {
    port: Weak<Port>,
}

impl PortHandle {
    pub(crate) fn new(port: &Arc<Port>) -> Self {
        Self {
            port: Arc::downgrade(port),
        }
    }

    pub(crate) fn upgrade(&self) -> Result<Arc<Port>> {
        self.port.upgrade().ok_or(TaskQueueError::InvalidHandle)
    }

    /// False once every queue using the port is gone.
    pub fn is_alive(&self) -> bool {
        self.port.strong_count() > 0
    }
}

#[derive(Debug, Default)]
struct PortLists {
    ready: ReadyQueue,
    delayed: DelayedQueue,

    /// Termination requests handed out as tokens, not yet started.
    prepared: Vec<TerminationRequest>,

    /// Requests that fire once their context has drained.
    active: Vec<TerminationRequest>,

    /// Requests held back by `suspend_termination`.
    parked: Vec<TerminationRequest>,
}

impl PortLists {
    fn has_entries_for(&self, ctx: &Arc<PortContext>) -> bool {
        self.ready.iter().any(|entry| entry.belongs_to(ctx)) || self.delayed.contains(ctx)
    }
}

#[derive(Debug)]
struct WaitRegistration {
    event: Event,
    subscription: u64,
}

pub(crate) struct Port {
    id: u64,
    mode: DispatchMode,

    lists: Mutex<PortLists>,

    /// Contexts whose queues are told about every queued item.
    attached: AtomicVector<Weak<PortContext>>,

    suspended: AtomicBool,

    /// Threads currently inside a drain. Teardown waits for zero.
    processing: AtomicUsize,
    unwind_lock: Mutex<()>,
    unwind_cond: Condvar,

    /// Coalesced "something changed" flag for `dispatch` waiters.
    signaled: Mutex<bool>,
    signal_cond: Condvar,

    /// Due time the timer is armed for, `NO_DUE` when idle.
    timer_due: AtomicU64,
    timer: Box<dyn WaitTimer>,

    executor: Option<Box<dyn ThreadPoolExecutor>>,

    /// Held while a serialized drain pass runs.
    serial_gate: AtomicBool,

    next_seq: AtomicU64,
    next_token: AtomicU64,
    waits: DashMap<u64, WaitRegistration>,
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("suspended", &self.is_suspended())
            .field("processing", &self.processing.load(Ordering::Relaxed))
            .field("timer_due", &self.timer_due.load(Ordering::Relaxed))
            .field("attached", &self.attached.len())
            .finish()
    }
}

impl Port {
    pub(crate) fn new(mode: DispatchMode, pool: &ThreadPool) -> Arc<Self> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);

        let port = Arc::new_cyclic(|weak: &Weak<Port>| {
            let timer = {
                let weak = weak.clone();
                ThreadTimer::new(move || {
                    if let Some(port) = weak.upgrade() {
                        port.submit_pending_callback();
                    }
                })
            };

            let executor: Option<Box<dyn ThreadPoolExecutor>> = match mode {
                DispatchMode::ThreadPool | DispatchMode::SerializedThreadPool => {
                    let weak = weak.clone();
                    Some(Box::new(pool.register(move |status| {
                        if let Some(port) = weak.upgrade() {
                            port.process_pool_callback(status);
                        }
                    })))
                }
                DispatchMode::Manual | DispatchMode::Immediate => None,
            };

            Port {
                id,
                mode,
                lists: Mutex::new(PortLists::default()),
                attached: AtomicVector::new(),
                suspended: AtomicBool::new(false),
                processing: AtomicUsize::new(0),
                unwind_lock: Mutex::new(()),
                unwind_cond: Condvar::new(),
                signaled: Mutex::new(false),
                signal_cond: Condvar::new(),
                timer_due: AtomicU64::new(NO_DUE),
                timer: Box::new(timer),
                executor,
                serial_gate: AtomicBool::new(false),
                next_seq: AtomicU64::new(1),
                next_token: AtomicU64::new(1),
                waits: DashMap::new(),
            }
        });

        tracing::debug!(port = id, ?mode, "port created");
        port
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn mode(&self) -> DispatchMode {
        self.mode
    }

    fn verify_context(&self, ctx: &Arc<PortContext>) -> Result<()> {
        if std::ptr::eq(Arc::as_ptr(ctx.port()), self) {
            Ok(())
        } else {
            Err(TaskQueueError::InvalidHandle)
        }
    }

    pub(crate) fn queue_item(
        &self,
        ctx: &Arc<PortContext>,
        delay_ms: u32,
        callback: Callback,
    ) -> Result<()> {
        self.verify_context(ctx)?;
        ctx.verify_not_terminated()?;

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        if delay_ms == 0 {
            self.append_entry(QueueEntry {
                ctx: Arc::clone(ctx),
                callback,
                seq,
                due: 0,
            })?;
        } else {
            let due = self.timer.absolute_time(delay_ms);
            let entry = QueueEntry {
                ctx: Arc::clone(ctx),
                callback,
                seq,
                due,
            };

            let rejected = {
                let mut lists = self.lists.lock();
                if ctx.status() == PortStatus::Terminated {
                    Some(entry)
                } else {
                    lists.delayed.insert(entry);
                    None
                }
            };

            if rejected.is_some() {
                return Err(TaskQueueError::Aborted);
            }

            tracing::trace!(port = self.id, seq, delay_ms, "item delayed");
            self.arm_timer(due);
        }

        // Termination may have started while the entry was being queued.
        if ctx.status() != PortStatus::Active {
            self.cancel_pending_entries(ctx, true);
        }

        Ok(())
    }

    /// Moves the timer earlier if `due` beats the armed due time.
    fn arm_timer(&self, due: u64) {
        let mut current = self.timer_due.load(Ordering::Acquire);

        while due < current {
            match self.timer_due.compare_exchange_weak(
                current,
                due,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.restart_timer(due);
                    break;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn append_entry(&self, entry: QueueEntry) -> Result<()> {
        let seq = entry.seq;

        // Dropped outside the lock, the callback may own arbitrary state.
        let rejected = {
            let mut lists = self.lists.lock();
            if entry.ctx.status() == PortStatus::Terminated {
                Some(entry)
            } else {
                lists.ready.push_back(entry);
                None
            }
        };

        if rejected.is_some() {
            return Err(TaskQueueError::Aborted);
        }

        tracing::trace!(port = self.id, seq, "item ready");
        self.signal_queue();
        self.notify_item_queued();
        Ok(())
    }

    fn notify_item_queued(&self) {
        if self.is_suspended() {
            return;
        }

        match self.mode {
            DispatchMode::ThreadPool => self.submit_to_pool(),
            DispatchMode::SerializedThreadPool => {
                // A running drain pass rechecks the list once it lets go of
                // the gate.
                if !self.serial_gate.load(Ordering::Acquire) {
                    self.submit_to_pool();
                }
            }
            DispatchMode::Manual | DispatchMode::Immediate => {}
        }

        if !self.attached.is_empty() {
            self.attached.visit(|ctx| {
                if let Some(ctx) = ctx.upgrade() {
                    ctx.item_queued();
                }
            });
        }

        if self.mode == DispatchMode::Immediate {
            self.drain_one_item();
        }
    }

    fn submit_to_pool(&self) {
        if let Some(executor) = &self.executor {
            executor.submit();
        }
    }

    /// Starts the timer for `due`, then follows `timer_due` until the value
    /// our `start` armed is the one published.
    fn restart_timer(&self, mut due: u64) {
        loop {
            self.timer.start(due);

            let latest = self.timer_due.load(Ordering::Acquire);
            if latest == due || latest == NO_DUE {
                break;
            }
            due = latest;
        }
    }

    /// Timer callback. Promotes the entry the timer was armed for, then
    /// rearms for the next one.
    pub(crate) fn submit_pending_callback(&self) {
        let due = self.timer_due.load(Ordering::Acquire);

        // A stale `start` can leave the timer armed earlier than `timer_due`.
        if due != NO_DUE && timer::now() < due {
            tracing::trace!(port = self.id, due, "timer fired early, rearming");
            self.restart_timer(due);
            return;
        }

        let (promoted, next) = {
            let mut lists = self.lists.lock();
            let promoted = lists.delayed.take_due(due);
            (promoted, lists.delayed.peek_next())
        };

        self.schedule_next_pending(due, next);

        if let Some(entry) = promoted {
            let seq = entry.seq;
            if self.append_entry(entry).is_err() {
                tracing::trace!(port = self.id, seq, "promoted item dropped, context terminated");
            }
        }
    }

    /// Arms the timer for `next`, having observed `due` as the armed value.
    fn schedule_next_pending(&self, due: u64, next: Option<(u64, Arc<PortContext>)>) {
        match next {
            Some((_, ctx)) if ctx.status() != PortStatus::Active => {
                self.cancel_pending_entries(&ctx, true);
            }
            Some((next_due, _)) => {
                let mut current = due;
                loop {
                    match self.timer_due.compare_exchange(
                        current,
                        next_due,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            self.restart_timer(next_due);
                            break;
                        }
                        // Someone armed an earlier (or the same) due time.
                        Err(actual) if actual <= next_due => break,
                        Err(actual) => current = actual,
                    }
                }
            }
            None => {
                if self
                    .timer_due
                    .compare_exchange(due, NO_DUE, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.timer.cancel();
                }
            }
        }
    }

    /// Pulls every delayed entry of `ctx` out of the delayed queue. With
    /// `append` they become ready (and run as canceled), otherwise they are
    /// discarded unrun.
    pub(crate) fn cancel_pending_entries(&self, ctx: &Arc<PortContext>, append: bool) {
        let canceled = self.lists.lock().delayed.drain_for(ctx);
        if canceled.is_empty() {
            return;
        }

        self.timer.cancel();
        self.timer_due.store(NO_DUE, Ordering::Release);

        tracing::trace!(
            port = self.id,
            count = canceled.len(),
            append,
            "pending items canceled"
        );

        if append {
            for entry in canceled {
                // Only fails once the context is terminated, then the entry
                // has nowhere to run.
                let _ = self.append_entry(entry);
            }
        } else {
            drop(canceled);
        }

        let next = self.lists.lock().delayed.peek_next();
        self.schedule_next_pending(NO_DUE, next);
    }

    pub(crate) fn attach(&self, ctx: &Arc<PortContext>) {
        self.attached.add(Arc::downgrade(ctx));
    }

    /// Drops `ctx` from the port along with every entry it still has queued,
    /// ready or delayed, without running them.
    pub(crate) fn detach(&self, ctx: &Arc<PortContext>) {
        self.cancel_pending_entries(ctx, false);

        let discarded = {
            let mut lists = self.lists.lock();
            let ready = std::mem::take(&mut lists.ready);
            let (discarded, kept): (VecDeque<_>, VecDeque<_>) =
                ready.into_iter().partition(|entry| entry.belongs_to(ctx));
            lists.ready = kept;
            discarded
        };

        if !discarded.is_empty() {
            tracing::debug!(port = self.id, count = discarded.len(), "discarded ready items");
        }
        drop(discarded);

        self.attached
            .remove(|weak| weak.as_ptr() == Arc::as_ptr(ctx) || weak.strong_count() == 0);
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Stops dispatch until `resume`. Immediate ports stop running inline.
    pub(crate) fn suspend(&self) {
        self.suspended.store(true, Ordering::Release);
        tracing::debug!(port = self.id, "port suspended");
    }

    pub(crate) fn resume(&self) {
        let backlog = {
            let lists = self.lists.lock();
            lists.ready.len() + lists.active.len()
        };

        self.suspended.store(false, Ordering::Release);
        tracing::debug!(port = self.id, backlog, "port resumed");

        for _ in 0..backlog {
            self.signal_queue();
            self.notify_item_queued();
        }
    }

    /// True when nothing is queued, delayed or running.
    pub(crate) fn is_empty(&self) -> bool {
        let lists = self.lists.lock();
        lists.ready.is_empty()
            && lists.delayed.is_empty()
            && self.processing.load(Ordering::Acquire) == 0
    }

    fn end_processing(&self) {
        if self.processing.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _unwind = self.unwind_lock.lock();
            self.unwind_cond.notify_all();
        }
    }

    /// Blocks until no thread is draining this port.
    pub(crate) fn wait_for_unwind(&self) {
        let mut unwind = self.unwind_lock.lock();

        while self.processing.load(Ordering::Acquire) != 0 {
            self.unwind_cond.wait_for(&mut unwind, UNWIND_POLL_INTERVAL);
        }
    }

    fn signal_queue(&self) {
        if self.is_suspended() {
            return;
        }
        self.wake_waiters();
    }

    fn wake_waiters(&self) {
        *self.signaled.lock() = true;
        self.signal_cond.notify_all();
    }

    pub(crate) fn register_wait(
        &self,
        ctx: &Arc<PortContext>,
        event: &Event,
        callback: WaitCallback,
    ) -> Result<u64> {
        self.verify_context(ctx)?;
        ctx.verify_not_terminated()?;

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let weak_ctx = Arc::downgrade(ctx);

        let subscription = event.subscribe(move || {
            let Some(ctx) = weak_ctx.upgrade() else {
                return;
            };

            let callback = Arc::clone(&callback);
            if let Err(e) = ctx.submit(move |canceled| callback(canceled)) {
                tracing::debug!(error = %e, "wait callback not queued");
            }
        });

        self.waits.insert(
            token,
            WaitRegistration {
                event: event.clone(),
                subscription,
            },
        );
        Ok(token)
    }

    pub(crate) fn unregister_wait(&self, token: u64) {
        match self.waits.remove(&token) {
            Some((_, registration)) => {
                registration.event.unsubscribe(registration.subscription);
            }
            None => tracing::warn!(port = self.id, token, "unknown wait registration"),
        }
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        for registration in self.waits.iter() {
            let registration = registration.value();
            registration.event.unsubscribe(registration.subscription);
        }

        self.timer.terminate();
        if let Some(executor) = &self.executor {
            executor.terminate();
        }

        self.wait_for_unwind();
        tracing::debug!(port = self.id, "port released");
    }
}
