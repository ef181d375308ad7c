//! The user-facing queue: a work port and a completion port bound together.
//!
//! Work callbacks are usually queued on the work port, and the callbacks that
//! report their results on the completion port. Each port has its own dispatch
//! mode, so work can run on the thread pool while completions are dispatched
//! manually on a UI or game thread, for example.

use crate::errors::{Result, TaskQueueError};
use crate::event::Event;
use crate::port::{DispatchMode, Port, PortContext, PortHandle, PortKind};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

mod builder;
pub use builder::Builder;
use builder::QueueFlags;

mod monitor;
pub use monitor::{MONITOR_CAPACITY, MonitorCallback};
use monitor::MonitorRegistry;

mod termination;
pub use termination::TerminatedCallback;
use termination::TerminationState;

mod wait;
pub use wait::WAIT_CAPACITY;
use wait::{PortWait, WaitRegistry};

/// Identifies a monitor or wait registration on a queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RegistrationToken(pub(crate) u64);

pub(crate) struct QueueShared {
    id: u64,
    work: Arc<PortContext>,
    completion: Arc<PortContext>,
    monitors: MonitorRegistry,
    waits: WaitRegistry,
    flags: QueueFlags,
    termination: TerminationState,
}

impl QueueShared {
    fn context(&self, kind: PortKind) -> &Arc<PortContext> {
        match kind {
            PortKind::Work => &self.work,
            PortKind::Completion => &self.completion,
        }
    }

    /// Runs the monitors of the queue owning a context that just got an
    /// item queued.
    pub(crate) fn notify_monitors(shared: Arc<QueueShared>, kind: PortKind) {
        let queue = Queue { shared };
        queue.shared.monitors.invoke(&queue, kind);
    }
}

impl Drop for QueueShared {
    fn drop(&mut self) {
        for wait in self.waits.drain() {
            self.context(wait.kind).port().unregister_wait(wait.token);
        }

        for ctx in [&self.work, &self.completion] {
            ctx.set_status(crate::port::PortStatus::Terminated);
            ctx.port().detach(ctx);
        }

        tracing::debug!(queue = self.id, "queue released");
    }
}

/// A handle to a task queue. Clones refer to the same queue, which lives
/// until the last handle is gone and any termination in progress is over.
#[derive(Clone)]
pub struct Queue {
    pub(crate) shared: Arc<QueueShared>,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.shared.id)
            .field("work", &self.shared.work)
            .field("completion", &self.shared.completion)
            .field("waits", &self.shared.waits.len())
            .field("flags", &self.shared.flags)
            .finish()
    }
}

impl PartialEq for Queue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Queue {}

impl Queue {
    /// Creates a queue with the given dispatch modes, backed by the global
    /// thread pool.
    pub fn new(work_mode: DispatchMode, completion_mode: DispatchMode) -> Queue {
        Builder::new()
            .work_mode(work_mode)
            .completion_mode(completion_mode)
            .build()
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Creates a queue that dispatches through ports of existing queues.
    /// Terminating it only affects its own callbacks.
    pub fn composite(work: &PortHandle, completion: &PortHandle) -> Result<Queue> {
        let work = work.upgrade()?;
        let completion = completion.upgrade()?;

        Ok(Queue::from_ports(work, completion, QueueFlags::default()))
    }

    pub(crate) fn from_ports(work: Arc<Port>, completion: Arc<Port>, flags: QueueFlags) -> Queue {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);

        let shared = Arc::new_cyclic(|owner: &Weak<QueueShared>| QueueShared {
            id,
            work: PortContext::new(PortKind::Work, work, owner.clone()),
            completion: PortContext::new(PortKind::Completion, completion, owner.clone()),
            monitors: MonitorRegistry::new(),
            waits: WaitRegistry::new(),
            flags,
            termination: TerminationState::default(),
        });

        for ctx in [&shared.work, &shared.completion] {
            ctx.port().attach(ctx);
        }

        tracing::debug!(
            queue = id,
            work = shared.work.port().id(),
            completion = shared.completion.port().id(),
            "queue created"
        );
        Queue { shared }
    }

    pub fn port_context(&self, kind: PortKind) -> Arc<PortContext> {
        Arc::clone(self.shared.context(kind))
    }

    pub fn port_handle(&self, kind: PortKind) -> PortHandle {
        self.shared.context(kind).port_handle()
    }

    pub fn dispatch_mode(&self, kind: PortKind) -> DispatchMode {
        self.shared.context(kind).port().mode()
    }

    pub fn submit<F>(&self, kind: PortKind, callback: F) -> Result<()>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.shared.context(kind).submit(callback)
    }

    pub fn submit_delayed<F>(&self, kind: PortKind, delay_ms: u32, callback: F) -> Result<()>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.shared.context(kind).submit_delayed(delay_ms, callback)
    }

    /// Runs one ready callback of the given port on the calling thread,
    /// waiting up to `timeout_ms` for one. `u32::MAX` waits forever.
    pub fn dispatch(&self, kind: PortKind, timeout_ms: u32) -> bool {
        self.shared.context(kind).dispatch(timeout_ms)
    }

    /// True when the port has nothing queued, delayed or running. A shared
    /// port reports on every queue using it.
    pub fn is_empty(&self, kind: PortKind) -> bool {
        self.shared.context(kind).port().is_empty()
    }

    /// Stops the port from dispatching until [`resume`](Self::resume).
    /// Submitting still works.
    pub fn suspend(&self, kind: PortKind) {
        self.shared.context(kind).port().suspend()
    }

    pub fn resume(&self, kind: PortKind) {
        self.shared.context(kind).port().resume()
    }

    pub fn register_monitor<F>(&self, callback: F) -> Result<RegistrationToken>
    where
        F: Fn(&Queue, PortKind) + Send + Sync + 'static,
    {
        self.shared.monitors.register(Arc::new(callback))
    }

    /// Returns false for tokens that are not registered monitors.
    pub fn unregister_monitor(&self, token: RegistrationToken) -> bool {
        self.shared.monitors.unregister(token)
    }

    /// Queues `callback` on the given port every time `event` is set.
    pub fn register_wait<F>(
        &self,
        kind: PortKind,
        event: &Event,
        callback: F,
    ) -> Result<RegistrationToken>
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let ctx = self.shared.context(kind);
        let token = ctx.port().register_wait(ctx, event, Arc::new(callback))?;

        match self.shared.waits.insert(PortWait { kind, token }) {
            Ok(registration) => Ok(registration),
            Err(e) => {
                ctx.port().unregister_wait(token);
                Err(e)
            }
        }
    }

    pub fn unregister_wait(&self, token: RegistrationToken) {
        match self.shared.waits.remove(token) {
            Some(wait) => self
                .shared
                .context(wait.kind)
                .port()
                .unregister_wait(wait.token),
            None => tracing::warn!(queue = self.shared.id, ?token, "unknown wait registration"),
        }
    }

    pub fn can_terminate(&self) -> bool {
        self.shared.flags.allow_termination
    }

    pub fn can_close(&self) -> bool {
        self.shared.flags.allow_close
    }

    /// Releases this handle. Queues built with `allow_close(false)` refuse;
    /// the handle is released all the same, whoever created such a queue is
    /// expected to keep one.
    pub fn close(self) -> Result<()> {
        if self.can_close() {
            Ok(())
        } else {
            Err(TaskQueueError::AccessDenied)
        }
    }
}
