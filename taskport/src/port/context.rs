use crate::errors::{Result, TaskQueueError};
use crate::port::{Port, PortHandle};
use crate::queue::QueueShared;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Which of a queue's two ports a context is bound to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PortKind {
    Work,
    Completion,
}

/// Lifecycle of a port context. Only ever moves forward.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum PortStatus {
    Active = 0,
    Canceled = 1,
    Terminating = 2,
    Terminated = 3,
}

impl PortStatus {
    fn from_u8(val: u8) -> Self {
        match val {
            0 => PortStatus::Active,
            1 => PortStatus::Canceled,
            2 => PortStatus::Terminating,
            _ => PortStatus::Terminated,
        }
    }
}

/// Binds a queue's Work or Completion role to a [`Port`].
///
/// Several contexts, owned by different queues, may share one port. Each keeps
/// its own status, so terminating one queue cancels only its own entries.
pub struct PortContext {
    kind: PortKind,
    port: Arc<Port>,
    status: AtomicU8,

    /// Holds that keep termination from being scheduled.
    suspend_count: AtomicU32,

    /// Callbacks of this context running right now. Incremented under the
    /// port lists lock, so termination can check it alongside the queues.
    pub(crate) in_flight: AtomicUsize,

    owner: Weak<QueueShared>,
}

impl fmt::Debug for PortContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortContext")
            .field("kind", &self.kind)
            .field("port", &self.port.id())
            .field("status", &self.status())
            .field("suspend_count", &self.suspend_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl PortContext {
    pub(crate) fn new(kind: PortKind, port: Arc<Port>, owner: Weak<QueueShared>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            port,
            status: AtomicU8::new(PortStatus::Active as u8),
            suspend_count: AtomicU32::new(0),
            in_flight: AtomicUsize::new(0),
            owner,
        })
    }

    pub fn kind(&self) -> PortKind {
        self.kind
    }

    pub fn status(&self) -> PortStatus {
        PortStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Moves the status forward to `status`. Never moves it backwards.
    pub(crate) fn set_status(&self, status: PortStatus) {
        self.status.fetch_max(status as u8, Ordering::AcqRel);
    }

    /// Callbacks observe this as their `canceled` argument.
    pub fn is_canceled(&self) -> bool {
        self.status() != PortStatus::Active
    }

    pub(crate) fn verify_not_terminated(&self) -> Result<()> {
        if self.status() > PortStatus::Canceled {
            Err(TaskQueueError::Aborted)
        } else {
            Ok(())
        }
    }

    pub(crate) fn port(&self) -> &Arc<Port> {
        &self.port
    }

    pub fn port_handle(&self) -> PortHandle {
        PortHandle::new(&self.port)
    }

    /// Returns true on the 0 to 1 transition.
    pub(crate) fn add_suspend(&self) -> bool {
        self.suspend_count.fetch_add(1, Ordering::AcqRel) == 0
    }

    /// Returns true when the count reaches zero, or already was zero.
    pub(crate) fn remove_suspend(&self) -> bool {
        let mut current = self.suspend_count.load(Ordering::Acquire);

        loop {
            if current == 0 {
                tracing::warn!(kind = ?self.kind, "unbalanced suspend release");
                return true;
            }

            match self.suspend_count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return current == 1,
                Err(actual) => current = actual,
            }
        }
    }

    /// Called by the port after an entry of this context was queued.
    pub(crate) fn item_queued(&self) {
        if let Some(owner) = self.owner.upgrade() {
            QueueShared::notify_monitors(owner, self.kind);
        }
    }

    /// Queues `callback` to run as soon as the port dispatches it.
    pub fn submit<F>(self: &Arc<Self>, callback: F) -> Result<()>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.port.queue_item(self, 0, Box::new(callback))
    }

    /// Queues `callback` to become ready `delay_ms` milliseconds from now.
    pub fn submit_delayed<F>(self: &Arc<Self>, delay_ms: u32, callback: F) -> Result<()>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.port.queue_item(self, delay_ms, Box::new(callback))
    }

    /// Runs at most one ready callback on the current thread, waiting up to
    /// `timeout_ms` for one to show up. `u32::MAX` waits forever.
    pub fn dispatch(self: &Arc<Self>, timeout_ms: u32) -> bool {
        self.port.dispatch(self, timeout_ms)
    }

    /// Holds off termination of this context until the matching
    /// [`resume_termination`](Self::resume_termination).
    pub fn suspend_termination(self: &Arc<Self>) -> Result<()> {
        self.port.suspend_termination(self)
    }

    pub fn resume_termination(self: &Arc<Self>) {
        self.port.resume_termination(self)
    }
}
