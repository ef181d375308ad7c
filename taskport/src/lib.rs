//! A dual-port task queue.
//!
//! Every [`Queue`] owns a work port and a completion port. Callbacks submitted
//! to a port run according to its [`DispatchMode`]: on an explicit
//! [`Queue::dispatch`], on the thread pool, serialized on the thread pool, or
//! inline on the submitting thread.

pub mod errors;
pub use errors::{Result, TaskQueueError};

mod event;
pub use event::{Event, ResetMode};

pub mod pool;
pub use pool::{ActionStatus, ThreadPool, complete_current, may_run_long};

mod port;
pub use port::{Callback, DispatchMode, PortContext, PortHandle, PortKind, PortStatus, WaitCallback};

mod queue;
pub use queue::{
    Builder, MONITOR_CAPACITY, MonitorCallback, Queue, RegistrationToken, TerminatedCallback,
    WAIT_CAPACITY,
};

pub mod timer;

mod utils;

#[cfg(test)]
mod test_utils;

/// Inline capacity of the small vectors used for snapshots taken under a
/// lock.
pub(crate) const SPILL_TO_HEAP_THRESHOLD: usize = 16;
