use crate::errors::{Result, TaskQueueError};
use crate::port::{TerminationCallback, TerminationToken};
use crate::queue::Queue;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Invoked once both ports of a queue have terminated.
pub type TerminatedCallback = Box<dyn FnOnce() + Send + 'static>;

/// Which port the handshake is waiting on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum TerminationLevel {
    Work,
    Completion,
    Done,
}

/// Queue-wide "terminated" flag that `terminate(wait = true)` blocks on.
#[derive(Debug, Default)]
pub(crate) struct TerminationState {
    terminated: Mutex<bool>,
    cond: Condvar,
}

impl TerminationState {
    fn set(&self) {
        *self.terminated.lock() = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut terminated = self.terminated.lock();
        while !*terminated {
            self.cond.wait(&mut terminated);
        }
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.terminated.lock()
    }
}

/// One in-flight queue termination. Terminates the work port, then the
/// completion port, then reports back.
struct QueueTermination {
    level: Mutex<TerminationLevel>,
    completion_token: Mutex<Option<TerminationToken>>,
    callback: Mutex<Option<TerminatedCallback>>,

    /// Keeps the queue alive until the handshake is over, whatever happens
    /// to the caller's handles.
    queue: Mutex<Option<Queue>>,
}

impl QueueTermination {
    fn on_port_terminated(self: Arc<Self>) {
        let level = {
            let mut level = self.level.lock();
            let current = *level;
            *level = match current {
                TerminationLevel::Work => TerminationLevel::Completion,
                _ => TerminationLevel::Done,
            };
            current
        };

        match level {
            TerminationLevel::Work => {
                let queue = self.queue.lock().clone();
                let token = self.completion_token.lock().take();

                if let (Some(queue), Some(token)) = (queue, token) {
                    tracing::debug!(queue = queue.shared.id, "work port drained, terminating completion port");
                    queue.shared.completion.port().terminate(token);
                }
            }
            TerminationLevel::Completion => {
                let callback = self.callback.lock().take();
                if let Some(callback) = callback {
                    callback();
                }

                let queue = self.queue.lock().take();
                if let Some(queue) = queue {
                    tracing::debug!(queue = queue.shared.id, "queue terminated");
                    queue.shared.termination.set();
                }
            }
            TerminationLevel::Done => {
                tracing::warn!("termination callback fired after completion");
            }
        }
    }

    fn chain(self: &Arc<Self>) -> TerminationCallback {
        let request = Arc::clone(self);
        Box::new(move || request.on_port_terminated())
    }
}

impl Queue {
    /// Terminates the queue. Nothing new can be queued once this returns.
    ///
    /// Work callbacks still queued run with `canceled == true`, then the
    /// completion port goes through the same, then `callback` runs. With
    /// `wait`, blocks until all of that happened and every callback on both
    /// ports has returned. Do not wait from one of this queue's callbacks,
    /// and keep dispatching manual ports from other threads while waiting.
    pub fn terminate(&self, wait: bool, callback: Option<TerminatedCallback>) -> Result<()> {
        if !self.can_terminate() {
            return Err(TaskQueueError::AccessDenied);
        }

        let work = &self.shared.work;
        let completion = &self.shared.completion;

        let request = Arc::new(QueueTermination {
            level: Mutex::new(TerminationLevel::Work),
            completion_token: Mutex::new(None),
            callback: Mutex::new(callback),
            queue: Mutex::new(Some(self.clone())),
        });

        let work_token = work.port().prepare_terminate(work, request.chain())?;

        let completion_token = match completion
            .port()
            .prepare_terminate(completion, request.chain())
        {
            Ok(token) => token,
            Err(e) => {
                work.port().cancel_termination(work_token);
                return Err(e);
            }
        };

        *request.completion_token.lock() = Some(completion_token);
        drop(request);

        tracing::debug!(queue = self.shared.id, wait, "queue terminating");
        work.port().terminate(work_token);

        if wait {
            self.shared.termination.wait();
            work.port().wait_for_unwind();
            completion.port().wait_for_unwind();
        }

        Ok(())
    }

    /// True once a termination went all the way through.
    pub fn is_terminated(&self) -> bool {
        self.shared.termination.is_set()
    }
}
