use crate::pool::ActionStatus;
use crate::port::{DispatchMode, Port, PortContext, PortStatus, QueueEntry};
use crate::utils::ScopeGuard;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

impl Port {
    /// Runs the callback at the head of the ready FIFO on the current thread.
    /// Returns false if there was nothing to run or the port is suspended.
    pub(crate) fn drain_one_item(&self) -> bool {
        if self.is_suspended() && self.mode != DispatchMode::Immediate {
            return false;
        }

        self.processing.fetch_add(1, Ordering::AcqRel);
        let processing = ScopeGuard::new(|| self.end_processing());

        let entry = {
            let mut lists = self.lists.lock();
            let entry = lists.ready.pop_front();
            if let Some(entry) = &entry {
                entry.ctx.in_flight.fetch_add(1, Ordering::AcqRel);
            }
            entry
        };

        let drained = match entry {
            Some(QueueEntry {
                ctx, callback, seq, ..
            }) => {
                let canceled = ctx.is_canceled();
                tracing::trace!(port = self.id, seq, canceled, "running callback");

                let _in_flight = ScopeGuard::new(|| {
                    ctx.in_flight.fetch_sub(1, Ordering::AcqRel);
                });
                callback(canceled);
                true
            }
            None => false,
        };

        drop(processing);

        // A terminating context may have just run its last callback.
        let fired = self.signal_terminations();
        if drained || fired > 0 {
            self.signal_queue();
        }

        drained
    }

    /// Runs one callback, waiting up to `timeout_ms` for one to become ready.
    /// Returns false on timeout, or once `ctx` is terminated.
    pub(crate) fn dispatch(&self, ctx: &Arc<PortContext>, timeout_ms: u32) -> bool {
        let deadline = match timeout_ms {
            u32::MAX => None,
            ms => Some(Instant::now() + Duration::from_millis(ms as u64)),
        };

        loop {
            if self.drain_one_item() {
                return true;
            }

            if !self.wait(ctx, deadline) {
                return false;
            }
        }
    }

    /// Blocks until something may be ready to drain. False on timeout or
    /// when `ctx` reached `Terminated`.
    fn wait(&self, ctx: &Arc<PortContext>, deadline: Option<Instant>) -> bool {
        let mut signaled = self.signaled.lock();

        loop {
            if ctx.status() == PortStatus::Terminated {
                return false;
            }

            if std::mem::take(&mut *signaled) {
                return true;
            }

            if !self.is_suspended() && !self.lists.lock().ready.is_empty() {
                return true;
            }

            match deadline {
                None => self.signal_cond.wait(&mut signaled),
                Some(deadline) => {
                    if self
                        .signal_cond
                        .wait_until(&mut signaled, deadline)
                        .timed_out()
                    {
                        return std::mem::take(&mut *signaled)
                            && ctx.status() != PortStatus::Terminated;
                    }
                }
            }
        }
    }

    /// Invoked by the thread pool, once per `submit`.
    pub(crate) fn process_pool_callback(&self, status: &ActionStatus) {
        self.processing.fetch_add(1, Ordering::AcqRel);

        {
            let _processing = ScopeGuard::new(|| self.end_processing());

            match self.mode {
                DispatchMode::SerializedThreadPool => self.drain_serialized(),
                _ => {
                    self.drain_one_item();
                }
            }
        }

        // Must happen before the pool's reference to the port is released,
        // dropping the last one terminates this very work item.
        status.complete();
    }

    /// Drains the whole ready FIFO, one callback at a time across all pool
    /// threads.
    fn drain_serialized(&self) {
        while self
            .serial_gate
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            {
                let _gate = ScopeGuard::new(|| self.serial_gate.store(false, Ordering::Release));
                while self.drain_one_item() {}
            }

            // Enqueues that found the gate held skipped their submit.
            if self.is_suspended() || self.lists.lock().ready.is_empty() {
                break;
            }
        }
    }
}
