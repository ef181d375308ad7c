use crate::SPILL_TO_HEAP_THRESHOLD;
use crate::errors::Result;
use crate::port::{Port, PortContext, PortStatus};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Invoked once a context has fully drained after `terminate`.
pub type TerminationCallback = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct TerminationRequest {
    id: u64,
    ctx: Arc<PortContext>,
    callback: TerminationCallback,
}

impl fmt::Debug for TerminationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminationRequest")
            .field("id", &self.id)
            .field("kind", &self.ctx.kind())
            .finish()
    }
}

/// A prepared termination. It has to be handed back to the port that issued
/// it, either to start terminating or to roll back.
#[must_use = "a prepared termination must be started or canceled"]
#[derive(Debug)]
pub struct TerminationToken {
    id: u64,
    port: u64,
}

impl Port {
    /// Sets up the termination of `ctx`. Nothing changes for the context
    /// until the token is passed to [`Port::terminate`].
    pub(crate) fn prepare_terminate(
        &self,
        ctx: &Arc<PortContext>,
        callback: TerminationCallback,
    ) -> Result<TerminationToken> {
        self.verify_context(ctx)?;

        let id = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.lists.lock().prepared.push(TerminationRequest {
            id,
            ctx: Arc::clone(ctx),
            callback,
        });

        Ok(TerminationToken { id, port: self.id })
    }

    fn take_prepared(&self, token: &TerminationToken) -> Option<TerminationRequest> {
        if token.port != self.id {
            tracing::warn!(port = self.id, token = ?token, "token issued by another port");
            return None;
        }

        let mut lists = self.lists.lock();
        let idx = lists.prepared.iter().position(|r| r.id == token.id)?;
        Some(lists.prepared.remove(idx))
    }

    /// Rolls back a prepared termination. The context ends up canceled.
    pub(crate) fn cancel_termination(&self, token: TerminationToken) {
        if let Some(request) = self.take_prepared(&token) {
            request.ctx.set_status(PortStatus::Canceled);
            tracing::debug!(port = self.id, kind = ?request.ctx.kind(), "termination canceled");
        }
    }

    /// Starts terminating the context the token was prepared for. Its delayed
    /// entries become ready and run as canceled. The token's callback fires
    /// once nothing of the context is queued or running, and no termination
    /// suspend is held.
    pub(crate) fn terminate(&self, token: TerminationToken) {
        let Some(request) = self.take_prepared(&token) else {
            tracing::warn!(port = self.id, token = ?token, "unknown termination token");
            return;
        };

        let ctx = Arc::clone(&request.ctx);
        ctx.set_status(PortStatus::Terminating);
        tracing::debug!(port = self.id, kind = ?ctx.kind(), "terminating");

        self.cancel_pending_entries(&ctx, true);

        // Hold our own suspend so a concurrent resume cannot observe zero
        // before the request is filed.
        if ctx.add_suspend() {
            self.schedule_termination(request);
        } else {
            self.lists.lock().parked.push(request);
        }

        self.resume_termination(&ctx);
    }

    fn schedule_termination(&self, request: TerminationRequest) {
        self.lists.lock().active.push(request);
        self.signal_terminations();
    }

    pub(crate) fn suspend_termination(&self, ctx: &Arc<PortContext>) -> Result<()> {
        self.verify_context(ctx)?;
        ctx.add_suspend();

        if let Err(e) = ctx.verify_not_terminated() {
            self.resume_termination(ctx);
            return Err(e);
        }

        Ok(())
    }

    /// Releases one termination suspend. The last release schedules any
    /// termination parked behind it.
    pub(crate) fn resume_termination(&self, ctx: &Arc<PortContext>) {
        if !ctx.remove_suspend() {
            return;
        }

        let resumed = {
            let mut lists = self.lists.lock();
            let parked = std::mem::take(&mut lists.parked);
            let (resumed, kept): (Vec<_>, Vec<_>) = parked
                .into_iter()
                .partition(|r| Arc::ptr_eq(&r.ctx, ctx));

            lists.parked = kept;
            let count = resumed.len();
            lists.active.extend(resumed);
            count
        };

        if resumed > 0 {
            tracing::debug!(port = self.id, kind = ?ctx.kind(), resumed, "parked termination resumed");
            self.signal_terminations();
        }
    }

    /// Fires every active request whose context is terminating and fully
    /// drained. Callbacks run on the current thread, outside the lock.
    pub(crate) fn signal_terminations(&self) -> usize {
        let fired = {
            let mut lists = self.lists.lock();
            let mut fired = SmallVec::<[TerminationRequest; SPILL_TO_HEAP_THRESHOLD]>::new();

            let mut i = 0;
            while i < lists.active.len() {
                let drained = {
                    let ctx = &lists.active[i].ctx;
                    ctx.status() >= PortStatus::Terminating
                        && ctx.in_flight.load(Ordering::Acquire) == 0
                        && !lists.has_entries_for(ctx)
                };

                if drained {
                    let request = lists.active.remove(i);

                    // Under the lock, racing enqueues see it before queuing.
                    request.ctx.set_status(PortStatus::Terminated);
                    fired.push(request);
                } else {
                    i += 1;
                }
            }

            fired
        };

        let count = fired.len();
        for request in fired {
            tracing::debug!(port = self.id, kind = ?request.ctx.kind(), "port context terminated");
            (request.callback)();
        }

        if count > 0 {
            // Dispatch waiters return on `Terminated`, even while suspended.
            self.wake_waiters();
        }
        count
    }
}
