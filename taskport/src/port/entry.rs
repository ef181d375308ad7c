use crate::port::context::PortContext;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Callback of a queued item. The argument tells whether the owning context
/// was canceled by the time it ran.
pub type Callback = Box<dyn FnOnce(bool) + Send + 'static>;

pub(crate) struct QueueEntry {
    pub(crate) ctx: Arc<PortContext>,
    pub(crate) callback: Callback,
    pub(crate) seq: u64,

    /// Absolute due time in ticks. Zero for entries created ready.
    pub(crate) due: u64,
}

impl fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueEntry")
            .field("kind", &self.ctx.kind())
            .field("seq", &self.seq)
            .field("due", &self.due)
            .finish()
    }
}

impl QueueEntry {
    pub(crate) fn belongs_to(&self, ctx: &Arc<PortContext>) -> bool {
        Arc::ptr_eq(&self.ctx, ctx)
    }
}

/// FIFO of entries ready to run.
pub(crate) type ReadyQueue = VecDeque<QueueEntry>;

/// Entries waiting for their due time, ordered by `(due, seq)` so equal due
/// times keep submission order.
#[derive(Debug, Default)]
pub(crate) struct DelayedQueue {
    entries: BTreeMap<(u64, u64), QueueEntry>,
}

impl DelayedQueue {
    pub(crate) fn insert(&mut self, entry: QueueEntry) {
        self.entries.insert((entry.due, entry.seq), entry);
    }

    /// Removes the oldest entry due exactly at `due`.
    pub(crate) fn take_due(&mut self, due: u64) -> Option<QueueEntry> {
        let key = *self.entries.range((due, 0)..=(due, u64::MAX)).next()?.0;
        self.entries.remove(&key)
    }

    /// Earliest due time and the context owning that entry.
    pub(crate) fn peek_next(&self) -> Option<(u64, Arc<PortContext>)> {
        self.entries
            .first_key_value()
            .map(|(&(due, _), entry)| (due, Arc::clone(&entry.ctx)))
    }

    /// Removes every entry of `ctx`, earliest first.
    pub(crate) fn drain_for(&mut self, ctx: &Arc<PortContext>) -> Vec<QueueEntry> {
        let keys = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.belongs_to(ctx))
            .map(|(key, _)| *key)
            .collect::<Vec<_>>();

        keys.into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .collect()
    }

    pub(crate) fn contains(&self, ctx: &Arc<PortContext>) -> bool {
        self.entries.values().any(|entry| entry.belongs_to(ctx))
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
