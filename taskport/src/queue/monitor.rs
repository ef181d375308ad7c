use crate::SPILL_TO_HEAP_THRESHOLD;
use crate::errors::{Result, TaskQueueError};
use crate::port::PortKind;
use crate::queue::{Queue, RegistrationToken};
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of monitors a queue can hold at once.
pub const MONITOR_CAPACITY: usize = 32;

/// Invoked after every successful enqueue, with the port it went to.
pub type MonitorCallback = Arc<dyn Fn(&Queue, PortKind) + Send + Sync + 'static>;

#[derive(Clone)]
struct MonitorSlot {
    token: u64,
    callback: MonitorCallback,
}

type Slots = [Option<MonitorSlot>; MONITOR_CAPACITY];

fn empty_slots() -> Slots {
    std::array::from_fn(|_| None)
}

/// Double buffered monitor table.
///
/// Writers are serialized. Each one builds the next table in the buffer
/// readers are not using, then bumps `generation`. The low bit of the
/// generation picks the live buffer. A reader copies the callbacks out under
/// the live buffer's read lock and invokes them unlocked, so the only time a
/// reader can wait is while a writer is overwriting a buffer that reader
/// picked from a stale generation.
pub(crate) struct MonitorRegistry {
    buffers: [RwLock<Slots>; 2],
    generation: AtomicU64,
    writer: Mutex<()>,
    next_token: AtomicU64,
}

impl fmt::Debug for MonitorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorRegistry")
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .field("len", &self.len())
            .finish()
    }
}

impl MonitorRegistry {
    pub(crate) fn new() -> Self {
        Self {
            buffers: [RwLock::new(empty_slots()), RwLock::new(empty_slots())],
            generation: AtomicU64::new(0),
            writer: Mutex::new(()),
            next_token: AtomicU64::new(1),
        }
    }

    fn live(&self) -> usize {
        (self.generation.load(Ordering::Acquire) & 1) as usize
    }

    pub(crate) fn register(&self, callback: MonitorCallback) -> Result<RegistrationToken> {
        let _writer = self.writer.lock();
        let live = self.live();
        let mut next = self.buffers[live].read().clone();

        let slot = next
            .iter_mut()
            .find(|slot| slot.is_none())
            .ok_or(TaskQueueError::CapacityExceeded {
                capacity: MONITOR_CAPACITY,
            })?;

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        *slot = Some(MonitorSlot { token, callback });

        self.publish(live, next);
        Ok(RegistrationToken(token))
    }

    pub(crate) fn unregister(&self, token: RegistrationToken) -> bool {
        let _writer = self.writer.lock();
        let live = self.live();
        let mut next = self.buffers[live].read().clone();

        let Some(slot) = next
            .iter_mut()
            .find(|slot| slot.as_ref().is_some_and(|s| s.token == token.0))
        else {
            return false;
        };

        *slot = None;
        self.publish(live, next);
        true
    }

    fn publish(&self, live: usize, next: Slots) {
        // Waits out readers still on the stale buffer.
        let stale = std::mem::replace(&mut *self.buffers[live ^ 1].write(), next);
        self.generation.fetch_add(1, Ordering::AcqRel);

        // Dropped callbacks may own arbitrary state, keep them off the lock.
        drop(stale);
    }

    pub(crate) fn invoke(&self, queue: &Queue, kind: PortKind) {
        let callbacks = self.buffers[self.live()]
            .read()
            .iter()
            .flatten()
            .map(|slot| Arc::clone(&slot.callback))
            .collect::<SmallVec<[MonitorCallback; SPILL_TO_HEAP_THRESHOLD]>>();

        for callback in callbacks {
            callback(queue, kind);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.buffers[self.live()].read().iter().flatten().count()
    }
}
