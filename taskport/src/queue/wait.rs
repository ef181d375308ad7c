use crate::errors::{Result, TaskQueueError};
use crate::port::PortKind;
use crate::queue::RegistrationToken;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Number of wait registrations a queue can hold at once.
pub const WAIT_CAPACITY: usize = 120;

/// Where a queue-level wait registration lives on the port side.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct PortWait {
    pub(crate) kind: PortKind,
    pub(crate) token: u64,
}

/// Maps queue tokens to port wait registrations.
#[derive(Debug)]
pub(crate) struct WaitRegistry {
    entries: DashMap<u64, PortWait>,
    len: AtomicUsize,
    next_token: AtomicU64,
}

impl WaitRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: DashMap::new(),
            len: AtomicUsize::new(0),
            next_token: AtomicU64::new(1),
        }
    }

    pub(crate) fn insert(&self, wait: PortWait) -> Result<RegistrationToken> {
        self.len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < WAIT_CAPACITY).then_some(n + 1)
            })
            .map_err(|_| TaskQueueError::CapacityExceeded {
                capacity: WAIT_CAPACITY,
            })?;

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(token, wait);
        Ok(RegistrationToken(token))
    }

    pub(crate) fn remove(&self, token: RegistrationToken) -> Option<PortWait> {
        let (_, wait) = self.entries.remove(&token.0)?;
        self.len.fetch_sub(1, Ordering::AcqRel);
        Some(wait)
    }

    /// Empties the registry, handing back every port registration.
    pub(crate) fn drain(&self) -> Vec<PortWait> {
        let tokens = self.entries.iter().map(|e| *e.key()).collect::<Vec<_>>();

        tokens
            .into_iter()
            .filter_map(|token| self.remove(RegistrationToken(token)))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wait(token: u64) -> PortWait {
        PortWait {
            kind: PortKind::Work,
            token,
        }
    }

    #[test]
    fn test_capacity() {
        let registry = WaitRegistry::new();

        for i in 0..WAIT_CAPACITY {
            assert!(registry.insert(wait(i as u64)).is_ok());
        }
        assert_eq!(
            registry.insert(wait(999)).err(),
            Some(TaskQueueError::CapacityExceeded {
                capacity: WAIT_CAPACITY
            })
        );

        let drained = registry.drain();
        assert_eq!(drained.len(), WAIT_CAPACITY);
        assert_eq!(registry.len(), 0);
        assert!(registry.insert(wait(1)).is_ok());
    }

    #[test]
    fn test_remove_unknown() {
        let registry = WaitRegistry::new();
        let token = registry.insert(wait(7));

        assert!(matches!(token, Ok(t) if registry.remove(t) == Some(wait(7))));
        assert!(registry.remove(RegistrationToken(12345)).is_none());
        assert_eq!(registry.len(), 0);
    }
}
