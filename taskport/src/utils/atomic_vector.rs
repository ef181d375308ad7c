use crate::SPILL_TO_HEAP_THRESHOLD;
use parking_lot::RwLock;
use smallvec::SmallVec;

/// A small concurrent vector. Writers take an exclusive lock, readers a
/// shared one.
///
/// `visit` hands elements to the visitor from a snapshot taken under the
/// read lock, so a visitor may call back into the vector (or into code that
/// mutates it) without deadlocking.
#[derive(Debug)]
pub struct AtomicVector<T> {
    items: RwLock<Vec<T>>,
}

impl<T> Default for AtomicVector<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AtomicVector<T> {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, item: T) {
        self.items.write().push(item);
    }

    /// Removes every element matching `predicate`, keeping survivors in their
    /// original order. Returns the number of removed elements.
    pub fn remove<P>(&self, mut predicate: P) -> usize
    where
        P: FnMut(&T) -> bool,
    {
        let mut items = self.items.write();
        let before = items.len();
        items.retain(|item| !predicate(item));
        before - items.len()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

impl<T: Clone> AtomicVector<T> {
    /// Invokes `visitor` once per element present when the call started.
    pub fn visit<V>(&self, mut visitor: V)
    where
        V: FnMut(&T),
    {
        let snapshot = self
            .items
            .read()
            .iter()
            .cloned()
            .collect::<SmallVec<[T; SPILL_TO_HEAP_THRESHOLD]>>();

        for item in snapshot.iter() {
            visitor(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::sync::Arc;
    use std::thread;

    assert_impl_all!(AtomicVector<Arc<u32>>: Send, Sync);

    #[test]
    fn test_remove_keeps_order() {
        let vec = AtomicVector::new();
        for i in 0..8 {
            vec.add(i);
        }

        assert_eq!(vec.remove(|i| i % 2 == 0), 4);

        let mut seen = Vec::new();
        vec.visit(|i| seen.push(*i));
        assert_eq!(seen, vec![1, 3, 5, 7]);
    }

    #[test]
    fn test_visitor_may_mutate() {
        let vec = AtomicVector::new();
        vec.add(1);
        vec.add(2);

        // Visiting works on a snapshot, the write lock is free.
        vec.visit(|i| vec.add(i * 10));
        assert_eq!(vec.len(), 4);

        vec.visit(|_| {
            vec.remove(|_| true);
        });
        assert!(vec.is_empty());
    }

    #[test]
    fn test_concurrent_add() {
        let vec = Arc::new(AtomicVector::new());

        let handles = (0..4)
            .map(|t| {
                let vec = Arc::clone(&vec);
                thread::spawn(move || {
                    for i in 0..100 {
                        vec.add(t * 100 + i);
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            assert!(handle.join().is_ok());
        }

        assert_eq!(vec.len(), 400);
    }
}
