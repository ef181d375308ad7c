/// Runs a closure when dropped.
///
/// Used to restore counters and thread-local state on every exit path out of
/// a user callback, including unwinding.
pub(crate) struct ScopeGuard<F: FnOnce()> {
    // `Option` so `drop` can take the closure by value.
    closure: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub(crate) fn new(closure: F) -> Self {
        ScopeGuard {
            closure: Some(closure),
        }
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(closure) = self.closure.take() {
            closure();
        }
    }
}
