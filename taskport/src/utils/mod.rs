pub(crate) mod atomic_vector;
pub use atomic_vector::AtomicVector;

pub(crate) mod scope_guard;
pub(crate) use scope_guard::ScopeGuard;

pub(crate) mod thread;
