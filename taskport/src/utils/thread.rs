use anyhow::{Context, Result};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

impl ThreadNameFn {
    /// Yields names with a monotonically increasing suffix, "{prefix}-{N}".
    pub(crate) fn counting(prefix: &'static str) -> Self {
        let count = Arc::new(AtomicUsize::new(0));

        ThreadNameFn(Arc::new(move || {
            let id = count.fetch_add(1, Ordering::Relaxed);
            format!("{}-{}", prefix, id)
        }))
    }

    pub(crate) fn fixed(name: String) -> Self {
        ThreadNameFn(Arc::new(move || name.clone()))
    }

    pub(crate) fn next_name(&self) -> String {
        (self.0)()
    }
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Spawns a named OS thread, with an optional stack size.
pub(crate) fn spawn_named<F>(
    name: String,
    stack_size: Option<usize>,
    f: F,
) -> Result<thread::JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    let mut builder = thread::Builder::new().name(name.clone());

    if let Some(stack_size) = stack_size {
        builder = builder.stack_size(stack_size);
    }

    builder
        .spawn(f)
        .with_context(|| format!("failed to spawn thread {:?}", name))
}
