use crate::pool::ThreadPool;
use crate::utils::thread::ThreadNameFn;
use anyhow::{Result, anyhow};
use std::convert::TryFrom;
use std::thread;

/// Used when the platform cannot report its parallelism.
const FALLBACK_WORKER_THREADS: usize = 4;

/// Ceiling on growth through `may_run_long`, as a multiple of `worker_threads`.
const MAX_THREADS_MULTIPLIER: usize = 4;

fn default_worker_threads() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(FALLBACK_WORKER_THREADS)
}

#[derive(Debug)]
pub struct Builder {
    /// Threads kept around to run callbacks. They are spawned on demand, the
    /// first time the pool runs out of idle threads. Defaults to one per core.
    worker_threads: Option<usize>,

    /// Upper bound on threads, including the extra ones started for callbacks
    /// that declared themselves long running.
    max_threads: Option<usize>,

    /// Name fn used for threads spawned by the pool.
    thread_name: ThreadNameFn,

    /// Stack size used for threads spawned by the pool.
    thread_stack_size: Option<usize>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            worker_threads: None,
            max_threads: None,
            thread_name: ThreadNameFn::counting("taskport"),
            thread_stack_size: None,
        }
    }

    /// The number of threads running callbacks under normal load.
    ///
    /// Defaults to 1 worker per CPU core.
    #[track_caller]
    pub fn worker_threads(&mut self, val: usize) -> &mut Self {
        assert!(val > 0, "worker_threads must be greater than 0");
        self.worker_threads = Some(val);
        self
    }

    /// The number of threads the pool may grow to when callbacks hint that
    /// they will block for a long time.
    ///
    /// Defaults to 4 times `worker_threads`.
    #[track_caller]
    pub fn max_threads(&mut self, val: usize) -> &mut Self {
        assert!(val > 0, "max_threads must be greater than 0");
        self.max_threads = Some(val);
        self
    }

    /// Sets name of threads spawned by the pool.
    ///
    /// The default name is "taskport-{id}", where id is monotonically
    /// increasing.
    pub fn thread_name(&mut self, val: impl Into<String>) -> &mut Self {
        self.thread_name = ThreadNameFn::fixed(val.into());
        self
    }

    /// Sets a function used to generate the name of threads spawned by the pool.
    pub fn thread_name_fn<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(std::sync::Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for pool threads.
    ///
    /// The actual stack size may be greater than this value if the platform
    /// specifies minimal stack size.
    #[track_caller]
    pub fn thread_stack_size(&mut self, val: usize) -> &mut Self {
        assert!(
            val.is_power_of_two(),
            "thread_stack_size must be a power of two"
        );
        self.thread_stack_size = Some(val);
        self
    }

    /// Creates the configured `ThreadPool`. Threads start lazily.
    pub fn try_build(&mut self) -> Result<ThreadPool> {
        let cfg = PoolConfig::try_from(&*self)?;
        Ok(ThreadPool::new(cfg))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PoolConfig {
    pub(crate) worker_threads: usize,

    pub(crate) max_threads: usize,

    pub(crate) thread_name: ThreadNameFn,

    pub(crate) thread_stack_size: Option<usize>,
}

impl TryFrom<&Builder> for PoolConfig {
    type Error = anyhow::Error;

    fn try_from(builder: &Builder) -> Result<Self> {
        let worker_threads = builder
            .worker_threads
            .unwrap_or_else(default_worker_threads);

        let cfg = PoolConfig {
            worker_threads,
            max_threads: builder
                .max_threads
                .unwrap_or(worker_threads * MAX_THREADS_MULTIPLIER),
            thread_name: builder.thread_name.clone(),
            thread_stack_size: builder.thread_stack_size,
        };

        cfg.validate()?;
        Ok(cfg)
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<()> {
        if self.max_threads < self.worker_threads {
            return Err(anyhow!(
                "max_threads ({}) must be at least worker_threads ({})",
                self.max_threads,
                self.worker_threads
            ));
        }

        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        let worker_threads = default_worker_threads();

        PoolConfig {
            worker_threads,
            max_threads: worker_threads * MAX_THREADS_MULTIPLIER,
            thread_name: ThreadNameFn::counting("taskport"),
            thread_stack_size: None,
        }
    }
}
