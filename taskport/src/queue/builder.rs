use crate::pool::ThreadPool;
use crate::port::{DispatchMode, Port};
use crate::queue::Queue;

/// Configures and creates a [`Queue`] with its own pair of ports.
#[derive(Debug)]
pub struct Builder {
    /// Dispatch mode of the work port.
    work_mode: DispatchMode,

    /// Dispatch mode of the completion port.
    completion_mode: DispatchMode,

    /// Whether `Queue::terminate` is allowed. Queues shared process-wide
    /// usually turn this off so no single user can shut them down.
    allow_termination: bool,

    /// Whether `Queue::close` is allowed.
    allow_close: bool,

    /// Pool backing thread pool dispatch modes. Defaults to
    /// [`ThreadPool::global`].
    thread_pool: Option<ThreadPool>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            work_mode: DispatchMode::default(),
            completion_mode: DispatchMode::default(),
            allow_termination: true,
            allow_close: true,
            thread_pool: None,
        }
    }

    pub fn work_mode(&mut self, mode: DispatchMode) -> &mut Self {
        self.work_mode = mode;
        self
    }

    pub fn completion_mode(&mut self, mode: DispatchMode) -> &mut Self {
        self.completion_mode = mode;
        self
    }

    pub fn allow_termination(&mut self, val: bool) -> &mut Self {
        self.allow_termination = val;
        self
    }

    pub fn allow_close(&mut self, val: bool) -> &mut Self {
        self.allow_close = val;
        self
    }

    pub fn thread_pool(&mut self, pool: ThreadPool) -> &mut Self {
        self.thread_pool = Some(pool);
        self
    }

    /// Creates the queue. Pool threads and timer threads start lazily, the
    /// first time something needs them.
    pub fn build(&mut self) -> Queue {
        let cfg = QueueConfig::from(&*self);
        let pool = cfg.thread_pool.unwrap_or_else(ThreadPool::global);

        let work = Port::new(cfg.work_mode, &pool);
        let completion = Port::new(cfg.completion_mode, &pool);

        Queue::from_ports(work, completion, cfg.flags)
    }
}

/// Permissions fixed at construction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct QueueFlags {
    pub(crate) allow_termination: bool,
    pub(crate) allow_close: bool,
}

impl Default for QueueFlags {
    fn default() -> Self {
        Self {
            allow_termination: true,
            allow_close: true,
        }
    }
}

#[derive(Debug)]
pub(crate) struct QueueConfig {
    pub(crate) work_mode: DispatchMode,
    pub(crate) completion_mode: DispatchMode,
    pub(crate) flags: QueueFlags,
    pub(crate) thread_pool: Option<ThreadPool>,
}

impl From<&Builder> for QueueConfig {
    fn from(builder: &Builder) -> Self {
        QueueConfig {
            work_mode: builder.work_mode,
            completion_mode: builder.completion_mode,
            flags: QueueFlags {
                allow_termination: builder.allow_termination,
                allow_close: builder.allow_close,
            },
            thread_pool: builder.thread_pool.clone(),
        }
    }
}
