//! Channel group configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls on `GroupConfig`
//! 2. Environment variables (`from_env()`)
//! 3. Library defaults (`defaults` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use chanio_runtime::config::{GroupConfig, ThreadModel};
//!
//! // Defaults with env overrides
//! let config = GroupConfig::from_env();
//!
//! // Or customize programmatically
//! let config = GroupConfig::from_env()
//!     .model(ThreadModel::Split { internal: 1, user: 4 })
//!     .max_handlers_on_stack(8);
//! ```

use chanio_core::env::{env_get, env_get_opt};

/// Library defaults
pub mod defaults {
    /// Internal (poll-only) threads in a split group
    pub const INTERNAL_THREADS: usize = 1;
    /// Direct handler invocations allowed on one thread's stack
    pub const MAX_HANDLERS_ON_STACK: usize = 16;
    /// Bounded hand-off queue of fixed groups
    pub const TASK_QUEUE_CAPACITY: usize = 4096;
    /// Events drained per readiness wait
    pub const EVENTS_PER_POLL: usize = 8;
    /// Thread name prefix
    pub const NAME: &str = "chanio";

    /// Handler threads: one per CPU
    pub fn threads() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

/// How a group's threads divide polling and handler work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadModel {
    /// `n` threads, each polls for readiness and runs handlers.
    /// Work for a busy thread is handed to a parked one through the
    /// bounded task queue plus a port wakeup.
    Fixed(usize),

    /// `internal` threads only poll for readiness; `user` threads only
    /// run tasks and completion handlers.
    Split { internal: usize, user: usize },
}

impl ThreadModel {
    /// Threads the group starts with
    #[inline]
    pub fn total_threads(&self) -> usize {
        match *self {
            ThreadModel::Fixed(n) => n,
            ThreadModel::Split { internal, user } => internal + user,
        }
    }

    #[inline]
    pub fn is_fixed(&self) -> bool {
        matches!(self, ThreadModel::Fixed(_))
    }
}

/// Channel group configuration with builder pattern
#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Thread layout
    pub model: ThreadModel,
    /// Ceiling on nested direct handler invocations per thread
    pub max_handlers_on_stack: usize,
    /// Capacity of the fixed-group hand-off queue
    pub task_queue_capacity: usize,
    /// Readiness events taken per wait
    pub events_per_poll: usize,
    /// Prefix for thread names
    pub name: String,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl GroupConfig {
    /// Create config from defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `CHANIO_THREAD_MODEL` - `fixed` (default) or `split`
    /// - `CHANIO_THREADS` - fixed thread count / split user threads
    /// - `CHANIO_INTERNAL_THREADS` - split internal threads
    /// - `CHANIO_MAX_HANDLERS_ON_STACK` - direct invocation ceiling
    /// - `CHANIO_TASK_QUEUE_CAPACITY` - fixed-group queue capacity
    /// - `CHANIO_EVENTS_PER_POLL` - events per readiness wait
    pub fn from_env() -> Self {
        let threads = env_get("CHANIO_THREADS", defaults::threads());
        let model = match env_get_opt::<String>("CHANIO_THREAD_MODEL").as_deref() {
            Some("split") => ThreadModel::Split {
                internal: env_get("CHANIO_INTERNAL_THREADS", defaults::INTERNAL_THREADS),
                user: threads,
            },
            _ => ThreadModel::Fixed(threads),
        };
        Self {
            model,
            max_handlers_on_stack: env_get(
                "CHANIO_MAX_HANDLERS_ON_STACK",
                defaults::MAX_HANDLERS_ON_STACK,
            ),
            task_queue_capacity: env_get(
                "CHANIO_TASK_QUEUE_CAPACITY",
                defaults::TASK_QUEUE_CAPACITY,
            ),
            events_per_poll: env_get("CHANIO_EVENTS_PER_POLL", defaults::EVENTS_PER_POLL),
            name: defaults::NAME.to_string(),
        }
    }

    /// Fixed group with `n` threads, other settings from the environment
    pub fn fixed(n: usize) -> Self {
        Self::from_env().model(ThreadModel::Fixed(n))
    }

    /// Split group, other settings from the environment
    pub fn split(internal: usize, user: usize) -> Self {
        Self::from_env().model(ThreadModel::Split { internal, user })
    }

    /// Set the thread layout
    pub fn model(mut self, model: ThreadModel) -> Self {
        self.model = model;
        self
    }

    /// Set the direct invocation ceiling
    pub fn max_handlers_on_stack(mut self, n: usize) -> Self {
        self.max_handlers_on_stack = n;
        self
    }

    /// Set the fixed-group queue capacity
    pub fn task_queue_capacity(mut self, n: usize) -> Self {
        self.task_queue_capacity = n;
        self
    }

    /// Set events per readiness wait
    pub fn events_per_poll(mut self, n: usize) -> Self {
        self.events_per_poll = n;
        self
    }

    /// Set thread name prefix
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), &'static str> {
        match self.model {
            ThreadModel::Fixed(0) => return Err("fixed group needs at least 1 thread"),
            ThreadModel::Split { internal: 0, .. } => {
                return Err("split group needs at least 1 internal thread")
            }
            ThreadModel::Split { user: 0, .. } => {
                return Err("split group needs at least 1 user thread")
            }
            _ => {}
        }
        if self.max_handlers_on_stack == 0 {
            return Err("max_handlers_on_stack must be at least 1");
        }
        if self.model.is_fixed() && self.task_queue_capacity == 0 {
            return Err("task_queue_capacity must be at least 1");
        }
        if self.events_per_poll == 0 {
            return Err("events_per_poll must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let cfg = GroupConfig::fixed(3)
            .max_handlers_on_stack(4)
            .task_queue_capacity(16)
            .name("test");
        assert_eq!(cfg.model, ThreadModel::Fixed(3));
        assert_eq!(cfg.max_handlers_on_stack, 4);
        assert_eq!(cfg.task_queue_capacity, 16);
        assert_eq!(cfg.name, "test");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_pools() {
        assert!(GroupConfig::fixed(0).validate().is_err());
        assert!(GroupConfig::split(0, 2).validate().is_err());
        assert!(GroupConfig::split(1, 0).validate().is_err());
        assert!(GroupConfig::fixed(1).max_handlers_on_stack(0).validate().is_err());
        assert!(GroupConfig::split(1, 1).validate().is_ok());
    }

    #[test]
    fn test_total_threads() {
        assert_eq!(ThreadModel::Fixed(4).total_threads(), 4);
        assert_eq!(ThreadModel::Split { internal: 1, user: 3 }.total_threads(), 4);
    }
}
