//! Error types shared across the dispatcher

use crate::queue::QueueError;

/// Configuration errors, fatal at construction time
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A required value was neither passed explicitly nor set in the environment
    #[error("missing required configuration: {0}")]
    MissingVar(&'static str),

    /// A value was present but could not be used
    #[error("invalid configuration for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Dispatcher errors
///
/// Per-message failures never surface here; they are logged and counted in
/// [`DispatchStats`](crate::DispatchStats) instead.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Queue transport error (receive failed, queue could not be resolved)
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Thread workers need a tokio runtime to settle messages
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),

    /// A worker thread could not be spawned
    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    /// The thread pool's queue no longer has any consumers
    #[error("worker pool is closed")]
    PoolClosed,

    /// `poll_and_dispatch` was called after shutdown started
    #[error("dispatcher has been shut down")]
    ShutDown,
}
