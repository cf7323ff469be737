//! # SQS Dequeuer
//!
//! A consumer-side dispatcher for a managed message queue. It long-polls a
//! queue for batches of messages, unwraps the transport envelope of each one,
//! and hands the payload to an application [`MessageHandler`] through a bounded
//! worker pool. Messages are deleted only when the handler succeeds.
//!
//! ## Features
//!
//! - **Two pool kinds**: a persistent group of OS worker threads fed through a
//!   bounded channel, and a lazily-built isolated pool for fire-and-forget work
//! - **Backpressure**: submission waits when either pool is full
//! - **Ignore / fail / succeed contract**: only successful messages are deleted
//! - **Panic isolation**: a bad message never takes a worker down
//! - **Idempotent shutdown**: workers are joined in start order
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                            │
//! │  (receive batch → filter → parse → route DispatchRequest)   │
//! └─────────────────────────────────────────────────────────────┘
//!          │                    │                       │
//!          ▼                    ▼                       ▼
//! ┌────────────────┐  ┌──────────────────┐  ┌────────────────────┐
//! │ inline (caller)│  │   ThreadPool     │  │   IsolatedPool     │
//! │ concurrency 0  │  │ bounded channel  │  │ lazy, semaphore    │
//! └────────────────┘  └──────────────────┘  └────────────────────┘
//!          │                    │                       │
//!          └──────────┬─────────┴───────────────────────┘
//!                     ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │        MessageHandler → Outcome → QueueClient::delete        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use sqs_dequeuer::prelude::*;
//!
//! let config = DequeuerConfig::new("orders")
//!     .with_process_concurrency(0)
//!     .with_thread_concurrency(4)
//!     .with_route(PoolKind::Threaded);
//!
//! let handler = handler_fn(|ctx, _transport, payload| {
//!     ctx.log(format!("order {}", payload["id"]));
//!     Ok(())
//! });
//!
//! let dispatcher = Dispatcher::new(config, client, handler)?;
//! let processed = dispatcher.poll_and_dispatch().await?;
//! dispatcher.shutdown().await;
//! ```

pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod queue;
pub mod telemetry;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{AwsCredentials, DequeuerConfig, PoolKind, ReceiveConfig, WorkerPoolConfig};
    pub use crate::dispatcher::Dispatcher;
    pub use crate::envelope::{MalformedMessage, MessageEnvelope};
    pub use crate::error::{ConfigError, DispatchError};
    pub use crate::handler::{handler_fn, HandlerContext, HandlerError, MessageHandler, Outcome};
    pub use crate::queue::{
        InMemoryQueueClient, QueueClient, QueueError, RawMessage, ReceiptHandle, ReceiveOptions,
    };
    #[cfg(feature = "sqs")]
    pub use crate::queue::SqsQueueClient;
}

// Re-export key types at crate root
pub use config::{AwsCredentials, DequeuerConfig, PoolKind, ReceiveConfig, WorkerPoolConfig};
pub use dispatcher::{DispatchStats, Dispatcher, StatsSnapshot};
pub use envelope::{MalformedMessage, MessageEnvelope};
pub use error::{ConfigError, DispatchError};
pub use handler::{handler_fn, DispatchRequest, HandlerContext, HandlerError, MessageHandler, Outcome};
pub use queue::{InMemoryQueueClient, QueueClient, QueueError, RawMessage, ReceiptHandle, ReceiveOptions};
#[cfg(feature = "sqs")]
pub use queue::SqsQueueClient;
pub use worker::{WorkerOutput, WorkerSlot};
