//! Worker pools for message dispatch
//!
//! This module provides:
//! - [`ThreadPool`] - persistent worker threads fed through a bounded channel
//! - [`IsolatedPool`] - lazily-built, panic-isolated pool for fire-and-forget work
//! - [`WorkerOutput`] - per-worker output buffer, flushed after each invocation
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        ThreadPool                            │
//! │   submit ──► [ bounded channel: capacity = 200 × threads ]   │
//! │                  │            │            │                 │
//! │                  ▼            ▼            ▼                 │
//! │             [thread-0]   [thread-1]   [thread-N]             │
//! │        recv_timeout → run handler → settle → flush output    │
//! └─────────────────────────────────────────────────────────────┘
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       IsolatedPool                           │
//! │   submit ──► admission ──► tracked task ──► permit ──► run   │
//! │   (built on first submit, admission = 200 × slots)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod isolated;
mod output;
mod threads;

pub use isolated::IsolatedPool;
pub use output::{WorkerOutput, WorkerSlot};
pub use threads::ThreadPool;
