//! Queue transport abstraction
//!
//! This module provides:
//! - [`QueueClient`] trait for receiving and deleting messages
//! - [`InMemoryQueueClient`] for testing
//! - [`SqsQueueClient`] for Amazon SQS (feature `sqs`)

mod memory;
#[cfg(feature = "sqs")]
mod sqs;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::InMemoryQueueClient;
#[cfg(feature = "sqs")]
pub use sqs::SqsQueueClient;

/// Error type for queue transport operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The transport call failed
    #[error("transport error: {0}")]
    Transport(String),

    /// The queue could not be resolved by name
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// A received message carried no receipt handle
    #[error("message {0} has no receipt handle")]
    MissingReceipt(String),
}

/// Opaque token used to delete a received message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message as delivered by the transport, before any parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub message_id: Option<String>,
    pub body: Option<String>,
    pub receipt_handle: ReceiptHandle,
}

impl RawMessage {
    pub fn new(body: impl Into<String>, receipt_handle: ReceiptHandle) -> Self {
        Self {
            message_id: None,
            body: Some(body.into()),
            receipt_handle,
        }
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// True for a missing, empty or whitespace-only body
    pub fn is_empty(&self) -> bool {
        self.body.as_deref().map_or(true, |b| b.trim().is_empty())
    }
}

/// Parameters of a single receive call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveOptions {
    pub max_messages: usize,
    pub wait_time: Duration,
    pub visibility_timeout: Duration,
}

/// Queue transport used by the dispatcher
///
/// Implementations must be safe to share between the polling loop and the
/// worker pools; deletes are issued concurrently from workers.
#[async_trait]
pub trait QueueClient: Send + Sync + 'static {
    /// Receive up to `options.max_messages` messages, long-polling for at
    /// most `options.wait_time`
    async fn receive(&self, options: &ReceiveOptions) -> Result<Vec<RawMessage>, QueueError>;

    /// Delete (acknowledge) a received message
    async fn delete(&self, handle: &ReceiptHandle) -> Result<(), QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_detection() {
        let handle = ReceiptHandle::new("r-1");
        assert!(RawMessage::new("", handle.clone()).is_empty());
        assert!(RawMessage::new("  \n", handle.clone()).is_empty());
        assert!(RawMessage {
            message_id: None,
            body: None,
            receipt_handle: handle.clone(),
        }
        .is_empty());
        assert!(!RawMessage::new("{}", handle).is_empty());
    }
}
