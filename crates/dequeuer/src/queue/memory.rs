//! In-memory implementation of QueueClient for testing

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use super::{QueueClient, QueueError, RawMessage, ReceiptHandle, ReceiveOptions};

/// In-memory implementation of QueueClient
///
/// Receive pops messages in FIFO order; there is no visibility timeout, so a
/// received message is never redelivered. Deletes are recorded per handle so
/// tests can assert how often each message was acknowledged.
///
/// # Example
///
/// ```
/// use sqs_dequeuer::InMemoryQueueClient;
///
/// let client = InMemoryQueueClient::new();
/// let handle = client.push_notification(&serde_json::json!({"id": 11}));
/// assert_eq!(client.pending_count(), 1);
/// assert_eq!(client.delete_count(&handle), 0);
/// ```
pub struct InMemoryQueueClient {
    pending: Mutex<VecDeque<RawMessage>>,
    deletes: RwLock<HashMap<ReceiptHandle, usize>>,
    receive_calls: AtomicUsize,
    fail_next_receive: AtomicBool,
    fail_deletes: AtomicBool,
}

impl InMemoryQueueClient {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            deletes: RwLock::new(HashMap::new()),
            receive_calls: AtomicUsize::new(0),
            fail_next_receive: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
        }
    }

    /// Enqueue a raw message as-is
    pub fn push_raw(&self, message: RawMessage) {
        self.pending.lock().push_back(message);
    }

    /// Enqueue a message with the given body and a fresh receipt handle
    pub fn push_body(&self, body: impl Into<String>) -> ReceiptHandle {
        let id = Uuid::now_v7();
        let handle = ReceiptHandle::new(format!("receipt-{id}"));
        self.push_raw(RawMessage::new(body, handle.clone()).with_message_id(id.to_string()));
        handle
    }

    /// Enqueue `payload` wrapped in an SNS-style notification envelope
    pub fn push_notification(&self, payload: &serde_json::Value) -> ReceiptHandle {
        let body = serde_json::json!({
            "Type": "Notification",
            "MessageId": Uuid::now_v7().to_string(),
            "TopicArn": "arn:aws:sns:us-east-1:000000000000:in-memory",
            "Message": payload.to_string(),
            "Timestamp": Utc::now().to_rfc3339(),
        });
        self.push_body(body.to_string())
    }

    /// Number of messages waiting to be received
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Number of times `handle` was deleted
    pub fn delete_count(&self, handle: &ReceiptHandle) -> usize {
        self.deletes.read().get(handle).copied().unwrap_or(0)
    }

    /// Total number of delete calls that succeeded
    pub fn total_deletes(&self) -> usize {
        self.deletes.read().values().sum()
    }

    /// Number of receive calls made so far
    pub fn receive_calls(&self) -> usize {
        self.receive_calls.load(Ordering::SeqCst)
    }

    /// Make the next receive call fail with a transport error
    pub fn fail_next_receive(&self) {
        self.fail_next_receive.store(true, Ordering::SeqCst);
    }

    /// Make every delete call fail (or succeed again)
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }
}

impl Default for InMemoryQueueClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueClient for InMemoryQueueClient {
    async fn receive(&self, options: &ReceiveOptions) -> Result<Vec<RawMessage>, QueueError> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_next_receive.swap(false, Ordering::SeqCst) {
            return Err(QueueError::Transport("simulated receive failure".into()));
        }

        let mut pending = self.pending.lock();
        let take = options.max_messages.min(pending.len());
        Ok(pending.drain(..take).collect())
    }

    async fn delete(&self, handle: &ReceiptHandle) -> Result<(), QueueError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(QueueError::Transport("simulated delete failure".into()));
        }

        *self.deletes.write().entry(handle.clone()).or_insert(0) += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn options(max_messages: usize) -> ReceiveOptions {
        ReceiveOptions {
            max_messages,
            wait_time: Duration::ZERO,
            visibility_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_receive_respects_batch_size() {
        let client = InMemoryQueueClient::new();
        for i in 0..5 {
            client.push_body(format!("{{\"n\": {i}}}"));
        }

        let batch = tokio_test::block_on(client.receive(&options(3))).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].body.as_deref(), Some("{\"n\": 0}"));
        assert_eq!(client.pending_count(), 2);
        assert_eq!(client.receive_calls(), 1);
    }

    #[test]
    fn test_delete_is_recorded_per_handle() {
        let client = InMemoryQueueClient::new();
        let a = client.push_body("a");
        let b = client.push_body("b");

        tokio_test::block_on(client.delete(&a)).unwrap();
        tokio_test::block_on(client.delete(&a)).unwrap();

        assert_eq!(client.delete_count(&a), 2);
        assert_eq!(client.delete_count(&b), 0);
        assert_eq!(client.total_deletes(), 2);
    }

    #[test]
    fn test_simulated_failures() {
        let client = InMemoryQueueClient::new();
        let handle = client.push_body("x");

        client.fail_next_receive();
        assert!(tokio_test::block_on(client.receive(&options(10))).is_err());
        assert_eq!(
            tokio_test::block_on(client.receive(&options(10))).unwrap().len(),
            1
        );

        client.set_fail_deletes(true);
        assert!(tokio_test::block_on(client.delete(&handle)).is_err());
        assert_eq!(client.delete_count(&handle), 0);
    }

    #[test]
    fn test_notification_wraps_payload() {
        let client = InMemoryQueueClient::new();
        client.push_notification(&serde_json::json!({"id": 11}));

        let batch = tokio_test::block_on(client.receive(&options(1))).unwrap();
        let outer: serde_json::Value =
            serde_json::from_str(batch[0].body.as_deref().unwrap()).unwrap();
        assert_eq!(outer["Type"], "Notification");
        assert_eq!(outer["Message"], "{\"id\":11}");
    }
}
