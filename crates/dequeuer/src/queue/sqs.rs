//! Amazon SQS implementation of QueueClient

use async_trait::async_trait;
use aws_sdk_sqs::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::MessageSystemAttributeName;
use aws_sdk_sqs::Client;
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};

use super::{QueueClient, QueueError, RawMessage, ReceiptHandle, ReceiveOptions};
use crate::config::{AwsCredentials, MAX_RECEIVE_BATCH};

const CREDENTIALS_PROVIDER: &str = "sqs-dequeuer";

/// SQS-backed queue client
///
/// The SDK client is built eagerly from resolved credentials. The queue URL is
/// looked up by name on first use and cached for the client's lifetime; call
/// [`SqsQueueClient::resolve`] to force the lookup up front.
pub struct SqsQueueClient {
    client: Client,
    queue_name: String,
    queue_url: OnceCell<String>,
}

impl SqsQueueClient {
    /// Create a client for the named queue
    pub fn new(queue_name: impl Into<String>, credentials: &AwsCredentials) -> Self {
        let provider = Credentials::new(
            credentials.access_key_id.clone(),
            credentials.secret_access_key.clone(),
            None,
            None,
            CREDENTIALS_PROVIDER,
        );

        let config = aws_sdk_sqs::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(credentials.region.clone()))
            .credentials_provider(provider)
            .build();

        Self {
            client: Client::from_conf(config),
            queue_name: queue_name.into(),
            queue_url: OnceCell::new(),
        }
    }

    /// Name of the consumed queue
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Resolve (and cache) the queue URL
    #[instrument(skip(self), fields(queue = %self.queue_name))]
    pub async fn resolve(&self) -> Result<&str, QueueError> {
        self.queue_url
            .get_or_try_init(|| async {
                let output = self
                    .client
                    .get_queue_url()
                    .queue_name(&self.queue_name)
                    .send()
                    .await
                    .map_err(|e| {
                        warn!(error = %DisplayErrorContext(&e), "Queue lookup failed");
                        QueueError::QueueNotFound(self.queue_name.clone())
                    })?;

                let url = output
                    .queue_url
                    .ok_or_else(|| QueueError::QueueNotFound(self.queue_name.clone()))?;
                debug!(%url, "Resolved queue URL");
                Ok::<_, QueueError>(url)
            })
            .await
            .map(String::as_str)
    }
}

fn seconds(duration: std::time::Duration) -> i32 {
    i32::try_from(duration.as_secs()).unwrap_or(i32::MAX)
}

#[async_trait]
impl QueueClient for SqsQueueClient {
    async fn receive(&self, options: &ReceiveOptions) -> Result<Vec<RawMessage>, QueueError> {
        let queue_url = self.resolve().await?;

        let output = self
            .client
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(options.max_messages.clamp(1, MAX_RECEIVE_BATCH) as i32)
            .wait_time_seconds(seconds(options.wait_time))
            .visibility_timeout(seconds(options.visibility_timeout))
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(|e| QueueError::Transport(DisplayErrorContext(&e).to_string()))?;

        let mut messages = Vec::new();
        for message in output.messages.unwrap_or_default() {
            let message_id = message.message_id.unwrap_or_default();
            match message.receipt_handle {
                Some(handle) => messages.push(RawMessage {
                    message_id: Some(message_id),
                    body: message.body,
                    receipt_handle: ReceiptHandle::new(handle),
                }),
                None => {
                    warn!(
                        error = %QueueError::MissingReceipt(message_id),
                        "Skipping undeletable message"
                    );
                }
            }
        }

        Ok(messages)
    }

    async fn delete(&self, handle: &ReceiptHandle) -> Result<(), QueueError> {
        let queue_url = self.resolve().await?;

        self.client
            .delete_message()
            .queue_url(queue_url)
            .receipt_handle(handle.as_str())
            .send()
            .await
            .map_err(|e| QueueError::Transport(DisplayErrorContext(&e).to_string()))?;

        Ok(())
    }
}
