//! Application handler contract and invocation
//!
//! A [`MessageHandler`] receives the decoded transport envelope and payload of
//! one message. It returns `Ok(())` to have the message deleted,
//! [`HandlerError::Ignored`] to leave it alone without complaint, or any other
//! error to leave it for redelivery with a warning.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info_span, warn};
use uuid::Uuid;

use crate::dispatcher::DispatchStats;
use crate::envelope::MessageEnvelope;
use crate::queue::QueueClient;
use crate::worker::{WorkerOutput, WorkerSlot};

/// Error returned by a handler
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The message is intentionally skipped: no delete, no warning
    #[error("message ignored")]
    Ignored,

    /// Handling failed; the message stays on the queue for redelivery
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl HandlerError {
    /// Signal that the message should be treated as a no-op
    pub fn ignore() -> Self {
        Self::Ignored
    }

    /// Wrap any error as a handler failure
    pub fn failed<E>(err: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Self::Failed(err.into())
    }

    /// Build a failure from a message
    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self::Failed(anyhow::Error::msg(message))
    }
}

/// Result of invoking the handler for one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handler returned normally and the message was deleted
    Success,
    /// Handler asked for the message to be ignored
    Ignored,
    /// Handler failed, panicked, or the delete did not go through
    Failed,
}

impl Outcome {
    /// Whether the message counts as processed
    pub fn is_processed(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Ignored => write!(f, "ignored"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Per-invocation context handed to a handler
///
/// Lines written with [`HandlerContext::log`] are buffered per worker and
/// emitted as a single event once the invocation finishes, so output from
/// concurrent workers never interleaves.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    queue_name: Arc<str>,
    worker: WorkerSlot,
    message_id: Option<String>,
    output: Arc<WorkerOutput>,
}

impl HandlerContext {
    pub fn new(queue_name: impl Into<Arc<str>>, output: Arc<WorkerOutput>) -> Self {
        Self {
            queue_name: queue_name.into(),
            worker: output.slot(),
            message_id: None,
            output,
        }
    }

    fn with_message_id(mut self, message_id: Option<String>) -> Self {
        self.message_id = message_id;
        self
    }

    /// Queue the message was received from
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Worker running this invocation
    pub fn worker(&self) -> WorkerSlot {
        self.worker
    }

    /// Transport message ID, when the queue provided one
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// Append a line to this worker's output buffer
    pub fn log(&self, line: impl Into<String>) {
        self.output.push(line);
    }
}

/// Application message handler
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(
        &self,
        ctx: &HandlerContext,
        transport: &Value,
        payload: &Value,
    ) -> Result<(), HandlerError>;
}

impl<H> MessageHandler for Arc<H>
where
    H: MessageHandler + ?Sized,
{
    fn handle(
        &self,
        ctx: &HandlerContext,
        transport: &Value,
        payload: &Value,
    ) -> Result<(), HandlerError> {
        (**self).handle(ctx, transport, payload)
    }
}

/// Handler backed by a closure, see [`handler_fn`]
pub struct FnHandler<F>(F);

impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&HandlerContext, &Value, &Value) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn handle(
        &self,
        ctx: &HandlerContext,
        transport: &Value,
        payload: &Value,
    ) -> Result<(), HandlerError> {
        (self.0)(ctx, transport, payload)
    }
}

/// Adapt a closure into a [`MessageHandler`]
///
/// ```
/// use sqs_dequeuer::{handler_fn, HandlerError};
///
/// let handler = handler_fn(|_ctx, _transport, payload| {
///     if payload.get("skip").is_some() {
///         return Err(HandlerError::ignore());
///     }
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&HandlerContext, &Value, &Value) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    FnHandler(f)
}

/// One parsed message bound to the handler that will process it
///
/// Created by the dispatcher, moved into a pool, and consumed by exactly one
/// worker.
pub struct DispatchRequest {
    id: Uuid,
    queue_name: Arc<str>,
    envelope: MessageEnvelope,
    handler: Arc<dyn MessageHandler>,
    client: Arc<dyn QueueClient>,
    stats: Arc<DispatchStats>,
}

impl fmt::Debug for DispatchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchRequest")
            .field("id", &self.id)
            .field("queue_name", &self.queue_name)
            .field("message_id", &self.envelope.message_id)
            .finish_non_exhaustive()
    }
}

impl DispatchRequest {
    pub(crate) fn new(
        queue_name: Arc<str>,
        envelope: MessageEnvelope,
        handler: Arc<dyn MessageHandler>,
        client: Arc<dyn QueueClient>,
        stats: Arc<DispatchStats>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            queue_name,
            envelope,
            handler,
            client,
            stats,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn envelope(&self) -> &MessageEnvelope {
        &self.envelope
    }

    /// Run the handler, containing any error or panic it produces
    pub fn run_handler(&self, worker: WorkerSlot, output: &Arc<WorkerOutput>) -> Outcome {
        let span = info_span!(
            "invocation",
            request_id = %self.id,
            queue = %self.queue_name,
            %worker,
            message_id = self.envelope.message_id.as_deref().unwrap_or("-"),
        );
        let _entered = span.enter();

        let ctx = HandlerContext::new(Arc::clone(&self.queue_name), Arc::clone(output))
            .with_message_id(self.envelope.message_id.clone());

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.handler
                .handle(&ctx, &self.envelope.transport, &self.envelope.payload)
        }));

        match result {
            Ok(Ok(())) => Outcome::Success,
            Ok(Err(HandlerError::Ignored)) => {
                debug!("Handler ignored message");
                Outcome::Ignored
            }
            Ok(Err(HandlerError::Failed(err))) => {
                warn!(
                    error = %err,
                    body = %self.envelope.raw_body,
                    "Handler failed; message left for redelivery"
                );
                warn!("Traceback: {}", traceback(&err));
                Outcome::Failed
            }
            Err(payload) => {
                warn!(
                    panic = %panic_message(payload.as_ref()),
                    body = %self.envelope.raw_body,
                    "Handler panicked; message left for redelivery"
                );
                warn!("Traceback: {}", Backtrace::force_capture());
                Outcome::Failed
            }
        }
    }

    /// Acknowledge the message according to `outcome` and record it
    pub async fn settle(self, outcome: Outcome) -> Outcome {
        let outcome = match outcome {
            Outcome::Success => match self.client.delete(&self.envelope.delete_handle).await {
                Ok(()) => {
                    debug!(request_id = %self.id, "Message deleted");
                    Outcome::Success
                }
                Err(e) => {
                    self.stats.record_delete_failure();
                    warn!(
                        request_id = %self.id,
                        error = %e,
                        "Failed to delete handled message; it will be redelivered"
                    );
                    Outcome::Failed
                }
            },
            other => other,
        };

        self.stats.record_outcome(outcome);
        outcome
    }

    /// Run and settle on the current task, flushing the worker's output
    pub async fn execute(self, worker: WorkerSlot, output: &Arc<WorkerOutput>) -> Outcome {
        let id = self.id;
        let outcome = self.run_handler(worker, output);
        let outcome = self.settle(outcome).await;
        output.flush(id);
        outcome
    }
}

/// Error chain plus a backtrace, captured here when the error carries none
fn traceback(err: &anyhow::Error) -> String {
    match err.backtrace().status() {
        BacktraceStatus::Captured => format!("{err:?}"),
        _ => format!("{err:?}\n\nStack backtrace:\n{}", Backtrace::force_capture()),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
