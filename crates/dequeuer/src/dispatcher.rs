//! Polling loop and lifecycle
//!
//! [`Dispatcher::poll_and_dispatch`] runs one receive → parse → route cycle.
//! It is meant to be called repeatedly, either by the caller's own loop or by
//! [`Dispatcher::run_until`]. Workers are started at construction and stopped
//! by [`Dispatcher::shutdown`], which callers must invoke before exit.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::{DequeuerConfig, PoolKind};
use crate::envelope::MessageEnvelope;
use crate::error::DispatchError;
use crate::handler::{DispatchRequest, MessageHandler, Outcome};
use crate::queue::{QueueClient, RawMessage, ReceiveOptions};
use crate::worker::{IsolatedPool, ThreadPool, WorkerOutput, WorkerSlot};

/// Pause between polls after a receive error in [`Dispatcher::run_until`]
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Message counters, updated from the polling loop and every worker
#[derive(Debug, Default)]
pub struct DispatchStats {
    received: AtomicU64,
    empty: AtomicU64,
    malformed: AtomicU64,
    submitted: AtomicU64,
    succeeded: AtomicU64,
    ignored: AtomicU64,
    failed: AtomicU64,
    delete_failures: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub empty: u64,
    pub malformed: u64,
    pub submitted: u64,
    pub succeeded: u64,
    pub ignored: u64,
    pub failed: u64,
    pub delete_failures: u64,
}

impl StatsSnapshot {
    /// Invocations that reached an outcome
    pub fn settled(&self) -> u64 {
        self.succeeded + self.ignored + self.failed
    }
}

impl DispatchStats {
    pub(crate) fn record_outcome(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Success => &self.succeeded,
            Outcome::Ignored => &self.ignored,
            Outcome::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delete_failure(&self) {
        self.delete_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            empty: self.empty.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            delete_failures: self.delete_failures.load(Ordering::Relaxed),
        }
    }
}

/// How a single request left the dispatcher
enum Dispatched {
    /// Ran inline; outcome is known
    Completed(Outcome),
    /// Handed to a pool; outcome arrives later
    Submitted,
}

/// Queue consumer that routes each message to a worker pool
///
/// # Example
///
/// ```ignore
/// use sqs_dequeuer::prelude::*;
///
/// let dispatcher = Dispatcher::new(DequeuerConfig::new("jobs"), client, handler)?;
///
/// loop {
///     let processed = dispatcher.poll_and_dispatch().await?;
///     // ...
/// }
///
/// dispatcher.shutdown().await;
/// ```
pub struct Dispatcher {
    config: DequeuerConfig,
    queue_name: Arc<str>,
    client: Arc<dyn QueueClient>,
    handler: Arc<dyn MessageHandler>,
    stats: Arc<DispatchStats>,
    alive: Arc<AtomicBool>,
    threads: Option<ThreadPool>,
    isolated: Option<IsolatedPool>,
    caller_output: Arc<WorkerOutput>,
}

impl Dispatcher {
    /// Create a dispatcher and start its worker threads
    ///
    /// Worker threads settle messages through the current tokio runtime, so
    /// this must be called from within one when `thread_concurrency > 0`.
    pub fn new(
        config: DequeuerConfig,
        client: Arc<dyn QueueClient>,
        handler: impl MessageHandler,
    ) -> Result<Self, DispatchError> {
        config.validate()?;

        let alive = Arc::new(AtomicBool::new(true));
        let pool = &config.pool;

        let threads = if pool.thread_concurrency > 0 {
            let runtime =
                Handle::try_current().map_err(|e| DispatchError::NoRuntime(e.to_string()))?;
            Some(ThreadPool::start(
                pool.thread_concurrency,
                pool.internal_queue_capacity,
                pool.dequeue_timeout,
                Arc::clone(&alive),
                runtime,
            )?)
        } else {
            None
        };

        let isolated = (pool.process_concurrency > 0)
            .then(|| IsolatedPool::new(pool.process_concurrency, pool.isolated_capacity()));

        info!(
            queue = %config.queue_name,
            process_concurrency = pool.process_concurrency,
            thread_concurrency = pool.thread_concurrency,
            route = %pool.route,
            "New dispatcher"
        );

        Ok(Self {
            queue_name: Arc::from(config.queue_name.as_str()),
            config,
            client,
            handler: Arc::new(handler),
            stats: Arc::new(DispatchStats::default()),
            alive,
            threads,
            isolated,
            caller_output: Arc::new(WorkerOutput::new(WorkerSlot::Caller)),
        })
    }

    /// Connect to an SQS queue by name and create a dispatcher for it
    ///
    /// The queue URL is resolved before returning, so a missing queue fails
    /// here rather than on the first poll.
    #[cfg(feature = "sqs")]
    pub async fn connect_sqs(
        config: DequeuerConfig,
        credentials: &crate::config::AwsCredentials,
        handler: impl MessageHandler,
    ) -> Result<Self, DispatchError> {
        config.validate()?;
        let client = crate::queue::SqsQueueClient::new(config.queue_name.clone(), credentials);
        client.resolve().await?;
        Self::new(config, Arc::new(client), handler)
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Current message counters
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// False once shutdown has started
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Number of worker threads not yet joined
    pub fn worker_count(&self) -> usize {
        self.threads.as_ref().map_or(0, ThreadPool::worker_count)
    }

    /// Whether the isolated pool has been built
    pub fn isolated_pool_started(&self) -> bool {
        self.isolated.as_ref().is_some_and(IsolatedPool::is_started)
    }

    fn receive_options(&self) -> ReceiveOptions {
        ReceiveOptions {
            max_messages: self.config.batch_size(),
            wait_time: self.config.receive.wait_time,
            visibility_timeout: self.config.receive.visibility_timeout,
        }
    }

    /// Receive one batch and dispatch every message in it
    ///
    /// Returns the number of messages processed. Inline execution counts
    /// messages whose handler succeeded and whose delete went through; pooled
    /// execution counts messages handed to the pool. Empty, malformed,
    /// ignored and failed messages contribute nothing.
    #[instrument(skip(self), fields(queue = %self.queue_name))]
    pub async fn poll_and_dispatch(&self) -> Result<usize, DispatchError> {
        let messages = self.receive_batch().await?;
        Ok(self.dispatch_batch(messages).await)
    }

    async fn receive_batch(&self) -> Result<Vec<RawMessage>, DispatchError> {
        if !self.is_alive() {
            return Err(DispatchError::ShutDown);
        }

        let messages = self.client.receive(&self.receive_options()).await?;
        trace!(batch = messages.len(), "Received batch");
        Ok(messages)
    }

    async fn dispatch_batch(&self, messages: Vec<RawMessage>) -> usize {
        let mut processed = 0;
        for raw in messages {
            self.stats.received.fetch_add(1, Ordering::Relaxed);

            if raw.is_empty() {
                self.stats.empty.fetch_add(1, Ordering::Relaxed);
                trace!("Skipping empty message");
                continue;
            }

            let envelope = match MessageEnvelope::parse(&raw) {
                Ok(envelope) => envelope,
                Err(e) => {
                    self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        error = %e,
                        message_id = raw.message_id.as_deref().unwrap_or("-"),
                        body = raw.body.as_deref().unwrap_or_default(),
                        "Malformed message; left for redelivery"
                    );
                    continue;
                }
            };

            let request = DispatchRequest::new(
                Arc::clone(&self.queue_name),
                envelope,
                Arc::clone(&self.handler),
                Arc::clone(&self.client),
                Arc::clone(&self.stats),
            );

            match self.dispatch(request).await {
                Ok(Dispatched::Completed(outcome)) => {
                    if outcome.is_processed() {
                        processed += 1;
                    }
                }
                Ok(Dispatched::Submitted) => {
                    self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                    processed += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to dispatch message; left for redelivery");
                }
            }
        }

        if processed > 0 {
            debug!(processed, "{} messages processed.", processed);
        }
        processed
    }

    async fn dispatch(&self, request: DispatchRequest) -> Result<Dispatched, DispatchError> {
        match self.config.pool.route {
            PoolKind::Isolated => match &self.isolated {
                Some(pool) => {
                    // Fire-and-forget: the outcome lands in the stats
                    drop(pool.submit(request).await?);
                    Ok(Dispatched::Submitted)
                }
                None => Ok(Dispatched::Completed(self.execute_inline(request).await)),
            },
            PoolKind::Threaded => match &self.threads {
                Some(pool) => {
                    pool.submit(request).await?;
                    Ok(Dispatched::Submitted)
                }
                None => Ok(Dispatched::Completed(self.execute_inline(request).await)),
            },
        }
    }

    async fn execute_inline(&self, request: DispatchRequest) -> Outcome {
        request.execute(WorkerSlot::Caller, &self.caller_output).await
    }

    /// Poll repeatedly until `shutdown` resolves, then shut down
    ///
    /// `shutdown` only interrupts the receive long-poll or the pause after a
    /// receive error. A batch already received is always dispatched in full,
    /// so no handled message loses its delete. Receive errors are logged and
    /// retried after a short pause.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let received = tokio::select! {
                _ = &mut shutdown => {
                    info!(queue = %self.queue_name, "Shutdown requested");
                    break;
                }
                result = self.receive_batch() => result,
            };

            match received {
                Ok(messages) => {
                    self.dispatch_batch(messages).await;
                }
                Err(DispatchError::ShutDown) => break,
                Err(e) => {
                    error!(error = %e, "Poll failed");
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Stop the workers and wait for them
    ///
    /// Flips the liveness flag, joins worker threads in start order, then
    /// waits for isolated invocations. Work in progress is not cancelled.
    /// Calling this again is a no-op.
    #[instrument(skip(self), fields(queue = %self.queue_name))]
    pub async fn shutdown(&self) {
        let handles = self.begin_shutdown();

        if !handles.is_empty() {
            match tokio::task::spawn_blocking(move || ThreadPool::join(handles)).await {
                Ok(joined) => debug!(?joined, "Worker threads joined"),
                Err(e) => error!(error = %e, "Joining worker threads failed"),
            }
            self.report_abandoned();
        }

        if let Some(pool) = &self.isolated {
            pool.drain().await;
        }
    }

    /// Blocking variant of [`Dispatcher::shutdown`] for synchronous contexts
    ///
    /// Joins worker threads but does not wait for isolated invocations.
    pub fn shutdown_blocking(&self) {
        let handles = self.begin_shutdown();
        if !handles.is_empty() {
            let joined = ThreadPool::join(handles);
            debug!(?joined, "Worker threads joined");
            self.report_abandoned();
        }
    }

    fn begin_shutdown(&self) -> Vec<std::thread::JoinHandle<()>> {
        if self.alive.swap(false, Ordering::AcqRel) {
            info!(queue = %self.queue_name, "Shutting down dispatcher");
        }
        self.threads
            .as_ref()
            .map(ThreadPool::take_handles)
            .unwrap_or_default()
    }

    fn report_abandoned(&self) {
        if let Some(pool) = &self.threads {
            let queued = pool.queued();
            if queued > 0 {
                warn!(
                    queued,
                    "Requests left unprocessed; they will be redelivered after the visibility timeout"
                );
            }
        }
        debug!(stats = ?self.stats.snapshot(), "Dispatcher stopped");
    }
}
