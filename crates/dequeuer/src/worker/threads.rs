//! Persistent worker threads
//!
//! A fixed group of OS threads shares one bounded channel. Each thread blocks
//! on the channel for at most `dequeue_timeout`, re-checks the liveness flag
//! on every timeout, and runs claimed requests inline.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, error, info, info_span, trace};

use super::output::{WorkerOutput, WorkerSlot};
use crate::error::DispatchError;
use crate::handler::DispatchRequest;

/// Fixed-size group of worker threads fed by a bounded queue
pub struct ThreadPool {
    sender: Sender<DispatchRequest>,
    alive: Arc<AtomicBool>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    capacity: usize,
    dequeue_timeout: Duration,
}

impl ThreadPool {
    /// Start `size` worker threads
    ///
    /// Workers run while `alive` is true. `runtime` is used to settle
    /// messages (async deletes) from the worker threads.
    pub fn start(
        size: usize,
        capacity: usize,
        dequeue_timeout: Duration,
        alive: Arc<AtomicBool>,
        runtime: Handle,
    ) -> Result<Self, DispatchError> {
        let (sender, receiver) = channel::bounded(capacity);
        let mut worker_handles = Vec::with_capacity(size);

        for index in 0..size {
            let worker = Worker {
                slot: WorkerSlot::Thread(index),
                receiver: receiver.clone(),
                alive: Arc::clone(&alive),
                dequeue_timeout,
                runtime: runtime.clone(),
            };

            let handle = thread::Builder::new()
                .name(format!("dequeuer-worker-{index}"))
                .spawn(move || worker.run())
                .map_err(|e| {
                    // Already-started workers exit on their next timeout
                    alive.store(false, Ordering::SeqCst);
                    DispatchError::WorkerSpawn(e)
                })?;
            worker_handles.push(handle);
        }

        info!(threads = size, capacity, "Started worker threads");

        Ok(Self {
            sender,
            alive,
            worker_handles: Mutex::new(worker_handles),
            capacity,
            dequeue_timeout,
        })
    }

    /// Enqueue a request, waiting for a free slot when the queue is full
    pub async fn submit(&self, request: DispatchRequest) -> Result<(), DispatchError> {
        match self.sender.try_send(request) {
            Ok(()) => Ok(()),
            Err(TrySendError::Disconnected(_)) => Err(DispatchError::PoolClosed),
            Err(TrySendError::Full(request)) => {
                debug!(
                    capacity = self.capacity,
                    "Worker queue full, applying backpressure"
                );

                let sender = self.sender.clone();
                let alive = Arc::clone(&self.alive);
                let timeout = self.dequeue_timeout;

                tokio::task::spawn_blocking(move || {
                    let mut pending = request;
                    loop {
                        match sender.send_timeout(pending, timeout) {
                            Ok(()) => return Ok(()),
                            Err(SendTimeoutError::Timeout(request)) => {
                                if !alive.load(Ordering::Acquire) {
                                    return Err(DispatchError::PoolClosed);
                                }
                                pending = request;
                            }
                            Err(SendTimeoutError::Disconnected(_)) => {
                                return Err(DispatchError::PoolClosed)
                            }
                        }
                    }
                })
                .await
                .map_err(|_| DispatchError::PoolClosed)?
            }
        }
    }

    /// Number of requests waiting for a worker
    pub fn queued(&self) -> usize {
        self.sender.len()
    }

    /// Capacity of the internal queue
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of workers not yet joined
    pub fn worker_count(&self) -> usize {
        self.worker_handles.lock().len()
    }

    /// Take the worker handles, in start order
    ///
    /// Returns an empty list once the handles have been taken, which is what
    /// makes shutdown idempotent.
    pub fn take_handles(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.worker_handles.lock())
    }

    /// Join worker threads in order, logging any that panicked
    ///
    /// Returns the joined thread names in join order.
    pub fn join(handles: Vec<JoinHandle<()>>) -> Vec<String> {
        let mut joined = Vec::with_capacity(handles.len());
        for handle in handles {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                error!(thread = %name, "Worker thread panicked");
            } else {
                trace!(thread = %name, "Worker thread joined");
            }
            joined.push(name);
        }
        joined
    }
}

struct Worker {
    slot: WorkerSlot,
    receiver: Receiver<DispatchRequest>,
    alive: Arc<AtomicBool>,
    dequeue_timeout: Duration,
    runtime: Handle,
}

impl Worker {
    fn run(self) {
        let span = info_span!("worker", slot = %self.slot);
        let _entered = span.enter();
        let output = Arc::new(WorkerOutput::new(self.slot));

        debug!("Worker started");

        while self.alive.load(Ordering::Acquire) {
            trace!("Waiting for dispatch request");

            let request = match self.receiver.recv_timeout(self.dequeue_timeout) {
                Ok(request) => request,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Dispatch queue disconnected");
                    break;
                }
            };

            let request_id = request.id();
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                let outcome = request.run_handler(self.slot, &output);
                self.runtime.block_on(request.settle(outcome))
            }));

            match result {
                Ok(outcome) => trace!(%request_id, %outcome, "Request finished"),
                Err(_) => error!(%request_id, "Dispatch request panicked while settling"),
            }

            output.flush(request_id);
        }

        debug!("Worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatchStats;
    use crate::envelope::MessageEnvelope;
    use crate::handler::{handler_fn, MessageHandler};
    use crate::queue::{InMemoryQueueClient, QueueClient, RawMessage};
    use std::time::Instant;

    fn request(client: &Arc<InMemoryQueueClient>, handler: Arc<dyn MessageHandler>) -> DispatchRequest {
        let handle = client.push_body("unused");
        let raw = RawMessage::new(r#"{"Message": "{\"id\": 1}"}"#, handle);
        let queue_client: Arc<dyn QueueClient> = client.clone();
        DispatchRequest::new(
            Arc::from("threads"),
            MessageEnvelope::parse(&raw).unwrap(),
            handler,
            queue_client,
            Arc::new(DispatchStats::default()),
        )
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_workers_process_and_stop() {
        let client = Arc::new(InMemoryQueueClient::new());
        let alive = Arc::new(AtomicBool::new(true));
        let pool = ThreadPool::start(
            3,
            10,
            Duration::from_millis(50),
            alive.clone(),
            Handle::current(),
        )
        .unwrap();
        assert_eq!(pool.worker_count(), 3);

        let handler: Arc<dyn MessageHandler> = Arc::new(handler_fn(|_, _, _| Ok(())));
        for _ in 0..5 {
            pool.submit(request(&client, handler.clone())).await.unwrap();
        }

        wait_for(|| client.total_deletes() == 5).await;

        alive.store(false, Ordering::SeqCst);
        let handles = pool.take_handles();
        assert_eq!(handles.len(), 3);
        let joined = tokio::task::spawn_blocking(move || ThreadPool::join(handles))
            .await
            .unwrap();

        assert_eq!(
            joined,
            vec!["dequeuer-worker-0", "dequeuer-worker-1", "dequeuer-worker-2"]
        );
        assert!(pool.take_handles().is_empty());
        assert_eq!(pool.worker_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_queue_applies_backpressure() {
        let client = Arc::new(InMemoryQueueClient::new());
        let alive = Arc::new(AtomicBool::new(true));
        let pool = ThreadPool::start(
            1,
            1,
            Duration::from_millis(50),
            alive.clone(),
            Handle::current(),
        )
        .unwrap();

        let (release_tx, release_rx) = crossbeam::channel::unbounded::<()>();
        let handler: Arc<dyn MessageHandler> = Arc::new(handler_fn(move |_, _, _| {
            release_rx
                .recv_timeout(Duration::from_secs(5))
                .map_err(crate::handler::HandlerError::failed)
        }));

        // One request occupies the worker, one fills the queue
        pool.submit(request(&client, handler.clone())).await.unwrap();
        wait_for(|| pool.queued() == 0).await;
        pool.submit(request(&client, handler.clone())).await.unwrap();
        assert_eq!(pool.queued(), 1);

        // The third submission has to wait for a free slot
        let blocked = pool.submit(request(&client, handler.clone()));
        tokio::pin!(blocked);
        let early = tokio::time::timeout(Duration::from_millis(100), &mut blocked).await;
        assert!(early.is_err(), "submit should wait while the queue is full");
        assert!(pool.queued() <= pool.capacity());

        for _ in 0..3 {
            release_tx.send(()).unwrap();
        }
        blocked.await.unwrap();

        wait_for(|| client.total_deletes() == 3).await;

        alive.store(false, Ordering::SeqCst);
        let handles = pool.take_handles();
        tokio::task::spawn_blocking(move || ThreadPool::join(handles))
            .await
            .unwrap();
    }
}
