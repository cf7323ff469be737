//! Isolated pool for fire-and-forget dispatch
//!
//! At most `capacity` invocations are admitted at once, running or waiting
//! for a slot; `submit` waits while the pool is full. Once admitted, a
//! submission returns a join handle immediately and the handler runs on
//! tokio's blocking pool under one of `size` permits, so a panicking handler
//! never reaches the polling loop. The pool is built on first submission and
//! kept for the owner's lifetime.

use std::sync::{Arc, OnceLock};

use crossbeam::queue::ArrayQueue;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use super::output::{WorkerOutput, WorkerSlot};
use crate::error::DispatchError;
use crate::handler::{DispatchRequest, Outcome};

struct PoolInner {
    admission: Arc<Semaphore>,
    permits: Arc<Semaphore>,
    free_slots: Arc<ArrayQueue<usize>>,
    tracker: TaskTracker,
}

/// Lazily-constructed pool of isolated execution slots
pub struct IsolatedPool {
    size: usize,
    capacity: usize,
    inner: OnceLock<PoolInner>,
}

impl IsolatedPool {
    /// Describe a pool of `size` slots admitting up to `capacity` invocations;
    /// nothing is allocated until first use
    pub fn new(size: usize, capacity: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            capacity: capacity.max(size),
            inner: OnceLock::new(),
        }
    }

    /// Whether the pool has been built
    pub fn is_started(&self) -> bool {
        self.inner.get().is_some()
    }

    /// Number of submitted invocations that have not finished
    pub fn in_flight(&self) -> usize {
        self.inner.get().map_or(0, |inner| inner.tracker.len())
    }

    fn inner(&self) -> &PoolInner {
        self.inner.get_or_init(|| {
            info!(slots = self.size, capacity = self.capacity, "Starting isolated pool");
            let free_slots = ArrayQueue::new(self.size);
            for slot in 0..self.size {
                let _ = free_slots.push(slot);
            }
            PoolInner {
                admission: Arc::new(Semaphore::new(self.capacity)),
                permits: Arc::new(Semaphore::new(self.size)),
                free_slots: Arc::new(free_slots),
                tracker: TaskTracker::new(),
            }
        })
    }

    /// Submit a request without waiting for it to run
    ///
    /// Waits while `capacity` invocations are already admitted. Fails with
    /// [`DispatchError::PoolClosed`] once the pool has been drained. Must be
    /// called from within a tokio runtime.
    pub async fn submit(&self, request: DispatchRequest) -> Result<JoinHandle<Outcome>, DispatchError> {
        let inner = self.inner();
        let admitted = match Arc::clone(&inner.admission).try_acquire_owned() {
            Ok(admitted) => admitted,
            Err(TryAcquireError::Closed) => return Err(DispatchError::PoolClosed),
            Err(TryAcquireError::NoPermits) => {
                debug!(capacity = self.capacity, "Isolated pool full, applying backpressure");
                Arc::clone(&inner.admission)
                    .acquire_owned()
                    .await
                    .map_err(|_| DispatchError::PoolClosed)?
            }
        };
        let permits = Arc::clone(&inner.permits);
        let free_slots = Arc::clone(&inner.free_slots);

        Ok(inner.tracker.spawn(async move {
            let _admitted = admitted;
            let request_id = request.id();
            let Ok(_permit) = permits.acquire_owned().await else {
                error!(%request_id, "Isolated pool closed before the request ran");
                return Outcome::Failed;
            };
            // A permit guarantees a free slot
            let index = free_slots.pop().unwrap_or_default();
            let slot = WorkerSlot::Isolated(index);
            let output = Arc::new(WorkerOutput::new(slot));

            let handler_output = Arc::clone(&output);
            let joined = tokio::task::spawn_blocking(move || {
                let outcome = request.run_handler(slot, &handler_output);
                (request, outcome)
            })
            .await;

            let outcome = match joined {
                Ok((request, outcome)) => request.settle(outcome).await,
                Err(e) => {
                    error!(%request_id, error = %e, "Isolated invocation aborted");
                    Outcome::Failed
                }
            };

            output.flush(request_id);
            let _ = free_slots.push(index);
            outcome
        }))
    }

    /// Refuse new submissions and wait for every admitted invocation
    pub async fn drain(&self) {
        if let Some(inner) = self.inner.get() {
            inner.admission.close();
            inner.tracker.close();
            if !inner.tracker.is_empty() {
                debug!(in_flight = inner.tracker.len(), "Waiting for isolated invocations");
            }
            inner.tracker.wait().await;
        }
    }
}
