//! Batching write worker
//!
//! Serializes all writes of a store through one task:
//!
//! - **Idle**: a submission is picked up and written at once
//! - **Busy**: submissions accumulate in the open batch, bounded by
//!   `max_pending` models; a full buffer makes submitters wait
//! - **Flush**: when the in-flight write completes, everything accumulated is
//!   written as one batch
//!
//! Every batch has one write-once completion value broadcast to all of its
//! waiters. Each waiter knows the range of outputs that belongs to it.
//! A waiter that stops waiting does not affect the batch, and a failed batch
//! does not stop the worker.

use crate::metrics::Metrics;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Persists one batch of models atomically
#[async_trait]
pub trait BatchWriter: Send + 'static {
    /// Submitted unit of work
    type Model: Send + 'static;

    /// Result for one model
    type Output: Clone + Send + Sync + 'static;

    /// Write all models or none; outputs are returned in model order
    async fn write(&mut self, models: Vec<Self::Model>) -> Result<Vec<Self::Output>>;
}

/// Completion value of a batch: unset until the write finishes
type Outcome<O> = Option<Result<Arc<[O]>>>;

struct OpenBatch<M, O> {
    models: Vec<M>,
    completion: watch::Sender<Outcome<O>>,
    permits: Vec<OwnedSemaphorePermit>,
}

impl<M, O> OpenBatch<M, O> {
    fn new() -> Self {
        let (completion, _) = watch::channel(None);
        Self {
            models: Vec::new(),
            completion,
            permits: Vec::new(),
        }
    }

    fn has_waiters(&self) -> bool {
        !self.models.is_empty() || self.completion.receiver_count() > 0
    }
}

struct Shared<M, O> {
    open: Mutex<OpenBatch<M, O>>,
    wake: Notify,
    capacity: Option<Arc<Semaphore>>,
    max_pending: usize,
    closed: AtomicBool,
    metrics: Arc<Metrics>,
}

impl<M, O> Shared<M, O> {
    /// Swap out the open batch if anyone is waiting on it
    fn take(&self) -> Option<OpenBatch<M, O>> {
        let mut open = self.open.lock();
        if !open.has_waiters() {
            return None;
        }
        self.metrics.pending_models.set(0);
        Some(std::mem::replace(&mut *open, OpenBatch::new()))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Fails whatever is still open once the worker task ends, even by panic
struct FailOpenOnExit<M, O>(Arc<Shared<M, O>>);

impl<M, O> Drop for FailOpenOnExit<M, O> {
    fn drop(&mut self) {
        self.0.closed.store(true, Ordering::Release);
        let open = std::mem::replace(&mut *self.0.open.lock(), OpenBatch::new());
        open.completion.send_replace(Some(Err(Error::Concurrency(
            "write worker stopped".to_string(),
        ))));
    }
}

/// Handle on a submission; resolves when its batch is written
#[derive(Debug)]
pub struct Receipt<O> {
    rx: watch::Receiver<Outcome<O>>,
    range: Range<usize>,
}

impl<O: Clone> Receipt<O> {
    /// Wait for the batch and return this submission's outputs
    pub async fn wait(mut self) -> Result<Vec<O>> {
        let outcome = self
            .rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Concurrency("write worker stopped".to_string()))?;

        match outcome.as_ref() {
            Some(Ok(outputs)) => Ok(outputs[self.range.clone()].to_vec()),
            Some(Err(err)) => Err(err.clone()),
            None => Err(Error::Concurrency("batch completed without outcome".to_string())),
        }
    }
}

/// Largest usable `max_pending`; one submission may hold that many permits
pub const MAX_PENDING_LIMIT: usize = if Semaphore::MAX_PERMITS < u32::MAX as usize {
    Semaphore::MAX_PERMITS
} else {
    u32::MAX as usize
};

/// Single-writer batching worker
pub struct WriteWorker<M, O> {
    shared: Arc<Shared<M, O>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<M, O> std::fmt::Debug for WriteWorker<M, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteWorker")
            .field("max_pending", &self.shared.max_pending)
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

impl<M, O> WriteWorker<M, O>
where
    M: Send + 'static,
    O: Clone + Send + Sync + 'static,
{
    /// Spawn the worker task; `max_pending == 0` means unbounded
    ///
    /// Larger values than [`MAX_PENDING_LIMIT`] are lowered to it.
    pub fn spawn<W>(writer: W, max_pending: usize, metrics: Arc<Metrics>) -> Self
    where
        W: BatchWriter<Model = M, Output = O>,
    {
        let max_pending = max_pending.min(MAX_PENDING_LIMIT);
        let capacity = (max_pending > 0).then(|| Arc::new(Semaphore::new(max_pending)));
        let shared = Arc::new(Shared {
            open: Mutex::new(OpenBatch::new()),
            wake: Notify::new(),
            capacity,
            max_pending,
            closed: AtomicBool::new(false),
            metrics,
        });

        let task = tokio::spawn(run(shared.clone(), writer));
        info!(max_pending, "Write worker started");

        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    /// Enqueue models; waits while the pending buffer is full
    pub async fn submit(&self, models: Vec<M>) -> Result<Receipt<O>> {
        if self.shared.is_closed() {
            return Err(Error::Concurrency("write worker stopped".to_string()));
        }

        let permit = match (&self.shared.capacity, models.is_empty()) {
            (Some(capacity), false) => {
                // Oversized submissions take the whole buffer instead of deadlocking
                let wanted = u32::try_from(models.len().min(self.shared.max_pending))
                    .map_err(|_| Error::Concurrency("submission exceeds buffer".to_string()))?;
                let permit = capacity
                    .clone()
                    .acquire_many_owned(wanted)
                    .await
                    .map_err(|_| Error::Concurrency("write worker stopped".to_string()))?;
                Some(permit)
            }
            _ => None,
        };

        let receipt = {
            let mut open = self.shared.open.lock();
            if self.shared.is_closed() {
                return Err(Error::Concurrency("write worker stopped".to_string()));
            }
            let start = open.models.len();
            open.models.extend(models);
            open.permits.extend(permit);
            self.shared.metrics.pending_models.set(open.models.len() as i64);
            Receipt {
                rx: open.completion.subscribe(),
                range: start..open.models.len(),
            }
        };

        self.shared.wake.notify_one();
        Ok(receipt)
    }

    /// Submit and wait for the outputs
    pub async fn write(&self, models: Vec<M>) -> Result<Vec<O>> {
        self.submit(models).await?.wait().await
    }

    /// Whether the worker stopped accepting work
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Stop accepting work, flush what is pending and wait for the task
    pub async fn shutdown(&self) {
        self.shared.close();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, "Write worker task failed");
            }
        }
    }
}

impl<M, O> Drop for WriteWorker<M, O> {
    fn drop(&mut self) {
        self.shared.close();
    }
}

async fn run<W: BatchWriter>(shared: Arc<Shared<W::Model, W::Output>>, mut writer: W) {
    let _guard = FailOpenOnExit(shared.clone());

    loop {
        let batch = loop {
            if let Some(batch) = shared.take() {
                break Some(batch);
            }
            if shared.is_closed() {
                break None;
            }
            shared.wake.notified().await;
        };
        let Some(OpenBatch {
            models,
            completion,
            permits,
        }) = batch
        else {
            break;
        };

        // New submissions may fill the buffer while this batch is written
        drop(permits);

        let size = models.len();
        shared.metrics.record_batch_flush(size);
        debug!(batch_size = size, "Writing batch");

        let outcome = if size == 0 {
            Ok(Arc::from(Vec::new()))
        } else {
            match writer.write(models).await {
                Ok(outputs) if outputs.len() == size => Ok(Arc::from(outputs)),
                Ok(outputs) => Err(Error::Concurrency(format!(
                    "writer returned {} outputs for {} models",
                    outputs.len(),
                    size
                ))),
                Err(err) => {
                    warn!(batch_size = size, error = %err, "Write batch failed");
                    Err(err)
                }
            }
        };

        completion.send_replace(Some(outcome));
    }

    info!("Write worker stopped");
}
