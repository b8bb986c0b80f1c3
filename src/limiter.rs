// batch_ingestor/src/limiter.rs
// Bounds the number of batch sends in flight. Extra submissions wait in FIFO order.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::{Semaphore, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{BatchError, Result};
use crate::item::{Batch, BatchResult, FailureClass, ItemError};

type RunFn = Box<dyn FnOnce(Batch,) -> BoxFuture<'static, BatchResult,> + Send,>;

struct Job {
    batch: Batch,
    run:   RunFn,
    reply: oneshot::Sender<BatchResult,>,
}

impl Job {
    fn cancel(self,) {
        debug!("Cancelling queued batch of {} items", self.batch.len());
        let error = ItemError::new("batch cancelled before it was sent", None, FailureClass::Cancelled,);
        let _ = self.reply.send(BatchResult::uniform_error(&self.batch, error, 0,),);
    }
}

/// Resolves to the result of a submitted batch.
pub struct SubmitHandle {
    rx: oneshot::Receiver<BatchResult,>,
}

impl Future for SubmitHandle {
    type Output = Result<BatchResult,>;

    fn poll(mut self: Pin<&mut Self,>, cx: &mut Context<'_,>,) -> Poll<Self::Output,> {
        Pin::new(&mut self.rx,).poll(cx,).map(|res| {
            res.map_err(|_| BatchError::Other("batch task ended without a result".to_string(),),)
        },)
    }
}

/// Worker pool with at most `capacity` concurrent sends.
///
/// Must be created inside a tokio runtime: it spawns its dispatcher task.
pub struct ConcurrencyLimiter {
    capacity:   usize,
    semaphore:  Arc<Semaphore,>,
    sender:     Mutex<Option<mpsc::UnboundedSender<Job,>,>,>,
    dispatcher: Mutex<Option<JoinHandle<(),>,>,>,
    cancel_tx:  watch::Sender<bool,>,
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize,) -> Result<Self,> {
        if capacity == 0 {
            return Err(BatchError::Configuration("concurrency must be at least 1".to_string(),),);
        }

        let semaphore = Arc::new(Semaphore::new(capacity,),);
        let (tx, rx,) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx,) = watch::channel(false,);
        let dispatcher = tokio::spawn(dispatch_loop(rx, Arc::clone(&semaphore,), cancel_rx,),);

        Ok(Self {
            capacity,
            semaphore,
            sender: Mutex::new(Some(tx,),),
            dispatcher: Mutex::new(Some(dispatcher,),),
            cancel_tx,
        },)
    }

    /// Queues `batch` to be run by `executor_fn` once a slot is free.
    pub fn submit<F, Fut,>(&self, batch: Batch, executor_fn: F,) -> Result<SubmitHandle,>
    where
        F: FnOnce(Batch,) -> Fut + Send + 'static,
        Fut: Future<Output = BatchResult,> + Send + 'static,
    {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner,);
        let sender = guard.as_ref().ok_or(BatchError::QueueClosed,)?;

        let (reply, rx,) = oneshot::channel();
        let job = Job {
            batch,
            run: Box::new(move |b| executor_fn(b,).boxed(),),
            reply,
        };
        sender.send(job,).map_err(|_| BatchError::QueueClosed,)?;
        Ok(SubmitHandle { rx, },)
    }

    pub fn capacity(&self,) -> usize {
        self.capacity
    }

    pub fn available_slots(&self,) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self,) -> usize {
        self.capacity - self.available_slots()
    }

    pub fn is_closed(&self,) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner,)
            .is_none()
    }

    /// Rejects new submissions and waits for queued and in-flight batches to finish.
    pub async fn close(&self,) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner,)
            .take();
        self.drain().await;
    }

    /// Rejects new submissions and fails every batch still waiting for a slot.
    /// Sends already on the network run to completion.
    pub async fn cancel(&self,) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner,)
            .take();
        self.cancel_tx.send_replace(true,);
        self.drain().await;
    }

    async fn drain(&self,) {
        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner,)
            .take();
        if let Some(handle,) = dispatcher {
            let _ = handle.await;
        }
        // Every permit back means nothing is in flight.
        if let Ok(permits,) = self.semaphore.acquire_many(self.capacity as u32,).await {
            drop(permits,);
        }
        info!("Concurrency limiter drained");
    }
}

async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<Job,>,
    semaphore: Arc<Semaphore,>,
    mut cancel_rx: watch::Receiver<bool,>,
) {
    while let Some(job,) = rx.recv().await {
        if *cancel_rx.borrow() {
            job.cancel();
            continue;
        }

        let permit = tokio::select! {
            biased;
            _ = cancelled(&mut cancel_rx) => None,
            permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
        };
        let Some(permit,) = permit else {
            job.cancel();
            continue;
        };

        tokio::spawn(async move {
            let _permit = permit;
            let Job { batch, run, reply, } = job;
            let _ = reply.send(run(batch,).await,);
        },);
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool,>,) {
    if rx.wait_for(|c| *c,).await.is_err() {
        std::future::pending::<(),>().await;
    }
}
