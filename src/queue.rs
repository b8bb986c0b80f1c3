// batch_ingestor/src/queue.rs
// Dynamic batch queue: accumulates items and flushes them by size, on demand or when idle.

use std::collections::BTreeMap;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::config::BatchConfig;
use crate::controller::{RetryController, summarize};
use crate::error::{BatchError, Result};
use crate::executor::RequestExecutor;
use crate::item::{Batch, BatchItem, BatchResult, ItemError, ItemKind};
use crate::limiter::ConcurrencyLimiter;
use crate::transport::Transport;

/// Resolves to the outcome of one flush.
pub struct FlushHandle {
    handle: Option<JoinHandle<BatchResult,>,>,
}

impl FlushHandle {
    fn ready() -> Self {
        Self { handle: None, }
    }
}

impl Future for FlushHandle {
    type Output = Result<BatchResult,>;

    fn poll(mut self: Pin<&mut Self,>, cx: &mut Context<'_,>,) -> Poll<Self::Output,> {
        match self.handle.as_mut() {
            None => Poll::Ready(Ok(BatchResult::empty(),),),
            Some(handle,) => Pin::new(handle,).poll(cx,).map(join_result,),
        }
    }
}

fn join_result(res: std::result::Result<BatchResult, tokio::task::JoinError,>,) -> Result<BatchResult,> {
    res.map_err(|e| BatchError::Other(format!("flush task failed: {}", e),),)
}

#[derive(Default,)]
struct QueueState {
    pending:       BTreeMap<u64, BatchItem,>,
    next_sequence: u64,
    closed:        bool,
    last_add:      Option<Instant,>,
    auto_flushes:  Vec<JoinHandle<(),>,>,
    flush_count:   u64,
}

struct QueueInner {
    config:     BatchConfig,
    controller: Arc<RetryController,>,
    limiter:    Arc<ConcurrencyLimiter,>,
    state:      Mutex<QueueState,>,
    activity:   Arc<Notify,>,
    /// Finished automatic flushes: failures in full, successes only counted.
    completed:  Arc<Mutex<BatchResult,>,>,
}

impl QueueInner {
    fn lock_state(&self,) -> MutexGuard<'_, QueueState,> {
        lock(&self.state,)
    }

    /// Moves every pending item into a flush task. Called with the state lock held; only spawns.
    fn start_flush(&self, state: &mut QueueState,) -> Option<JoinHandle<BatchResult,>,> {
        if state.pending.is_empty() {
            return None;
        }
        let items = mem::take(&mut state.pending,);
        state.flush_count += 1;
        debug!("Flushing {} items", items.len());

        let controller = Arc::clone(&self.controller,);
        let max_batch_size = self.config.max_batch_size;
        Some(tokio::spawn(run_flush(controller, items, max_batch_size,),),)
    }

    /// Starts a flush nobody awaits directly. Its result is compacted into `completed` as soon
    /// as it finishes, so a long stream of adds only retains failures.
    fn start_auto_flush(&self, state: &mut QueueState,) {
        let Some(flush,) = self.start_flush(state,) else {
            return;
        };
        state.auto_flushes.retain(|h| !h.is_finished(),);

        let completed = Arc::clone(&self.completed,);
        state.auto_flushes.push(tokio::spawn(async move {
            match flush.await {
                Ok(mut result,) => {
                    result.compact();
                    lock(&completed,).merge(result,);
                },
                Err(e,) => error!("Automatic flush failed: {}", e),
            }
        },),);
    }

    fn take_completed(&self,) -> BatchResult {
        mem::take(&mut *lock(&self.completed,),)
    }
}

fn lock<T,>(mutex: &Mutex<T,>,) -> MutexGuard<'_, T,> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner,)
}

/// Sends objects before references so references can point at objects from the same flush.
async fn run_flush(
    controller: Arc<RetryController,>,
    items: BTreeMap<u64, BatchItem,>,
    max_batch_size: usize,
) -> BatchResult {
    let (objects, references,): (BTreeMap<_, _,>, BTreeMap<_, _,>,) = items
        .into_iter()
        .partition(|(_, item,)| item.kind() == ItemKind::Object,);

    let mut result = BatchResult::empty();
    for group in [objects, references,] {
        if group.is_empty() {
            continue;
        }
        match Batch::check(&group, max_batch_size,) {
            Ok(kind,) => result.merge(controller.run(Batch::from_checked(kind, group,),).await,),
            Err(e,) => {
                error!("Rejecting {} items without sending: {}", group.len(), e);
                result.merge(BatchResult::rejected(group, ItemError::from_batch_error(&e,),),);
            },
        }
    }

    let (ok, failed,) = summarize(&result,);
    info!("Flush finished: {} succeeded, {} failed", ok, failed);
    result
}

/// Accepts items from any number of callers and sends them in bounded batches.
///
/// Must be used inside a tokio runtime.
pub struct BatchQueue {
    inner: Arc<QueueInner,>,
}

impl BatchQueue {
    pub fn new(executor: RequestExecutor, config: BatchConfig,) -> Result<Self,> {
        config.validate()?;

        let limiter = Arc::new(ConcurrencyLimiter::new(config.concurrency,)?,);
        let executor = executor.with_consistency_level(config.consistency_level,);
        let controller = Arc::new(RetryController::new(
            executor,
            Arc::clone(&limiter,),
            config.retry,
        ),);
        let activity = Arc::new(Notify::new(),);

        let inner = Arc::new(QueueInner {
            config,
            controller,
            limiter,
            state: Mutex::new(QueueState::default(),),
            activity: Arc::clone(&activity,),
            completed: Arc::new(Mutex::new(BatchResult::empty(),),),
        },);

        if let Some(idle,) = inner.config.idle_timeout {
            tokio::spawn(idle_watcher(Arc::downgrade(&inner,), activity, idle,),);
        }

        Ok(Self { inner, },)
    }

    pub fn with_transport(transport: Arc<dyn Transport,>, config: BatchConfig,) -> Result<Self,> {
        Self::new(RequestExecutor::new(transport,), config,)
    }

    /// Queues `item` and returns its sequence number. Flushes automatically at `max_batch_size`.
    pub fn add(&self, item: impl Into<BatchItem,>,) -> Result<u64,> {
        let item = item.into();
        let mut state = self.inner.lock_state();
        if state.closed {
            return Err(BatchError::QueueClosed,);
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.pending.insert(sequence, item,);
        state.last_add = Some(Instant::now(),);

        if state.pending.len() >= self.inner.config.max_batch_size {
            self.inner.start_auto_flush(&mut state,);
        }
        drop(state,);

        self.inner.activity.notify_one();
        Ok(sequence,)
    }

    /// Adds every item, stopping at the first error.
    pub fn add_all<I,>(&self, items: I,) -> Result<Vec<u64,>,>
    where
        I: IntoIterator,
        I::Item: Into<BatchItem,>,
    {
        items.into_iter().map(|item| self.add(item,),).collect()
    }

    /// Sends whatever is pending. An empty queue yields an already completed empty result.
    pub fn flush(&self,) -> FlushHandle {
        let mut state = self.inner.lock_state();
        match self.inner.start_flush(&mut state,) {
            Some(handle,) => FlushHandle {
                handle: Some(handle,),
            },
            None => FlushHandle::ready(),
        }
    }

    /// Waits for the automatic flushes started so far and returns their merged results.
    /// Successful items are only counted; failures are listed in full.
    pub async fn drain_completed(&self,) -> Result<BatchResult,> {
        let handles = mem::take(&mut self.inner.lock_state().auto_flushes,);
        join_all(handles,).await;
        Ok(self.inner.take_completed(),)
    }

    /// Stops accepting items, flushes the remainder and waits for all outstanding work.
    /// Later calls return an empty result.
    pub async fn close(&self,) -> Result<BatchResult,> {
        let (auto, last,) = {
            let mut state = self.inner.lock_state();
            let already_closed = state.closed;
            state.closed = true;
            let auto = mem::take(&mut state.auto_flushes,);
            let last = self.inner.start_flush(&mut state,);
            if !already_closed {
                info!(
                    "Closing batch queue with {} outstanding flushes",
                    auto.len() + usize::from(last.is_some())
                );
            }
            (auto, last,)
        };
        self.inner.activity.notify_one();

        join_all(auto,).await;
        let mut result = self.inner.take_completed();
        if let Some(last,) = last {
            match join_result(last.await,) {
                Ok(last,) => result.merge(last,),
                Err(e,) => {
                    self.inner.limiter.close().await;
                    return Err(e,);
                },
            }
        }
        self.inner.limiter.close().await;
        Ok(result,)
    }

    pub fn is_closed(&self,) -> bool {
        self.inner.lock_state().closed
    }

    pub fn pending_len(&self,) -> usize {
        self.inner.lock_state().pending.len()
    }

    /// Number of flushes started, automatic and explicit.
    pub fn flush_count(&self,) -> u64 {
        self.inner.lock_state().flush_count
    }

    pub fn config(&self,) -> &BatchConfig {
        &self.inner.config
    }

    pub fn limiter(&self,) -> &ConcurrencyLimiter {
        &self.inner.limiter
    }
}

impl Drop for BatchQueue {
    fn drop(&mut self,) {
        // Wakes the idle watcher so it notices the queue is gone.
        self.inner.activity.notify_one();
    }
}

async fn idle_watcher(inner: Weak<QueueInner,>, activity: Arc<Notify,>, idle: Duration,) {
    loop {
        let deadline = {
            let Some(inner,) = inner.upgrade() else {
                return;
            };
            let mut state = inner.lock_state();
            if state.closed {
                return;
            }
            match state.last_add {
                Some(last,) if !state.pending.is_empty() => {
                    let deadline = last + idle;
                    if Instant::now() >= deadline {
                        debug!("Queue idle for {:?}, flushing", idle);
                        inner.start_auto_flush(&mut state,);
                        None
                    } else {
                        Some(deadline,)
                    }
                },
                _ => None,
            }
        };

        match deadline {
            Some(deadline,) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {},
                    _ = activity.notified() => {},
                }
            },
            None => activity.notified().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use super::*;
    use crate::item::{ObjectItem, ReferenceItem};
    use crate::transport::RawResponse;

    /// Accepts everything and records each request body.
    #[derive(Default)]
    struct Recorder {
        calls:  AtomicUsize,
        bodies: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn post(&self, path: &str, body: &Value) -> Result<RawResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.bodies.lock().unwrap().push((path.to_string(), body.clone()));
            let n = body
                .get("objects")
                .or(Some(body))
                .and_then(Value::as_array)
                .map(|a| a.len())
                .unwrap_or(0);
            let entries: Vec<Value> = (0..n).map(|_| json!({ "result": {} })).collect();
            Ok(RawResponse::json_body(200, &Value::Array(entries)))
        }

        async fn get(&self, _: &str) -> Result<RawResponse> {
            Ok(RawResponse::new(404, ""))
        }
    }

    fn config(max_batch_size: usize, idle: Option<Duration>) -> BatchConfig {
        let mut config = BatchConfig::default();
        config.max_batch_size = max_batch_size;
        config.idle_timeout = idle;
        config.retry.jitter = 0.0;
        config
    }

    fn object(n: u64) -> ObjectItem {
        ObjectItem::new("doc", json!({ "n": n })).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn size_threshold_flushes_exactly_once() {
        let transport = Arc::new(Recorder::default());
        let queue = BatchQueue::with_transport(transport.clone(), config(3, None)).unwrap();

        assert_eq!(queue.add(object(0)).unwrap(), 0);
        assert_eq!(queue.add(object(1)).unwrap(), 1);
        assert_eq!(queue.flush_count(), 0);
        assert_eq!(queue.add(object(2)).unwrap(), 2);

        assert_eq!(queue.flush_count(), 1);
        assert_eq!(queue.pending_len(), 0);

        let result = queue.drain_completed().await.unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result.success_count(), 3);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        let bodies = transport.bodies.lock().unwrap();
        assert_eq!(bodies[0].1["objects"].as_array().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn no_flush_below_threshold_without_idle_timeout() {
        let transport = Arc::new(Recorder::default());
        let queue = BatchQueue::with_transport(transport.clone(), config(5, None)).unwrap();

        for n in 0..4 {
            queue.add(object(n)).unwrap();
        }
        tokio::time::sleep(Duration::from_secs(3600)).await;

        assert_eq!(queue.flush_count(), 0);
        assert_eq!(queue.pending_len(), 4);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_flushes_pending_items() {
        let transport = Arc::new(Recorder::default());
        let queue = BatchQueue::with_transport(
            transport.clone(),
            config(100, Some(Duration::from_millis(500))),
        )
        .unwrap();

        queue.add(object(0)).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        queue.add(object(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        // 300ms since the last add: still waiting.
        assert_eq!(queue.flush_count(), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(queue.flush_count(), 1);
        assert_eq!(queue.drain_completed().await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_flush_and_empty_flush() {
        let transport = Arc::new(Recorder::default());
        let queue = BatchQueue::with_transport(transport.clone(), config(10, None)).unwrap();

        assert!(queue.flush().await.unwrap().is_empty());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);

        queue.add(object(0)).unwrap();
        queue.add(object(1)).unwrap();
        let result = queue.flush().await.unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn objects_go_before_references() {
        let transport = Arc::new(Recorder::default());
        let queue = BatchQueue::with_transport(transport.clone(), config(10, None)).unwrap();

        let from = object(0).with_generated_id();
        let to = object(1).with_generated_id();
        let reference = ReferenceItem::new(
            "doc",
            &from.id().unwrap().to_string(),
            "links",
            "doc",
            &to.id().unwrap().to_string(),
        )
        .unwrap();

        queue.add(reference).unwrap();
        queue.add(from).unwrap();
        queue.add(to).unwrap();

        let result = queue.flush().await.unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result.iter().map(|r| r.sequence).collect::<Vec<_>>(), vec![0, 1, 2]);

        let bodies = transport.bodies.lock().unwrap();
        assert_eq!(bodies.len(), 2);
        assert!(bodies[0].0.starts_with(crate::executor::OBJECTS_PATH));
        assert!(bodies[1].0.starts_with(crate::executor::REFERENCES_PATH));
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent_and_rejects_adds() {
        let transport = Arc::new(Recorder::default());
        let queue = BatchQueue::with_transport(transport.clone(), config(2, None)).unwrap();

        for n in 0..5 {
            queue.add(object(n)).unwrap();
        }
        let result = queue.close().await.unwrap();
        assert_eq!(result.len(), 5);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);

        assert!(matches!(queue.add(object(9)), Err(BatchError::QueueClosed)));
        assert!(queue.close().await.unwrap().is_empty());
        assert!(queue.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_adders_never_double_send() {
        let transport = Arc::new(Recorder::default());
        let queue = Arc::new(BatchQueue::with_transport(transport.clone(), config(7, None)).unwrap());

        let mut tasks = Vec::new();
        for worker in 0..4u64 {
            let queue = Arc::clone(&queue);
            tasks.push(tokio::spawn(async move {
                for n in 0..25 {
                    queue.add(object(worker * 100 + n)).unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let result = queue.close().await.unwrap();
        assert_eq!(result.len(), 100);
        let sent: usize = transport
            .bodies
            .lock()
            .unwrap()
            .iter()
            .map(|(_, b)| b["objects"].as_array().unwrap().len())
            .sum();
        assert_eq!(sent, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn automatic_flushes_retain_only_failures() {
        let transport = Arc::new(Recorder::default());
        let queue = BatchQueue::with_transport(transport.clone(), config(10, None)).unwrap();

        for n in 0..5000 {
            queue.add(object(n)).unwrap();
        }
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 500);

        // Finished flushes are folded away; the next one prunes their handles.
        assert_eq!(queue.inner.completed.lock().unwrap().retained_len(), 0);
        for n in 5000..5010 {
            queue.add(object(n)).unwrap();
        }
        assert_eq!(queue.inner.lock_state().auto_flushes.len(), 1);

        let result = queue.drain_completed().await.unwrap();
        assert_eq!(result.len(), 5010);
        assert_eq!(result.success_count(), 5010);
        assert_eq!(result.retained_len(), 0);
        assert!(queue.drain_completed().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_groups_fail_instead_of_vanishing() {
        let transport = Arc::new(Recorder::default());
        let queue = BatchQueue::with_transport(transport.clone(), config(2, None)).unwrap();

        let items: BTreeMap<u64, BatchItem> =
            (0..3).map(|n| (n, BatchItem::from(object(n)))).collect();
        let result = run_flush(Arc::clone(&queue.inner.controller), items, 2).await;

        assert_eq!(result.len(), 3);
        assert_eq!(result.failure_count(), 3);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            result.get(1).unwrap().outcome.error().unwrap().class,
            crate::item::FailureClass::Validation
        );
    }
}

