// batch_ingestor/src/poller.rs
// Waits for shards with asynchronous vector indexing to drain their queues.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::PollConfig;
use crate::error::{BatchError, Result};
use crate::item::normalize_collection_name;
use crate::retry::{execute_with_retry, unbounded_backoff, wrap_error};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize,)]
#[serde(rename_all = "UPPERCASE")]
pub enum ShardStatus {
    Ready,
    Indexing,
    Readonly,
    #[serde(other)]
    Unknown,
}

/// One shard as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize,)]
pub struct Shard {
    pub name:              String,
    pub status:            ShardStatus,
    #[serde(rename = "vectorQueueSize", default)]
    pub vector_queue_size: u64,
}

impl Shard {
    pub fn is_ready(&self,) -> bool {
        self.status == ShardStatus::Ready && self.vector_queue_size == 0
    }
}

/// The shards of one collection (and tenant) to wait for.
#[derive(Debug, Clone, PartialEq, Eq,)]
pub struct ShardTarget {
    collection: String,
    tenant:     Option<String,>,
    names:      Option<Vec<String,>,>,
}

impl ShardTarget {
    /// Every shard of `collection`.
    pub fn collection(collection: &str,) -> Result<Self,> {
        Ok(Self {
            collection: normalize_collection_name(collection,)?,
            tenant:     None,
            names:      None,
        },)
    }

    pub fn tenant(mut self, tenant: impl Into<String,>,) -> Self {
        self.tenant = Some(tenant.into(),);
        self
    }

    /// Restricts the wait to the named shards.
    pub fn shards<I, S,>(mut self, names: I,) -> Self
    where
        I: IntoIterator<Item = S,>,
        S: Into<String,>,
    {
        self.names = Some(names.into_iter().map(Into::into,).collect(),);
        self
    }

    pub fn path(&self,) -> String {
        let base = format!("/v1/schema/{}/shards", self.collection);
        match &self.tenant {
            Some(tenant,) => {
                let encoded: String = url::form_urlencoded::byte_serialize(tenant.as_bytes(),).collect();
                format!("{}?tenant={}", base, encoded)
            },
            None => base,
        }
    }

    /// Describes every selected shard that is not ready yet.
    pub fn not_ready(&self, shards: &[Shard],) -> Vec<String,> {
        let label = |name: &str| match &self.tenant {
            Some(t,) => format!("{}[{}]/{}", self.collection, t, name),
            None => format!("{}/{}", self.collection, name),
        };

        match &self.names {
            Some(names,) => names
                .iter()
                .filter_map(|name| match shards.iter().find(|s| &s.name == name,) {
                    None => Some(format!("{} missing", label(name,)),),
                    Some(s,) if !s.is_ready() => Some(format!(
                        "{} {:?} queue={}",
                        label(name,),
                        s.status,
                        s.vector_queue_size
                    ),),
                    Some(_,) => None,
                },)
                .collect(),
            None => shards
                .iter()
                .filter(|s| !s.is_ready(),)
                .map(|s| format!("{} {:?} queue={}", label(&s.name,), s.status, s.vector_queue_size),)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq,)]
pub struct PollReport {
    /// Poll cycles performed, the successful one included.
    pub polls:   u32,
    pub elapsed: Duration,
}

pub struct ShardReadinessPoller {
    transport: Arc<dyn Transport,>,
}

impl ShardReadinessPoller {
    pub fn new(transport: Arc<dyn Transport,>,) -> Self {
        Self { transport, }
    }

    /// Fetches the current status of the shards behind `target`.
    pub async fn fetch_shards(&self, target: &ShardTarget,) -> Result<Vec<Shard,>,> {
        let response = self.transport.get(&target.path(),).await?.error_for_status()?;
        serde_json::from_slice(&response.body,).map_err(|e| {
            BatchError::TransientTransport(format!("Failed to decode shard status: {}", e),)
        },)
    }

    /// Single status fetch; transient failures are retried until they succeed.
    async fn fetch_with_retry(&self, target: &ShardTarget, interval: Duration,) -> Result<Vec<Shard,>,> {
        let backoff = unbounded_backoff(interval, interval * 8,);
        execute_with_retry(backoff, || async { self.fetch_shards(target,).await.map_err(wrap_error,) },)
            .await
    }

    pub async fn wait(&self, targets: &[ShardTarget], config: &PollConfig,) -> Result<PollReport,> {
        self.wait_for_ready(targets, config.timeout, config.poll_interval,)
            .await
    }

    /// Polls until every target shard is READY with an empty vector queue, or `timeout` passes.
    pub async fn wait_for_ready(
        &self,
        targets: &[ShardTarget],
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<PollReport,> {
        if poll_interval.is_zero() {
            return Err(BatchError::Configuration("poll_interval must be positive".to_string(),),);
        }

        let started = Instant::now();
        let mut polls = 0u32;
        let mut waiting_on: Vec<String,> = Vec::new();

        let outcome = tokio::time::timeout(timeout, async {
            loop {
                polls += 1;
                let mut pending = Vec::new();
                for target in targets {
                    let shards = self.fetch_with_retry(target, poll_interval,).await?;
                    pending.extend(target.not_ready(&shards,),);
                }

                if pending.is_empty() {
                    return Ok::<(), BatchError,>((),);
                }
                debug!("Poll {}: {} shards not ready", polls, pending.len());
                waiting_on = pending;
                tokio::time::sleep(poll_interval,).await;
            }
        },)
        .await;

        let elapsed = started.elapsed();
        match outcome {
            Ok(Ok((),),) => {
                info!("Shards ready after {} polls in {:?}", polls, elapsed);
                Ok(PollReport { polls, elapsed, },)
            },
            Ok(Err(e,),) => Err(e,),
            Err(_,) => {
                let detail = if waiting_on.is_empty() {
                    "no successful status fetch".to_string()
                } else {
                    waiting_on.join(", ",)
                };
                Err(BatchError::PollTimeout { elapsed, detail, },)
            },
        }
    }
}
