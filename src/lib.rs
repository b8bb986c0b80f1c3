// batch_ingestor/src/lib.rs
// Public API of the batch ingestion engine.

pub mod auth;
pub mod cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod item;
pub mod limiter;
pub mod poller;
pub mod queue;
pub mod retry;
pub mod source;
pub mod transport;

pub use config::{BatchConfig, PollConfig, RetryPolicy, TransportConfig};
pub use error::{BatchError, Result};
pub use item::{BatchItem, BatchResult, ObjectItem, ReferenceItem};
pub use poller::{ShardReadinessPoller, ShardTarget};
pub use queue::BatchQueue;

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_CONCURRENCY: usize = 4;
