// batch_ingestor/src/cli.rs
// Command Line Interface (CLI) specific logic for batch_ingestor.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::config::{BatchConfig, ConsistencyLevel, PollConfig, RetryPolicy, TransportConfig};

/// Bulk loader for remote vector databases.
#[derive(Parser, Debug,)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,

    /// Exit with an error if any item fails after retries.
    #[clap(long)]
    pub strict: bool,

    /// Generate a structured summary report (ingestion_report.json) at the end.
    #[clap(long)]
    pub report: bool,
}

#[derive(Parser, Debug,)]
pub enum Commands {
    /// Load JSON-lines files as objects into a collection
    Load(LoadArgs,),
    /// Wait until the shards of a collection finish vector indexing
    Wait(WaitArgs,),
}

#[derive(Parser, Debug,)]
pub struct ConnectionArgs {
    /// Base URL of the database
    #[clap(long, env = "BATCH_INGESTOR_URL", default_value = "http://localhost:8080")]
    pub url: String,

    /// API key sent as a bearer token
    #[clap(long, env = "BATCH_INGESTOR_API_KEY")]
    pub api_key: Option<String,>,

    /// Per-request timeout in seconds
    #[clap(long, default_value_t = 60)]
    pub request_timeout_secs: u64,
}

impl ConnectionArgs {
    pub fn transport_config(&self,) -> TransportConfig {
        TransportConfig {
            base_url:        self.url.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs,),
            api_key:         self.api_key.clone(),
        }
    }
}

#[derive(Parser, Debug,)]
pub struct PollArgs {
    /// Give up waiting for indexing after this many seconds
    #[clap(long, default_value_t = 300)]
    pub wait_timeout_secs: u64,

    /// Delay between shard status polls in milliseconds
    #[clap(long, default_value_t = 250)]
    pub poll_interval_ms: u64,
}

impl PollArgs {
    pub fn poll_config(&self,) -> PollConfig {
        PollConfig {
            timeout:       Duration::from_secs(self.wait_timeout_secs,),
            poll_interval: Duration::from_millis(self.poll_interval_ms,),
        }
    }
}

#[derive(Parser, Debug,)]
pub struct LoadArgs {
    #[clap(flatten)]
    pub connection: ConnectionArgs,

    /// Path to a JSON-lines file or a directory of them
    #[clap(short, long)]
    pub path: PathBuf,

    /// Collection to load into
    #[clap(long)]
    pub collection: String,

    /// Tenant for lines without a "tenant" key
    #[clap(long)]
    pub tenant: Option<String,>,

    /// Maximum items per batch request
    #[clap(long, default_value_t = crate::DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Number of concurrent batch requests
    #[clap(short, long, default_value_t = crate::DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Flush a partial batch after this many milliseconds without new items
    #[clap(long)]
    pub idle_timeout_ms: Option<u64,>,

    /// Consistency level for writes (ONE, QUORUM, ALL)
    #[clap(long)]
    pub consistency_level: Option<ConsistencyLevel,>,

    /// Total send attempts per item
    #[clap(long, default_value_t = 3)]
    pub max_attempts: u32,

    /// First retry delay in milliseconds
    #[clap(long, default_value_t = 500)]
    pub base_backoff_ms: u64,

    /// Upper bound for retry delays in milliseconds
    #[clap(long, default_value_t = 30_000)]
    pub max_backoff_ms: u64,

    /// Fraction by which retry delays are randomly shortened
    #[clap(long, default_value_t = 0.25)]
    pub jitter: f64,

    /// Wait for asynchronous vector indexing to finish after loading
    #[clap(long)]
    pub wait_for_indexing: bool,

    #[clap(flatten)]
    pub poll: PollArgs,
}

impl LoadArgs {
    pub fn batch_config(&self,) -> BatchConfig {
        BatchConfig {
            max_batch_size:    self.batch_size,
            idle_timeout:      self.idle_timeout_ms.map(Duration::from_millis,),
            concurrency:       self.concurrency,
            consistency_level: self.consistency_level,
            retry:             RetryPolicy {
                max_attempts: self.max_attempts,
                base_backoff: Duration::from_millis(self.base_backoff_ms,),
                max_backoff:  Duration::from_millis(self.max_backoff_ms,),
                jitter:       self.jitter,
            },
        }
    }
}

#[derive(Parser, Debug,)]
pub struct WaitArgs {
    #[clap(flatten)]
    pub connection: ConnectionArgs,

    /// Collection whose shards to watch
    #[clap(long)]
    pub collection: String,

    /// Tenant of a multi-tenant collection
    #[clap(long)]
    pub tenant: Option<String,>,

    /// Only wait for these shards (comma separated)
    #[clap(long, value_delimiter = ',')]
    pub shards: Option<Vec<String,>,>,

    #[clap(flatten)]
    pub poll: PollArgs,
}
