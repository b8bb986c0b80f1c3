// batch_ingestor/src/main.rs
// Main entry point for the batch-ingestor CLI application.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use batch_ingestor::cli::{Cli, Commands, LoadArgs, WaitArgs};
use batch_ingestor::error::{BatchError, Result};
use batch_ingestor::item::BatchResult;
use batch_ingestor::poller::{ShardReadinessPoller, ShardTarget};
use batch_ingestor::queue::BatchQueue;
use batch_ingestor::source::{ObjectReader, collect_files};
use batch_ingestor::transport::{HttpTransport, Transport};
use clap::Parser;
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Serialize,)]
struct ItemFailure {
    source: String,
    error:  String,
    status: Option<u16,>,
}

#[derive(Serialize, Default,)]
struct Report {
    total_files:   usize,
    total_items:   usize,
    success_count: usize,
    failure_count: usize,
    errors:        Vec<ItemFailure,>,
}

struct ProcessingRegistry {
    report: Mutex<Report,>,
}

impl ProcessingRegistry {
    fn new() -> Self {
        Self {
            report: Mutex::new(Report::default(),),
        }
    }

    fn lock(&self,) -> std::sync::MutexGuard<'_, Report,> {
        self.report
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner,)
    }

    fn record_file(&self,) {
        self.lock().total_files += 1;
    }

    fn record_error(&self, source: String, err: String, status: Option<u16,>,) {
        error!("Error at {}: {}", source, err);
        let mut report = self.lock();
        report.total_items += 1;
        report.failure_count += 1;
        report.errors.push(ItemFailure {
            source,
            error: err,
            status,
        },);
    }

    /// `sources` maps the first sequence number of each file to its path.
    fn record_results(&self, result: &BatchResult, sources: &BTreeMap<u64, String,>,) {
        {
            let mut report = self.lock();
            report.total_items += result.success_count();
            report.success_count += result.success_count();
        }
        for item in result.failures() {
            let Some(e,) = item.outcome.error() else {
                continue;
            };
            let source = match sources.range(..=item.sequence,).next_back() {
                Some((first, file,),) => format!("{}#{}", file, item.sequence - first + 1),
                None => format!("item #{}", item.sequence),
            };
            self.record_error(
                source,
                format!("{} (after {} attempts)", e.message, item.attempts),
                e.status_code,
            );
        }
    }

    fn failure_count(&self,) -> usize {
        self.lock().failure_count
    }

    fn save_report(&self,) -> Result<(),> {
        let report = self.lock();
        let json = serde_json::to_string_pretty(&*report,).map_err(|e| {
            BatchError::Other(format!("Failed to serialize ingestion report: {}", e),)
        },)?;
        std::fs::write("ingestion_report.json", json,).map_err(|e| {
            BatchError::Other(format!("Failed to write ingestion_report.json: {}", e),)
        },)?;
        info!("Ingestion report saved to ingestion_report.json");
        Ok((),)
    }
}

#[tokio::main]
async fn main() -> Result<(),> {
    let file_appender = tracing_appender::rolling::never(".", "batch-ingestor.log",);
    let (non_blocking, _guard,) = tracing_appender::non_blocking(file_appender,);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info",),),)
        .with(fmt::layer().with_writer(std::io::stderr,),)
        .with(fmt::layer().with_writer(non_blocking,).with_ansi(false,),)
        .init();

    let cli = Cli::parse();
    let registry = Arc::new(ProcessingRegistry::new(),);

    let res = match &cli.command {
        Commands::Load(args,) => handle_load(args, Arc::clone(&registry,),).await,
        Commands::Wait(args,) => handle_wait(args,).await,
    };

    if cli.report {
        registry.save_report()?;
    }
    res?;

    let failures = registry.failure_count();
    if cli.strict && failures > 0 {
        return Err(BatchError::Other(format!(
            "Strict mode enabled: {} items failed",
            failures
        ),),);
    }
    Ok((),)
}

async fn handle_load(args: &LoadArgs, registry: Arc<ProcessingRegistry,>,) -> Result<(),> {
    let transport: Arc<dyn Transport,> =
        Arc::new(HttpTransport::new(&args.connection.transport_config(),)?,);
    let queue = BatchQueue::with_transport(Arc::clone(&transport,), args.batch_config(),)?;

    let files = collect_files(&args.path,)?;
    info!(
        "Found {} files to load into {} with concurrency {}",
        files.len(),
        args.collection,
        args.concurrency
    );

    let mut sources = BTreeMap::new();
    for file in &files {
        registry.record_file();
        if let Err(e,) = load_file(file, args, &queue, &registry, &mut sources,).await {
            registry.record_error(file.display().to_string(), e.to_string(), None,);
        }
    }

    let remainder = queue.close().await?;
    registry.record_results(&remainder, &sources,);

    if args.wait_for_indexing {
        let mut target = ShardTarget::collection(&args.collection,)?;
        if let Some(tenant,) = &args.tenant {
            target = target.tenant(tenant.clone(),);
        }
        let poller = ShardReadinessPoller::new(transport,);
        let report = poller.wait(&[target], &args.poll.poll_config(),).await?;
        info!("Indexing finished after {} polls", report.polls);
    }
    Ok((),)
}

/// Streams one file into the queue. Every `batch_size * concurrency` items it waits for the
/// automatic flushes so far, which keeps memory flat on large inputs.
async fn load_file(
    file: &Path,
    args: &LoadArgs,
    queue: &BatchQueue,
    registry: &ProcessingRegistry,
    sources: &mut BTreeMap<u64, String,>,
) -> Result<(),> {
    info!("Processing: {}", file.display());
    let mut reader = ObjectReader::open(file, &args.collection, args.tenant.as_deref(),).await?;
    let drain_every = args.batch_size.saturating_mul(args.concurrency,).max(1,);

    let mut added = 0usize;
    while let Some(parsed,) = reader.next_item().await? {
        let item = match parsed {
            Ok(item,) => item,
            Err(line_error,) => {
                registry.record_error(
                    format!("{}:{}", file.display(), line_error.line),
                    line_error.error.to_string(),
                    None,
                );
                continue;
            },
        };

        let sequence = queue.add(item,)?;
        if added == 0 {
            sources.insert(sequence, file.display().to_string(),);
        }
        added += 1;

        if added % drain_every == 0 {
            let completed = queue.drain_completed().await?;
            registry.record_results(&completed, sources,);
        }
    }

    let completed = queue.drain_completed().await?;
    registry.record_results(&completed, sources,);
    info!("Queued {} items from {}", added, file.display());
    Ok((),)
}

async fn handle_wait(args: &WaitArgs,) -> Result<(),> {
    let transport: Arc<dyn Transport,> =
        Arc::new(HttpTransport::new(&args.connection.transport_config(),)?,);
    let poller = ShardReadinessPoller::new(transport,);

    let mut target = ShardTarget::collection(&args.collection,)?;
    if let Some(tenant,) = &args.tenant {
        target = target.tenant(tenant.clone(),);
    }
    if let Some(shards,) = &args.shards {
        target = target.shards(shards.iter().cloned(),);
    }

    let report = poller.wait(&[target], &args.poll.poll_config(),).await?;
    info!(
        "All shards of {} ready after {} polls ({:?})",
        args.collection, report.polls, report.elapsed
    );
    Ok((),)
}
