//! Run command implementation.

use crate::settings::Settings;
use logsink_engine::{
    ConsumerLoop, DataDir, DocumentStore, FileDeadLetterSink, FileDocumentStore, FileLog,
    FileOffsetTracker, PipelineResult, RunSummary, ShutdownSignal, SinkWriter,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

/// How long workers get to finish their current record after Ctrl-C.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

type WorkerResult = thread::Result<PipelineResult<RunSummary>>;

/// Runs the pipeline with one worker thread per configured partition.
pub async fn run(settings: &Settings, until_idle: bool) -> Result<(), Box<dyn std::error::Error>> {
    let dir = DataDir::open(&settings.store.path, true)?;
    let log = Arc::new(FileLog::open(&settings.log.path, &settings.log.topic)?);
    let store = Arc::new(FileDocumentStore::open(
        &dir.documents_dir(),
        settings.store.sync_writes,
    )?);
    store.ensure_collection(&settings.store.collection)?;
    let dead_letters = Arc::new(FileDeadLetterSink::open(&dir.dead_letters_dir())?);
    let offsets = Arc::new(FileOffsetTracker::open(&dir.cursors_dir())?);
    let shutdown = ShutdownSignal::new();
    if !settings.store.sync_writes {
        warn!("store.sync_writes is off: an OS crash can lose committed documents");
    }

    info!(
        data_dir = %dir.path().display(),
        topic = %settings.log.topic,
        partitions = ?settings.log.partitions,
        collection = %settings.store.collection,
        "starting pipeline"
    );

    let mut handles = Vec::new();
    for partition in settings.partitions() {
        let consumer = ConsumerLoop::new(
            settings.consumer_config(partition, until_idle),
            Arc::clone(&log),
            SinkWriter::new(Arc::clone(&store), settings.sink_config()),
            Arc::clone(&dead_letters),
            Arc::clone(&offsets),
            shutdown.clone(),
        );
        let handle = thread::Builder::new()
            .name(format!("logsink-p{partition}"))
            .spawn(move || {
                let result = consumer.run();
                if result.is_err() {
                    // A fatal worker takes the process down with it.
                    consumer.shutdown_signal().trigger();
                }
                result
            })?;
        handles.push(handle);
    }

    let mut joined = tokio::task::spawn_blocking(move || {
        handles
            .into_iter()
            .map(|handle| handle.join())
            .collect::<Vec<WorkerResult>>()
    });

    let results = tokio::select! {
        results = &mut joined => results?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("shutdown requested, draining workers");
            shutdown.trigger();
            match tokio::time::timeout(DRAIN_GRACE, &mut joined).await {
                Ok(results) => results?,
                Err(_) => {
                    warn!(grace_secs = DRAIN_GRACE.as_secs(), "workers did not stop in time");
                    return Err("workers did not stop within the drain grace period".into());
                }
            }
        }
    };

    report(results)
}

fn report(results: Vec<WorkerResult>) -> Result<(), Box<dyn std::error::Error>> {
    let mut failed = 0;
    for result in results {
        match result {
            Ok(Ok(summary)) => info!(
                partition = summary.partition.get(),
                cause = ?summary.cause,
                last_committed = ?summary.last_committed,
                persisted = summary.stats.records_persisted,
                dead_lettered = summary.stats.records_dead_lettered,
                elapsed_ms = u64::try_from(summary.duration.as_millis()).unwrap_or(u64::MAX),
                "worker finished"
            ),
            Ok(Err(err)) => {
                failed += 1;
                error!(partition = ?err.partition(), error = %err, "worker failed");
            }
            Err(_) => {
                failed += 1;
                error!("worker panicked");
            }
        }
    }

    if failed > 0 {
        return Err(format!("{failed} worker(s) failed").into());
    }
    Ok(())
}
