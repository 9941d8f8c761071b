//! Inspect command implementation.

use crate::settings::Settings;
use logsink_engine::{
    DataDir, DocumentStore, FileDeadLetterSink, FileDocumentStore, FileLog, FileOffsetTracker,
    LogSource,
};
use logsink_model::PartitionId;
use serde::Serialize;
use std::collections::BTreeMap;

/// Pipeline inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Data directory.
    pub data_dir: String,
    /// Log topic.
    pub topic: String,
    /// Target collection.
    pub collection: String,
    /// Documents in the collection.
    pub documents: usize,
    /// Dead letters across all partitions.
    pub dead_letters: usize,
    /// Per-partition positions.
    pub partitions: Vec<PartitionInfo>,
}

/// Positions of one partition.
#[derive(Debug, Serialize)]
pub struct PartitionInfo {
    /// Partition number.
    pub partition: u32,
    /// Whether the configuration consumes it.
    pub configured: bool,
    /// Oldest offset in the log.
    pub earliest_offset: u64,
    /// Offset the next record will get.
    pub end_offset: u64,
    /// Last committed offset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<u64>,
    /// Records not yet handled.
    pub lag: u64,
}

/// Runs the inspect command.
pub fn run(settings: &Settings, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = collect(settings)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }
    Ok(())
}

fn collect(settings: &Settings) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let dir = DataDir::open(&settings.store.path, true)?;
    let log = FileLog::open(&settings.log.path, &settings.log.topic)?;
    let store = FileDocumentStore::open(&dir.documents_dir(), true)?;
    let dead_letters = FileDeadLetterSink::open(&dir.dead_letters_dir())?;
    let offsets = FileOffsetTracker::open(&dir.cursors_dir())?;

    let mut cursors: BTreeMap<PartitionId, Option<u64>> = BTreeMap::new();
    for partition in settings.partitions().into_iter().chain(log.partitions()?) {
        cursors.insert(partition, None);
    }
    for cursor in offsets.cursors()? {
        cursors.insert(cursor.partition, Some(cursor.last_safe_offset));
    }

    let configured = settings.partitions();
    let mut partitions = Vec::with_capacity(cursors.len());
    for (partition, cursor) in cursors {
        let earliest_offset = log.earliest_offset(partition)?;
        let end_offset = log.end_offset(partition)?;
        let resume = cursor.map_or(earliest_offset, |c| c.saturating_add(1));
        partitions.push(PartitionInfo {
            partition: partition.get(),
            configured: configured.contains(&partition),
            earliest_offset,
            end_offset,
            cursor,
            lag: end_offset.saturating_sub(resume),
        });
    }

    Ok(InspectResult {
        data_dir: dir.path().display().to_string(),
        topic: settings.log.topic.clone(),
        collection: settings.store.collection.clone(),
        documents: store.count(&settings.store.collection)?,
        dead_letters: dead_letters.count()?,
        partitions,
    })
}

fn print_text_output(result: &InspectResult) {
    println!("Pipeline: {}", result.data_dir);
    println!();
    println!("  Topic:        {}", result.topic);
    println!("  Collection:   {}", result.collection);
    println!("  Documents:    {}", result.documents);
    println!("  Dead letters: {}", result.dead_letters);
    println!();
    println!("Partitions:");
    for p in &result.partitions {
        let cursor = p
            .cursor
            .map_or_else(|| "-".to_owned(), |c| c.to_string());
        println!(
            "  {:>5}{}  offsets {}..{}  cursor {}  lag {}",
            p.partition,
            if p.configured { "" } else { " (unconfigured)" },
            p.earliest_offset,
            p.end_offset,
            cursor,
            p.lag
        );
    }
}
