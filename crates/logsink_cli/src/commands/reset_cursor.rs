//! Reset-cursor command implementation.

use crate::settings::Settings;
use logsink_engine::{DataDir, FileOffsetTracker, OffsetTracker};
use logsink_model::PartitionId;

/// Sets the cursor of `partition` to `offset`, or clears it.
///
/// Takes the data-directory lock, so it refuses to run next to `run`.
pub fn run(
    settings: &Settings,
    partition: u32,
    offset: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let dir = DataDir::open(&settings.store.path, true)?;
    let offsets = FileOffsetTracker::open(&dir.cursors_dir())?;
    let partition = PartitionId(partition);

    let before = offsets.load(partition)?;
    offsets.reset(partition, offset)?;

    let describe = |offset: Option<u64>| offset.map_or_else(|| "none".to_owned(), |o| o.to_string());
    println!(
        "Partition {partition}: cursor {} -> {}",
        describe(before.map(|c| c.last_safe_offset)),
        describe(offset)
    );
    match offset {
        Some(offset) => println!("Next run resumes at offset {}", offset.saturating_add(1)),
        None => println!("Next run resumes at the earliest available offset"),
    }
    Ok(())
}
