//! Compact command implementation.

use crate::settings::Settings;
use logsink_engine::{DataDir, FileDocumentStore};

/// Rewrites the document log of the configured collection.
pub fn run(settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    let dir = DataDir::open(&settings.store.path, true)?;
    let store = FileDocumentStore::open(&dir.documents_dir(), true)?;

    println!("Compacting collection '{}'", settings.store.collection);
    let report = store.compact(&settings.store.collection)?;

    println!("  Frames before:  {}", report.frames_before);
    println!("  Documents kept: {}", report.documents);
    println!("  Size before:    {} bytes", report.bytes_before);
    println!("  Size after:     {} bytes", report.bytes_after);
    let saved = report.bytes_before.saturating_sub(report.bytes_after);
    println!(
        "  Space saved:    {} bytes ({:.1}%)",
        saved,
        if report.bytes_before > 0 {
            saved as f64 / report.bytes_before as f64 * 100.0
        } else {
            0.0
        }
    );
    Ok(())
}
