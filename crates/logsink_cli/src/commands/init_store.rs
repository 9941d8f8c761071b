//! Init-store command implementation.

use crate::settings::Settings;
use logsink_engine::{seed_collection, DataDir, DocumentStore, FileDocumentStore};

/// Creates the collection and inserts the seed document if it is missing.
pub fn run(settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    let dir = DataDir::open(&settings.store.path, true)?;
    let store = FileDocumentStore::open(&dir.documents_dir(), true)?;
    let collection = &settings.store.collection;

    if seed_collection(&store, collection)? {
        println!("Seeded collection '{collection}'");
    } else {
        println!("Collection '{collection}' already seeded");
    }
    println!("  Documents: {}", store.count(collection)?);
    Ok(())
}
