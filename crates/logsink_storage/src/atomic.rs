//! Crash-safe whole-file replacement.

use crate::error::StorageResult;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

/// Replaces the contents of `path` with `data` atomically.
///
/// The data is written to a sibling `.tmp` file, synced, renamed over the
/// target and the parent directory is synced, so a crash leaves either the
/// old contents or the new ones.
pub fn write_atomic(path: &Path, data: &[u8]) -> StorageResult<()> {
    let file_name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("not a file path: {}", path.display()),
        )
    })?;
    let mut temp_name = file_name.to_os_string();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    let mut file = File::create(&temp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, path)?;

    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => sync_directory(parent),
        _ => sync_directory(Path::new(".")),
    }
}

/// Syncs a directory so that file creations and renames inside it are durable.
#[cfg(unix)]
pub fn sync_directory(dir: &Path) -> StorageResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// Syncs a directory so that file creations and renames inside it are durable.
///
/// NTFS journals metadata, so there is nothing to do here.
#[cfg(not(unix))]
pub fn sync_directory(_dir: &Path) -> StorageResult<()> {
    Ok(())
}
