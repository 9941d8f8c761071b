//! Data directory management.
//!
//! Everything a pipeline process owns lives under one directory:
//!
//! ```text
//! <data_dir>/
//! ├─ LOCK              # Advisory lock for single-owner access
//! ├─ cursors/          # One cursor file per partition
//! ├─ documents/        # One document log per collection
//! └─ dead-letters/     # One dead-letter journal per partition
//! ```
//!
//! The log itself is not in here: producers append to it from other
//! processes.

use crate::error::{PipelineError, PipelineResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const CURSORS_DIR: &str = "cursors";
const DOCUMENTS_DIR: &str = "documents";
const DEAD_LETTERS_DIR: &str = "dead-letters";

/// An exclusively locked data directory.
///
/// The lock is held until the value is dropped, so only one process
/// commits offsets and writes documents at a time.
#[derive(Debug)]
pub struct DataDir {
    path: PathBuf,
    _lock_file: File,
}

impl DataDir {
    /// Opens or creates a data directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::DirectoryLocked`] if another process holds
    /// the lock, or an I/O error.
    pub fn open(path: &Path, create_if_missing: bool) -> PipelineResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(PipelineError::Config(format!(
                    "data directory does not exist: {}",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(PipelineError::Config(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(PipelineError::DirectoryLocked(path.to_path_buf()));
        }

        for sub in [CURSORS_DIR, DOCUMENTS_DIR, DEAD_LETTERS_DIR] {
            fs::create_dir_all(path.join(sub))?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Root of the data directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory of the cursor files.
    #[must_use]
    pub fn cursors_dir(&self) -> PathBuf {
        self.path.join(CURSORS_DIR)
    }

    /// Directory of the document logs.
    #[must_use]
    pub fn documents_dir(&self) -> PathBuf {
        self.path.join(DOCUMENTS_DIR)
    }

    /// Directory of the dead-letter journals.
    #[must_use]
    pub fn dead_letters_dir(&self) -> PathBuf {
        self.path.join(DEAD_LETTERS_DIR)
    }
}
