//! Storage fixtures with automatic cleanup.

use crate::fault::{FaultBackend, FaultControls};
use muxfile_core::{Config, Storage};
use muxfile_storage::FileBackend;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// A test storage with automatic cleanup.
pub struct TestStorage {
    /// The storage instance.
    pub storage: Storage,
    /// Path of the master file, for file-based fixtures.
    pub master_path: Option<PathBuf>,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestStorage {
    /// Creates a new in-memory test storage.
    pub fn memory() -> Self {
        Self {
            storage: Storage::open_in_memory().expect("failed to open in-memory storage"),
            master_path: None,
            _temp_dir: None,
        }
    }

    /// Creates a new file-based test storage in a temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_dir.path().join("test.mux");
        let storage = Storage::open(&path).expect("failed to open file storage");
        Self {
            storage,
            master_path: Some(path),
            _temp_dir: Some(temp_dir),
        }
    }

    /// Creates a file-based storage whose master backend injects faults.
    ///
    /// The journal stays on a plain backend so rollback always works.
    pub fn file_with_faults() -> (Self, Arc<FaultControls>) {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_dir.path().join("test.mux");
        let journal_path = temp_dir.path().join("test.mux.journal");

        let master = FaultBackend::new(Box::new(
            FileBackend::open(&path).expect("failed to create master file"),
        ));
        let controls = master.controls();
        let journal = FileBackend::open(&journal_path).expect("failed to create journal file");

        let storage =
            Storage::open_with_backends(Config::default(), Box::new(master), Box::new(journal))
                .expect("failed to open storage over fault backend");

        (
            Self {
                storage,
                master_path: Some(path),
                _temp_dir: Some(temp_dir),
            },
            controls,
        )
    }

    /// Reads the raw master file, for byte-level comparisons.
    ///
    /// # Panics
    ///
    /// Panics on in-memory fixtures.
    pub fn master_bytes(&self) -> Vec<u8> {
        let path = self
            .master_path
            .as_ref()
            .expect("master_bytes requires a file-based fixture");
        std::fs::read(path).expect("failed to read master file")
    }
}

impl std::ops::Deref for TestStorage {
    type Target = Storage;

    fn deref(&self) -> &Self::Target {
        &self.storage
    }
}
