//! Storage configuration.

use crate::error::{EngineError, EngineResult};

/// Default block size in bytes.
pub const DEFAULT_BLOCK_SIZE: u32 = 512;

/// Minimum supported block size in bytes.
pub const MIN_BLOCK_SIZE: u32 = 512;

/// Configuration for opening a storage file.
#[derive(Debug, Clone)]
pub struct Config {
    /// Block size for new storage files, in bytes.
    ///
    /// Must be a power of two and at least 512. Ignored when opening an
    /// existing file, whose header records the block size it was created
    /// with.
    pub block_size: u32,

    /// Whether to create the storage file if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to sync the master file on every commit (safer but slower).
    pub sync_on_commit: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            create_if_missing: true,
            sync_on_commit: true,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the block size for new storage files.
    #[must_use]
    pub const fn block_size(mut self, size: u32) -> Self {
        self.block_size = size;
        self
    }

    /// Sets whether to create the storage file if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to sync the master file on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `BadFormat` if the block size is below the minimum or not a
    /// power of two.
    pub fn validate(&self) -> EngineResult<()> {
        if self.block_size < MIN_BLOCK_SIZE || !self.block_size.is_power_of_two() {
            return Err(EngineError::bad_format(format!(
                "block size {} must be a power of two and at least {}",
                self.block_size, MIN_BLOCK_SIZE
            )));
        }
        Ok(())
    }
}
