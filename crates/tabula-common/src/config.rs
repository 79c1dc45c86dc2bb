//! Configuration structures for Tabula indexes.

use crate::error::{Result, TabulaError};
use crate::page::{is_valid_page_size, DEFAULT_PAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for an index file and its page cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Page size in bytes for newly created files. Existing files keep their own.
    pub page_size: usize,
    /// Page cache size in pages (0 = size from available memory).
    pub cache_pages: usize,
    /// Enable fsync on flush.
    pub fsync_enabled: bool,
    /// Maximum number of pages the file may grow to.
    pub max_pages: u32,
    /// Upper bound on pages pinned by a single `hold(levels)` call.
    pub max_hold_pages: usize,
    /// Bulk build settings.
    pub bulk: BulkConfig,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_pages: 1024,
            fsync_enabled: true,
            max_pages: u32::MAX,
            max_hold_pages: 256,
            bulk: BulkConfig::default(),
        }
    }
}

impl IndexConfig {
    /// Checks every field, returning `InvalidParameter` for the first bad one.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_page_size(self.page_size) {
            return Err(TabulaError::invalid("page_size", self.page_size));
        }
        // header page plus an empty root leaf
        if self.max_pages < 2 {
            return Err(TabulaError::invalid("max_pages", self.max_pages));
        }
        self.bulk.validate()
    }

    /// Returns the total cache size in bytes, or None when auto-sized.
    pub fn cache_size_bytes(&self) -> Option<usize> {
        if self.cache_pages == 0 {
            None
        } else {
            Some(self.cache_pages * self.page_size)
        }
    }
}

/// Settings for the Key Pool used by bulk index construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkConfig {
    /// Entries buffered in memory before a sorted run is spilled.
    pub run_entries: usize,
    /// Number of runs merged at once.
    pub merge_fan_in: usize,
    /// Entries processed between progress reports and cancellation checks.
    pub progress_interval: u64,
    /// Directory for spilled runs (None = the index file's directory).
    pub temp_dir: Option<PathBuf>,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            run_entries: 64 * 1024,
            merge_fan_in: 16,
            progress_interval: 4096,
            temp_dir: None,
        }
    }
}

impl BulkConfig {
    /// Checks the bulk settings.
    pub fn validate(&self) -> Result<()> {
        if self.run_entries == 0 {
            return Err(TabulaError::invalid("bulk.run_entries", self.run_entries));
        }
        if self.merge_fan_in < 2 {
            return Err(TabulaError::invalid("bulk.merge_fan_in", self.merge_fan_in));
        }
        if self.progress_interval == 0 {
            return Err(TabulaError::invalid(
                "bulk.progress_interval",
                self.progress_interval,
            ));
        }
        Ok(())
    }
}
