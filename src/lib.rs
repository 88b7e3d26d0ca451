// BoxStore - embedded storage engine for spatially-indexed records
// Core library module

pub mod cache;
pub mod common;
pub mod error;
pub mod memory;
pub mod mempool;
pub mod memtable;
pub mod spatial;
pub mod storage;
pub mod util;

pub use common::{BlockAddress, RecordId};
pub use error::{Result, StoreError};
pub use memtable::{CallbackValue, MemTable, RecordCallback};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Directory holding the heap and index files
    pub data_dir: PathBuf,
    /// On-disk page size in bytes (heap and index pages)
    pub page_bytes: usize,
    /// Number of axes per bounding box
    pub dimension: usize,
    /// Maximum branches per R-tree node
    pub max_children: usize,
    /// Minimum branches per non-root R-tree node
    pub min_children: usize,
    /// Total charge of the page cache, split across shards
    pub cache_total_charge: usize,
    /// log2 of the page-cache shard count
    pub cache_shard_bits: u32,
    /// Bucket load factor that triggers a grow-only rehash
    pub cache_expand_ratio: f64,
    /// Bucket growth multiplier on rehash
    pub cache_expand_factor: usize,
}

impl Default for Options {
    fn default() -> Self {
        let page_bytes = 4096;
        Self {
            data_dir: PathBuf::from("./data"),
            page_bytes,
            dimension: 2,
            max_children: 8,
            min_children: 4,
            cache_total_charge: page_bytes * 100,
            cache_shard_bits: 4,
            cache_expand_ratio: 0.8,
            cache_expand_factor: 2,
        }
    }
}

impl Options {
    pub fn heap_path(&self) -> PathBuf {
        self.data_dir.join("heap.dat")
    }

    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join("index.dat")
    }

    pub fn with_data_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.data_dir = dir.as_ref().to_path_buf();
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(StoreError::InvalidArgument("dimension must be > 0".into()));
        }
        if self.max_children < 2 {
            return Err(StoreError::InvalidArgument(
                "max_children must be >= 2".into(),
            ));
        }
        if self.min_children == 0 || self.min_children > self.max_children / 2 {
            return Err(StoreError::InvalidArgument(format!(
                "min_children must be in 1..={}",
                self.max_children / 2
            )));
        }
        if self.cache_expand_factor < 2 {
            return Err(StoreError::InvalidArgument(
                "cache_expand_factor must be >= 2".into(),
            ));
        }
        if !(self.cache_expand_ratio > 0.0 && self.cache_expand_ratio <= 1.0) {
            return Err(StoreError::InvalidArgument(
                "cache_expand_ratio must be in (0, 1]".into(),
            ));
        }
        Ok(())
    }
}
