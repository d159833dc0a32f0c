//! Store configuration
//!
//! A store is identified by a path prefix; the engine keeps three files next
//! to each other: `<prefix>.xid` (transaction ledger), `<prefix>.log`
//! (write-ahead log) and `<prefix>.db` (pages).

use crate::storage::PAGE_SIZE;
use crate::{KeelError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Minimum number of pages the page cache must be able to hold.
pub const MIN_CACHE_PAGES: usize = 10;

/// Default page-cache memory budget (2 MiB ≈ 256 pages).
pub const DEFAULT_MEMORY: usize = 1 << 21;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path prefix shared by the `.xid`, `.log` and `.db` files.
    pub path: PathBuf,

    /// Memory budget for the page cache, in bytes.
    pub memory: usize,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            memory: DEFAULT_MEMORY,
        }
    }

    pub fn with_memory(mut self, memory: usize) -> Self {
        self.memory = memory;
        self
    }

    /// Number of pages the configured budget can hold.
    pub fn cache_capacity(&self) -> usize {
        self.memory / PAGE_SIZE
    }

    /// A budget below [`MIN_CACHE_PAGES`] pages is unusable and treated as
    /// fatal at open time.
    pub fn validate(&self) -> Result<()> {
        if self.cache_capacity() < MIN_CACHE_PAGES {
            return Err(KeelError::MemTooSmall(self.memory, MIN_CACHE_PAGES));
        }
        Ok(())
    }

    /// Path of the transaction ledger file.
    pub fn xid_path(&self) -> PathBuf {
        with_suffix(&self.path, "xid")
    }

    /// Path of the write-ahead log file.
    pub fn log_path(&self) -> PathBuf {
        with_suffix(&self.path, "log")
    }

    /// Path of the page file.
    pub fn db_path(&self) -> PathBuf {
        with_suffix(&self.path, "db")
    }
}

fn with_suffix(path: &PathBuf, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}
