//! keeldb storage engine
//!
//! The transactional storage engine beneath a small relational database:
//! durable fixed-size pages, multi-version record access, and consistent
//! crash recovery.
//!
//! ## Architecture
//! - Transaction ledger: durable per-transaction status file
//! - Data layer: paged file + reference-counted page cache + checksummed
//!   write-ahead log + free-space index, with redo/undo recovery
//! - Version layer: MVCC entries over records, snapshot visibility for two
//!   isolation levels, deadlock-detecting row locks

pub mod cache;
pub mod config;
pub mod mvcc;
pub mod storage;
pub mod txn;

mod error;

pub use config::StoreConfig;
pub use error::{KeelError, Result};
pub use mvcc::{IsolationLevel, VersionManager};
pub use storage::{DataManager, Uid, PAGE_SIZE};
pub use txn::{TransactionLedger, Xid, SUPER_XID};
