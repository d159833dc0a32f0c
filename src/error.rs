//! Error types for the keeldb storage engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, KeelError>;

#[derive(Error, Debug)]
pub enum KeelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad XID file: {0}")]
    CorruptXidFile(String),

    #[error("Bad log file: {0}")]
    CorruptLogFile(String),

    #[error("Memory budget too small: {0} bytes maps to fewer than {1} pages")]
    MemTooSmall(usize, usize),

    #[error("Cache is full (capacity {0})")]
    CacheFull(usize),

    #[error("Data too large: {0} bytes")]
    DataTooLarge(usize),

    #[error("Deadlock detected")]
    Deadlock,

    #[error("Concurrent update conflict")]
    ConcurrentUpdate,

    #[error("Transaction {0} is not active")]
    TransactionNotActive(u64),
}
