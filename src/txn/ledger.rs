//! Transaction Ledger
//!
//! Tracks each transaction's lifecycle status durably in the `.xid` file:
//! `[xid_counter: u64][status: u8 per xid]`. The status byte of transaction
//! `xid` lives at offset `8 + (xid - 1)`. Every state change is forced to
//! disk before it is acknowledged, so recovery can trust the ledger as the
//! final word on whether a transaction committed.

use crate::{KeelError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Transaction identifier, monotonically assigned starting at 1.
pub type Xid = u64;

/// Reserved transaction id for system-internal writes. It is always
/// considered committed, never appears in the ledger file, and is never
/// rolled back.
pub const SUPER_XID: Xid = 0;

const HEADER_LEN: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxnStatus {
    Active = 0,
    Committed = 1,
    Aborted = 2,
}

struct LedgerFile {
    file: File,
    counter: u64,
}

impl LedgerFile {
    fn status_offset(xid: Xid) -> u64 {
        HEADER_LEN + (xid - 1)
    }

    fn write_counter(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.counter.to_be_bytes())?;
        self.file.sync_data()?;
        Ok(())
    }

    fn write_status(&mut self, xid: Xid, status: TxnStatus) -> Result<()> {
        self.file.seek(SeekFrom::Start(Self::status_offset(xid)))?;
        self.file.write_all(&[status as u8])?;
        self.file.sync_data()?;
        Ok(())
    }

    fn read_status(&mut self, xid: Xid) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.file.seek(SeekFrom::Start(Self::status_offset(xid)))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf[0])
    }
}

pub struct TransactionLedger {
    inner: Mutex<LedgerFile>,
}

impl TransactionLedger {
    /// Create a fresh ledger with a zero counter.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.write_all(&0u64.to_be_bytes())?;
        file.sync_all()?;

        Ok(Self {
            inner: Mutex::new(LedgerFile { file, counter: 0 }),
        })
    }

    /// Open an existing ledger and verify its structure.
    ///
    /// The file length must equal `header + counter`; anything else means
    /// the ledger is corrupt, which is fatal.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let len = file.metadata()?.len();
        if len < HEADER_LEN {
            return Err(KeelError::CorruptXidFile(format!(
                "file is {} bytes, shorter than the header",
                len
            )));
        }

        let mut header = [0u8; HEADER_LEN as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        let counter = u64::from_be_bytes(header);

        if len != HEADER_LEN + counter {
            return Err(KeelError::CorruptXidFile(format!(
                "counter {} implies {} bytes, file has {}",
                counter,
                HEADER_LEN + counter,
                len
            )));
        }

        Ok(Self {
            inner: Mutex::new(LedgerFile { file, counter }),
        })
    }

    /// Start a new transaction: persist the incremented counter and an
    /// ACTIVE status byte before returning the new xid.
    pub fn begin(&self) -> Result<Xid> {
        let mut inner = self.inner.lock();
        let xid = inner.counter + 1;
        inner.write_status(xid, TxnStatus::Active)?;
        inner.counter = xid;
        inner.write_counter()?;
        Ok(xid)
    }

    pub fn commit(&self, xid: Xid) -> Result<()> {
        self.update(xid, TxnStatus::Committed)
    }

    pub fn abort(&self, xid: Xid) -> Result<()> {
        self.update(xid, TxnStatus::Aborted)
    }

    fn update(&self, xid: Xid, status: TxnStatus) -> Result<()> {
        if xid == SUPER_XID {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        debug_assert!(xid <= inner.counter, "xid {} was never begun", xid);
        inner.write_status(xid, status)
    }

    pub fn is_active(&self, xid: Xid) -> Result<bool> {
        if xid == SUPER_XID {
            return Ok(false);
        }
        self.check(xid, TxnStatus::Active)
    }

    pub fn is_committed(&self, xid: Xid) -> Result<bool> {
        if xid == SUPER_XID {
            return Ok(true);
        }
        self.check(xid, TxnStatus::Committed)
    }

    pub fn is_aborted(&self, xid: Xid) -> Result<bool> {
        if xid == SUPER_XID {
            return Ok(false);
        }
        self.check(xid, TxnStatus::Aborted)
    }

    fn check(&self, xid: Xid, status: TxnStatus) -> Result<bool> {
        let mut inner = self.inner.lock();
        Ok(inner.read_status(xid)? == status as u8)
    }

    pub fn close(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.file.sync_all()?;
        Ok(())
    }
}
