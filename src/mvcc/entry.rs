//! Versioned entries
//!
//! An entry is a record whose payload is `[XMIN: u64][XMAX: u64][data]`:
//! `xmin` is the transaction that created the version, `xmax` the one that
//! deleted it (0 while live). Setting `xmax` goes through the record's write
//! bracket, so every delete is WAL-logged before it becomes visible.

use crate::storage::{DataManager, Record, Uid};
use crate::txn::Xid;
use crate::Result;
use std::sync::Arc;

const OF_XMIN: usize = 0;
const OF_XMAX: usize = 8;
const OF_DATA: usize = 16;

/// Bytes of version header in front of the user data.
pub const ENTRY_HEADER: usize = OF_DATA;

pub struct Entry {
    uid: Uid,
    record: Arc<Record>,
}

impl Entry {
    pub fn new(uid: Uid, record: Arc<Record>) -> Self {
        Self { uid, record }
    }

    /// Serialize a fresh version created by `xid`.
    pub fn wrap(xid: Xid, data: &[u8]) -> Vec<u8> {
        let mut raw = Vec::with_capacity(OF_DATA + data.len());
        raw.extend_from_slice(&xid.to_be_bytes());
        raw.extend_from_slice(&0u64.to_be_bytes());
        raw.extend_from_slice(data);
        raw
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn xmin(&self) -> Xid {
        let payload = self.record.data();
        u64::from_be_bytes(payload[OF_XMIN..OF_XMAX].try_into().unwrap())
    }

    pub fn xmax(&self) -> Xid {
        let payload = self.record.data();
        u64::from_be_bytes(payload[OF_XMAX..OF_DATA].try_into().unwrap())
    }

    /// Copy of the user data, version header stripped.
    pub fn data(&self) -> Vec<u8> {
        self.record.data()[OF_DATA..].to_vec()
    }

    /// Mark this version deleted by `xid`, under the record's before/after
    /// bracket.
    pub fn set_xmax(&self, xid: Xid, dm: &DataManager) -> Result<()> {
        let mut bracket = self.record.before();
        bracket.write_data_at(OF_XMAX, &xid.to_be_bytes());
        bracket.commit(xid, dm)
    }

    /// Drop the underlying record reference.
    pub fn release(&self, dm: &DataManager) -> Result<()> {
        dm.release(&self.record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_layout() {
        let raw = Entry::wrap(42, b"user data");
        assert_eq!(raw.len(), OF_DATA + 9);
        assert_eq!(u64::from_be_bytes(raw[0..8].try_into().unwrap()), 42);
        assert_eq!(u64::from_be_bytes(raw[8..16].try_into().unwrap()), 0);
        assert_eq!(&raw[16..], b"user data");
    }
}
