//! Records (data items)
//!
//! On-disk layout: `[ValidFlag: u8][Size: u16][Data]`. A zero flag means the
//! record is live; recovery's undo pass is the only writer that sets it to
//! deleted. An in-memory record is a window into its pinned page plus a
//! read/write lock over that window. All in-place mutation goes through the
//! [`WriteBracket`] protocol: `before` snapshots the pre-image and takes the
//! write lock, `commit` makes the change durable in the WAL before the lock
//! is released, `rollback` restores the pre-image without logging.

use crate::storage::data_manager::DataManager;
use crate::storage::page::{Page, PAGE_SIZE};
use crate::storage::Uid;
use crate::txn::Xid;
use crate::Result;
use parking_lot::{RwLock, RwLockWriteGuard};
use std::sync::Arc;

const OF_VALID: usize = 0;
const OF_SIZE: usize = 1;

/// Length of the record header preceding the payload.
pub const RECORD_HEADER: usize = 3;

/// Wrap a payload in the on-disk record layout, flagged live.
pub fn wrap_raw(data: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(RECORD_HEADER + data.len());
    raw.push(0);
    raw.extend_from_slice(&(data.len() as u16).to_be_bytes());
    raw.extend_from_slice(data);
    raw
}

/// Force a serialized record's flag to deleted (undo recovery only).
pub fn set_raw_deleted(raw: &mut [u8]) {
    raw[OF_VALID] = 1;
}

pub struct Record {
    uid: Uid,
    page: Arc<Page>,
    offset: u16,
    /// Total window length, header included.
    len: u16,
    lock: RwLock<()>,
}

impl Record {
    /// Parse the record starting at `offset` on a pinned page. Returns
    /// `None` when the offset cannot hold a record header.
    pub fn parse(page: Arc<Page>, offset: u16, uid: Uid) -> Option<Record> {
        let start = offset as usize;
        if start + RECORD_HEADER > PAGE_SIZE {
            return None;
        }
        let size = page.with_data(|d| u16::from_be_bytes([d[start + OF_SIZE], d[start + OF_SIZE + 1]]));
        let len = size as usize + RECORD_HEADER;
        if start + len > PAGE_SIZE {
            return None;
        }
        Some(Record {
            uid,
            page,
            offset,
            len: len as u16,
            lock: RwLock::new(()),
        })
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }

    pub fn is_valid(&self) -> bool {
        let _r = self.lock.read();
        self.page
            .with_data(|d| d[self.offset as usize + OF_VALID] == 0)
    }

    /// Copy of the payload, without the record header.
    pub fn data(&self) -> Vec<u8> {
        let _r = self.lock.read();
        self.page.with_data(|d| {
            d[self.offset as usize + RECORD_HEADER..self.offset as usize + self.len as usize]
                .to_vec()
        })
    }

    fn window_copy(&self) -> Vec<u8> {
        self.page
            .with_data(|d| d[self.offset as usize..self.offset as usize + self.len as usize].to_vec())
    }

    /// Open the mutation bracket: take the write lock, mark the page dirty
    /// and shadow the current bytes for rollback and for the UPDATE log's
    /// pre-image.
    pub fn before(&self) -> WriteBracket<'_> {
        let guard = self.lock.write();
        // Marking dirty before any byte moves keeps the flush path honest.
        let old_raw = self.page.update(|d| {
            d[self.offset as usize..self.offset as usize + self.len as usize].to_vec()
        });
        WriteBracket {
            record: self,
            _guard: guard,
            old_raw,
        }
    }
}

/// The single-writer mutation bracket over a record's window.
pub struct WriteBracket<'a> {
    record: &'a Record,
    _guard: RwLockWriteGuard<'a, ()>,
    old_raw: Vec<u8>,
}

impl WriteBracket<'_> {
    /// Overwrite bytes at an offset relative to the record's payload.
    pub fn write_data_at(&mut self, rel: usize, bytes: &[u8]) {
        let start = self.record.offset as usize + RECORD_HEADER + rel;
        debug_assert!(rel + bytes.len() + RECORD_HEADER <= self.record.len as usize);
        self.record
            .page
            .update(|d| d[start..start + bytes.len()].copy_from_slice(bytes));
    }

    pub fn old_raw(&self) -> &[u8] {
        &self.old_raw
    }

    pub fn new_raw(&self) -> Vec<u8> {
        self.record.window_copy()
    }

    /// Log the mutation to the WAL, then release the write lock. The WAL
    /// entry is durable before any other reader can see the new bytes
    /// through this record.
    pub fn commit(self, xid: Xid, dm: &DataManager) -> Result<()> {
        dm.log_update(xid, self.record.uid, &self.old_raw, &self.new_raw())
    }

    /// Restore the pre-image and release the write lock without logging.
    pub fn rollback(self) {
        let start = self.record.offset as usize;
        self.record
            .page
            .update(|d| d[start..start + self.old_raw.len()].copy_from_slice(&self.old_raw));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::pack_uid;

    fn page_with_record(payload: &[u8]) -> (Arc<Page>, u16) {
        let page = Arc::new(Page::new(2, Page::init_raw()));
        let offset = page.append_record(&wrap_raw(payload));
        (page, offset)
    }

    #[test]
    fn test_wrap_and_parse_round_trip() {
        let (page, offset) = page_with_record(b"payload");
        let record = Record::parse(page, offset, pack_uid(2, offset)).unwrap();

        assert!(record.is_valid());
        assert_eq!(record.data(), b"payload");
        assert_eq!(record.uid(), pack_uid(2, offset));
    }

    #[test]
    fn test_deleted_flag() {
        let mut raw = wrap_raw(b"gone");
        set_raw_deleted(&mut raw);

        let page = Arc::new(Page::new(2, Page::init_raw()));
        let offset = page.append_record(&raw);
        let record = Record::parse(page, offset, pack_uid(2, offset)).unwrap();
        assert!(!record.is_valid());
        // The payload itself is untouched.
        assert_eq!(record.data(), b"gone");
    }

    #[test]
    fn test_bracket_rollback_restores_preimage() {
        let (page, offset) = page_with_record(b"original");
        let record = Record::parse(page.clone(), offset, pack_uid(2, offset)).unwrap();

        let mut bracket = record.before();
        bracket.write_data_at(0, b"clobber!");
        assert_eq!(bracket.new_raw()[RECORD_HEADER..], *b"clobber!");

        bracket.rollback();
        assert_eq!(record.data(), b"original");
        assert!(page.is_dirty());
    }

    #[test]
    fn test_parse_rejects_out_of_bounds_offset() {
        let page = Arc::new(Page::new(2, Page::init_raw()));
        assert!(Record::parse(page, (PAGE_SIZE - 1) as u16, 0).is_none());
    }
}
