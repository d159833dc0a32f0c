//! Crash recovery: log record codecs and the redo/undo passes
//!
//! Rules:
//! 1. Transactions that reached a terminal state (committed or aborted)
//!    before the crash are redone in log order.
//! 2. Transactions still active at the crash are undone, each one's entries
//!    replayed last-to-first, and then marked aborted in the ledger.
//!
//! Both passes rewrite physical bytes at logged offsets, so running
//! recovery twice (a crash during recovery) converges to the same pages.

use crate::storage::page_store::PageStore;
use crate::storage::record::set_raw_deleted;
use crate::storage::wal::WriteAheadLog;
use crate::storage::{unpack_uid, Uid};
use crate::txn::{TransactionLedger, Xid};
use crate::{KeelError, Result};
use std::collections::HashMap;

const TAG_INSERT: u8 = 0;
const TAG_UPDATE: u8 = 1;

/// A WAL entry's decoded form.
///
/// Layouts (big-endian):
/// - insert: `[0][xid: u64][pgno: u32][offset: u16][raw]`
/// - update: `[1][xid: u64][uid: u64][old_raw][new_raw]`, equal halves
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Insert {
        xid: Xid,
        pgno: u32,
        offset: u16,
        raw: Vec<u8>,
    },
    Update {
        xid: Xid,
        uid: Uid,
        old_raw: Vec<u8>,
        new_raw: Vec<u8>,
    },
}

impl LogRecord {
    pub fn insert(xid: Xid, pgno: u32, offset: u16, raw: Vec<u8>) -> Self {
        LogRecord::Insert {
            xid,
            pgno,
            offset,
            raw,
        }
    }

    pub fn update(xid: Xid, uid: Uid, old_raw: Vec<u8>, new_raw: Vec<u8>) -> Self {
        debug_assert_eq!(old_raw.len(), new_raw.len());
        LogRecord::Update {
            xid,
            uid,
            old_raw,
            new_raw,
        }
    }

    pub fn xid(&self) -> Xid {
        match self {
            LogRecord::Insert { xid, .. } | LogRecord::Update { xid, .. } => *xid,
        }
    }

    /// Page the entry touches.
    pub fn pgno(&self) -> u32 {
        match self {
            LogRecord::Insert { pgno, .. } => *pgno,
            LogRecord::Update { uid, .. } => unpack_uid(*uid).0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            LogRecord::Insert {
                xid,
                pgno,
                offset,
                raw,
            } => {
                let mut buf = Vec::with_capacity(15 + raw.len());
                buf.push(TAG_INSERT);
                buf.extend_from_slice(&xid.to_be_bytes());
                buf.extend_from_slice(&pgno.to_be_bytes());
                buf.extend_from_slice(&offset.to_be_bytes());
                buf.extend_from_slice(raw);
                buf
            }
            LogRecord::Update {
                xid,
                uid,
                old_raw,
                new_raw,
            } => {
                let mut buf = Vec::with_capacity(17 + old_raw.len() + new_raw.len());
                buf.push(TAG_UPDATE);
                buf.extend_from_slice(&xid.to_be_bytes());
                buf.extend_from_slice(&uid.to_be_bytes());
                buf.extend_from_slice(old_raw);
                buf.extend_from_slice(new_raw);
                buf
            }
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let corrupt = || KeelError::CorruptLogFile("malformed log record".into());
        let tag = *buf.first().ok_or_else(corrupt)?;
        match tag {
            TAG_INSERT => {
                if buf.len() < 15 {
                    return Err(corrupt());
                }
                Ok(LogRecord::Insert {
                    xid: u64::from_be_bytes(buf[1..9].try_into().unwrap()),
                    pgno: u32::from_be_bytes(buf[9..13].try_into().unwrap()),
                    offset: u16::from_be_bytes(buf[13..15].try_into().unwrap()),
                    raw: buf[15..].to_vec(),
                })
            }
            TAG_UPDATE => {
                if buf.len() < 17 || (buf.len() - 17) % 2 != 0 {
                    return Err(corrupt());
                }
                let half = (buf.len() - 17) / 2;
                Ok(LogRecord::Update {
                    xid: u64::from_be_bytes(buf[1..9].try_into().unwrap()),
                    uid: u64::from_be_bytes(buf[9..17].try_into().unwrap()),
                    old_raw: buf[17..17 + half].to_vec(),
                    new_raw: buf[17 + half..].to_vec(),
                })
            }
            _ => Err(corrupt()),
        }
    }
}

/// Run full crash recovery over a verified (tail-trimmed) log.
pub fn recover(
    ledger: &TransactionLedger,
    wal: &WriteAheadLog,
    pages: &PageStore,
) -> Result<()> {
    // Pages past the highest one the log knows about were allocated but
    // never carried a durable record; drop them.
    let mut max_pgno = 1;
    wal.rewind();
    while let Some(data) = wal.next()? {
        max_pgno = max_pgno.max(LogRecord::decode(&data)?.pgno());
    }
    if max_pgno < pages.page_count() {
        pages.truncate_to(max_pgno)?;
    }

    redo(ledger, wal, pages)?;
    undo(ledger, wal, pages)?;
    Ok(())
}

/// Forward pass: reapply every entry of every terminal transaction.
fn redo(ledger: &TransactionLedger, wal: &WriteAheadLog, pages: &PageStore) -> Result<()> {
    wal.rewind();
    while let Some(data) = wal.next()? {
        let record = LogRecord::decode(&data)?;
        if ledger.is_active(record.xid())? {
            continue;
        }
        match record {
            LogRecord::Insert {
                pgno, offset, raw, ..
            } => {
                let page = pages.get_page(pgno)?;
                page.recover_insert(&raw, offset);
                pages.release_page(pgno)?;
            }
            LogRecord::Update { uid, new_raw, .. } => {
                let (pgno, offset) = unpack_uid(uid);
                let page = pages.get_page(pgno)?;
                page.recover_update(&new_raw, offset);
                pages.release_page(pgno)?;
            }
        }
    }
    Ok(())
}

/// Backward pass: reverse each active transaction's entries, newest first,
/// then mark it aborted.
fn undo(ledger: &TransactionLedger, wal: &WriteAheadLog, pages: &PageStore) -> Result<()> {
    let mut active: HashMap<Xid, Vec<LogRecord>> = HashMap::new();

    wal.rewind();
    while let Some(data) = wal.next()? {
        let record = LogRecord::decode(&data)?;
        if ledger.is_active(record.xid())? {
            active.entry(record.xid()).or_default().push(record);
        }
    }

    if !active.is_empty() {
        eprintln!(
            "recovery: rolling back {} unfinished transaction(s)",
            active.len()
        );
    }

    for (xid, records) in active {
        for record in records.iter().rev() {
            match record {
                LogRecord::Insert {
                    pgno, offset, raw, ..
                } => {
                    // The row was never committed: materialize it only to
                    // mark it deleted.
                    let mut raw = raw.clone();
                    set_raw_deleted(&mut raw);
                    let page = pages.get_page(*pgno)?;
                    page.recover_insert(&raw, *offset);
                    pages.release_page(*pgno)?;
                }
                LogRecord::Update {
                    uid, old_raw, ..
                } => {
                    let (pgno, offset) = unpack_uid(*uid);
                    let page = pages.get_page(pgno)?;
                    page.recover_update(old_raw, offset);
                    pages.release_page(pgno)?;
                }
            }
        }
        ledger.abort(xid)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_CACHE_PAGES;
    use crate::storage::page::Page;
    use crate::storage::record::wrap_raw;
    use crate::storage::pack_uid;
    use tempfile::TempDir;

    struct Fixture {
        ledger: TransactionLedger,
        wal: WriteAheadLog,
        pages: PageStore,
    }

    fn fixture(dir: &TempDir) -> Fixture {
        let ledger = TransactionLedger::create(dir.path().join("t.xid")).unwrap();
        let wal = WriteAheadLog::create(dir.path().join("t.log")).unwrap();
        let pages = PageStore::create(dir.path().join("t.db"), MIN_CACHE_PAGES).unwrap();
        pages.new_page(&Page::init_page_one_raw()).unwrap();
        pages.new_page(&Page::init_raw()).unwrap();
        Fixture { ledger, wal, pages }
    }

    #[test]
    fn test_log_record_codecs() {
        let insert = LogRecord::insert(7, 3, 130, b"row bytes".to_vec());
        assert_eq!(LogRecord::decode(&insert.encode()).unwrap(), insert);

        let update = LogRecord::update(9, pack_uid(3, 130), vec![1, 2, 3], vec![4, 5, 6]);
        assert_eq!(LogRecord::decode(&update.encode()).unwrap(), update);

        assert!(LogRecord::decode(&[]).is_err());
        assert!(LogRecord::decode(&[2, 0, 0]).is_err());
        // Update halves must split evenly.
        let mut bad = LogRecord::update(9, 1, vec![1], vec![2]).encode();
        bad.push(0xff);
        assert!(LogRecord::decode(&bad).is_err());
    }

    #[test]
    fn test_redo_reapplies_committed_insert() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir);

        let xid = fx.ledger.begin().unwrap();
        let raw = wrap_raw(b"committed row");
        fx.wal
            .log(&LogRecord::insert(xid, 2, 2, raw.clone()).encode())
            .unwrap();
        fx.ledger.commit(xid).unwrap();

        // The page mutation itself was lost in the crash.
        recover(&fx.ledger, &fx.wal, &fx.pages).unwrap();

        let page = fx.pages.get_page(2).unwrap();
        page.with_data(|d| assert_eq!(&d[2..2 + raw.len()], raw.as_slice()));
        assert_eq!(page.fso() as usize, 2 + raw.len());
        fx.pages.release_page(2).unwrap();
    }

    #[test]
    fn test_undo_marks_uncommitted_insert_deleted() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir);

        let xid = fx.ledger.begin().unwrap();
        let raw = wrap_raw(b"phantom row");
        fx.wal
            .log(&LogRecord::insert(xid, 2, 2, raw.clone()).encode())
            .unwrap();
        // No commit: the transaction was still active at the crash.

        recover(&fx.ledger, &fx.wal, &fx.pages).unwrap();

        let page = fx.pages.get_page(2).unwrap();
        page.with_data(|d| {
            assert_eq!(d[2], 1, "valid flag forced to deleted");
            assert_eq!(&d[2 + 3..2 + raw.len()], b"phantom row");
        });
        fx.pages.release_page(2).unwrap();
        assert!(fx.ledger.is_aborted(xid).unwrap());
    }

    #[test]
    fn test_undo_restores_preimage_of_update() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir);

        // A committed insert establishes the row.
        let creator = fx.ledger.begin().unwrap();
        let original = wrap_raw(b"before");
        fx.wal
            .log(&LogRecord::insert(creator, 2, 2, original.clone()).encode())
            .unwrap();
        fx.ledger.commit(creator).unwrap();

        // An unfinished transaction overwrote it in place.
        let writer = fx.ledger.begin().unwrap();
        let clobbered = wrap_raw(b"after!");
        fx.wal
            .log(
                &LogRecord::update(writer, pack_uid(2, 2), original.clone(), clobbered.clone())
                    .encode(),
            )
            .unwrap();

        recover(&fx.ledger, &fx.wal, &fx.pages).unwrap();

        let page = fx.pages.get_page(2).unwrap();
        page.with_data(|d| assert_eq!(&d[2..2 + original.len()], original.as_slice()));
        fx.pages.release_page(2).unwrap();
        assert!(fx.ledger.is_aborted(writer).unwrap());
    }

    #[test]
    fn test_recovery_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir);

        let xid = fx.ledger.begin().unwrap();
        let raw = wrap_raw(b"replay me");
        fx.wal
            .log(&LogRecord::insert(xid, 2, 2, raw.clone()).encode())
            .unwrap();
        fx.ledger.commit(xid).unwrap();

        recover(&fx.ledger, &fx.wal, &fx.pages).unwrap();
        recover(&fx.ledger, &fx.wal, &fx.pages).unwrap();

        let page = fx.pages.get_page(2).unwrap();
        page.with_data(|d| assert_eq!(&d[2..2 + raw.len()], raw.as_slice()));
        assert_eq!(page.fso() as usize, 2 + raw.len());
        fx.pages.release_page(2).unwrap();
    }

    #[test]
    fn test_unlogged_trailing_pages_are_dropped() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir);
        fx.pages.new_page(&Page::init_raw()).unwrap();
        fx.pages.new_page(&Page::init_raw()).unwrap();
        assert_eq!(fx.pages.page_count(), 4);

        let xid = fx.ledger.begin().unwrap();
        fx.wal
            .log(&LogRecord::insert(xid, 2, 2, wrap_raw(b"x")).encode())
            .unwrap();
        fx.ledger.commit(xid).unwrap();

        recover(&fx.ledger, &fx.wal, &fx.pages).unwrap();
        assert_eq!(fx.pages.page_count(), 2);
    }
}
