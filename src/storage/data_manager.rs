//! Data manager
//!
//! Orchestrates the page store, the write-ahead log and the free-space index
//! into record-level `read`/`insert`, with a reference-counted record cache
//! keyed by uid. Opening an existing store verifies the log, runs redo/undo
//! recovery against the ledger and rebuilds the free-space index before any
//! record is served.

use crate::cache::{CacheSource, RefCache};
use crate::config::StoreConfig;
use crate::storage::free_space::FreeSpaceIndex;
use crate::storage::page::{Page, MAX_FREE_SPACE};
use crate::storage::page_store::PageStore;
use crate::storage::record::{wrap_raw, Record};
use crate::storage::recovery::{recover, LogRecord};
use crate::storage::wal::WriteAheadLog;
use crate::storage::{pack_uid, unpack_uid, Uid};
use crate::txn::{TransactionLedger, Xid};
use crate::{KeelError, Result};
use std::sync::Arc;

/// Loads records out of pinned pages; evicting a record drops its page pin.
struct RecordSource {
    pages: Arc<PageStore>,
}

impl CacheSource<Record> for RecordSource {
    fn load(&self, uid: u64) -> Result<Option<Record>> {
        let (pgno, offset) = unpack_uid(uid);
        // Page 1 holds no records; pages past the end do not exist.
        if pgno < 2 || pgno > self.pages.page_count() {
            return Ok(None);
        }
        let page = self.pages.get_page(pgno)?;
        match Record::parse(page, offset, uid) {
            Some(record) => Ok(Some(record)),
            None => {
                self.pages.release_page(pgno)?;
                Ok(None)
            }
        }
    }

    fn evict(&self, _uid: u64, record: &Record) -> Result<()> {
        self.pages.release_page(record.page().pgno())
    }
}

pub struct DataManager {
    ledger: Arc<TransactionLedger>,
    pages: Arc<PageStore>,
    wal: WriteAheadLog,
    free_index: FreeSpaceIndex,
    records: RefCache<Record, RecordSource>,
    page_one: Arc<Page>,
}

impl DataManager {
    /// Create a fresh store: page 1 is initialized with an open stamp.
    pub fn create(cfg: &StoreConfig, ledger: Arc<TransactionLedger>) -> Result<Self> {
        cfg.validate()?;
        let pages = Arc::new(PageStore::create(cfg.db_path(), cfg.cache_capacity())?);
        let wal = WriteAheadLog::create(cfg.log_path())?;

        let pgno = pages.new_page(&Page::init_page_one_raw())?;
        debug_assert_eq!(pgno, 1);
        let page_one = pages.get_page(1)?;

        Ok(Self::assemble(ledger, pages, wal, page_one))
    }

    /// Open an existing store: trim the log tail, run crash recovery, then
    /// stamp page 1 as open and rebuild the free-space index.
    pub fn open(cfg: &StoreConfig, ledger: Arc<TransactionLedger>) -> Result<Self> {
        cfg.validate()?;
        let pages = Arc::new(PageStore::open(cfg.db_path(), cfg.cache_capacity())?);
        let wal = WriteAheadLog::open(cfg.log_path())?;

        let page_one = pages.get_page(1)?;
        if !page_one.stamp_clean() {
            eprintln!("open: previous shutdown was not clean");
        }
        recover(&ledger, &wal, &pages)?;

        page_one.set_open_stamp();
        pages.flush_page(&page_one)?;

        let dm = Self::assemble(ledger, pages, wal, page_one);
        dm.fill_free_index()?;
        Ok(dm)
    }

    fn assemble(
        ledger: Arc<TransactionLedger>,
        pages: Arc<PageStore>,
        wal: WriteAheadLog,
        page_one: Arc<Page>,
    ) -> Self {
        let records = RefCache::new(
            RecordSource {
                pages: pages.clone(),
            },
            0,
        );
        Self {
            ledger,
            pages,
            wal,
            free_index: FreeSpaceIndex::new(),
            records,
            page_one,
        }
    }

    /// Walk every data page and file its current free space.
    fn fill_free_index(&self) -> Result<()> {
        for pgno in 2..=self.pages.page_count() {
            let page = self.pages.get_page(pgno)?;
            self.free_index.add(pgno, page.free_space());
            self.pages.release_page(pgno)?;
        }
        Ok(())
    }

    /// Fetch a record by uid. A record whose valid flag marks it deleted is
    /// reported absent.
    pub fn read(&self, uid: Uid) -> Result<Option<Arc<Record>>> {
        let Some(record) = self.records.get(uid)? else {
            return Ok(None);
        };
        if !record.is_valid() {
            self.records.release(uid)?;
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Insert a payload and return its uid. The INSERT entry reaches the WAL
    /// before the page is touched.
    pub fn insert(&self, xid: Xid, data: &[u8]) -> Result<Uid> {
        let raw = wrap_raw(data);
        if raw.len() > MAX_FREE_SPACE {
            return Err(KeelError::DataTooLarge(data.len()));
        }

        let mut chosen = None;
        for _ in 0..5 {
            if let Some(space) = self.free_index.select(raw.len()) {
                chosen = Some(space);
                break;
            }
            let pgno = self.pages.new_page(&Page::init_raw())?;
            self.free_index.add(pgno, MAX_FREE_SPACE);
        }
        let Some(space) = chosen else {
            return Err(KeelError::DataTooLarge(data.len()));
        };

        let page = self.pages.get_page(space.pgno)?;
        let outcome = (|| {
            self.wal
                .log(&LogRecord::insert(xid, space.pgno, page.fso(), raw.clone()).encode())?;
            let offset = page.append_record(&raw);
            Ok(pack_uid(space.pgno, offset))
        })();

        // The page goes back into the index at its observed free space even
        // when the insert failed; a checked-out page must never be lost.
        self.free_index.add(space.pgno, page.free_space());
        self.pages.release_page(space.pgno)?;
        outcome
    }

    /// Drop one reference to a cached record.
    pub fn release(&self, record: &Record) -> Result<()> {
        self.records.release(record.uid())
    }

    /// Append an UPDATE entry for an in-place mutation. Called by the record
    /// write bracket before it releases its lock.
    pub fn log_update(&self, xid: Xid, uid: Uid, old_raw: &[u8], new_raw: &[u8]) -> Result<()> {
        self.wal
            .log(&LogRecord::update(xid, uid, old_raw.to_vec(), new_raw.to_vec()).encode())
    }

    pub fn ledger(&self) -> &Arc<TransactionLedger> {
        &self.ledger
    }

    /// Flush everything and stamp page 1 as cleanly shut down.
    pub fn close(&self) -> Result<()> {
        self.records.close()?;
        self.wal.close()?;

        self.page_one.set_close_stamp();
        self.pages.flush_page(&self.page_one)?;
        self.pages.release_page(1)?;
        self.pages.close()
    }
}
