//! Page store: the `.db` file plus a reference-counted page cache
//!
//! Pages are 1-based; page `n` lives at file offset `(n - 1) * PAGE_SIZE`.
//! Newly allocated pages are force-written before their number is handed
//! out, so a page number never refers to storage that could vanish in a
//! crash. Cached pages are pinned by `get_page` and flushed when their last
//! reference is released.

use crate::cache::{CacheSource, RefCache};
use crate::config::MIN_CACHE_PAGES;
use crate::storage::page::{Page, PAGE_SIZE};
use crate::{KeelError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub struct PageFile {
    file: Mutex<File>,
    page_count: AtomicU32,
}

impl PageFile {
    fn page_offset(pgno: u32) -> u64 {
        (pgno as u64 - 1) * PAGE_SIZE as u64
    }

    /// Read a page's bytes; anything past the end of the file reads as
    /// zeroes (a freshly extended file may not have been written yet).
    fn read_page(&self, pgno: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(Self::page_offset(pgno)))?;

        let mut filled = 0;
        while filled < PAGE_SIZE {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(buf)
    }

    fn write_page(&self, pgno: u32, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(Self::page_offset(pgno)))?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }
}

impl CacheSource<Page> for PageFile {
    fn load(&self, key: u64) -> Result<Option<Page>> {
        let pgno = key as u32;
        Ok(Some(Page::new(pgno, self.read_page(pgno)?)))
    }

    fn evict(&self, _key: u64, page: &Page) -> Result<()> {
        if let Some(data) = page.take_dirty_copy() {
            self.write_page(page.pgno(), &data)?;
        }
        Ok(())
    }
}

pub struct PageStore {
    cache: RefCache<Page, PageFile>,
}

impl PageStore {
    pub fn create<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;
        Self::with_file(file, capacity)
    }

    pub fn open<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::with_file(file, capacity)
    }

    fn with_file(file: File, capacity: usize) -> Result<Self> {
        if capacity < MIN_CACHE_PAGES {
            return Err(KeelError::MemTooSmall(
                capacity * PAGE_SIZE,
                MIN_CACHE_PAGES,
            ));
        }

        let len = file.metadata()?.len();
        let page_count = (len / PAGE_SIZE as u64) as u32;

        let source = PageFile {
            file: Mutex::new(file),
            page_count: AtomicU32::new(page_count),
        };
        Ok(Self {
            cache: RefCache::new(source, capacity),
        })
    }

    /// Allocate the next page number and force-write its initial bytes.
    pub fn new_page(&self, init: &[u8]) -> Result<u32> {
        debug_assert_eq!(init.len(), PAGE_SIZE);
        let pgno = self.cache.source().page_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.cache.source().write_page(pgno, init)?;
        Ok(pgno)
    }

    /// Pin a page. Every `get_page` must be paired with a `release_page`.
    pub fn get_page(&self, pgno: u32) -> Result<Arc<Page>> {
        let page = self.cache.get(pgno as u64)?;
        Ok(page.expect("page reads never report absence"))
    }

    /// Unpin a page; the last release flushes it if dirty.
    pub fn release_page(&self, pgno: u32) -> Result<()> {
        self.cache.release(pgno as u64)
    }

    /// Force a page's current bytes to disk immediately.
    pub fn flush_page(&self, page: &Page) -> Result<()> {
        let data = page
            .take_dirty_copy()
            .unwrap_or_else(|| page.data_copy());
        self.cache.source().write_page(page.pgno(), &data)
    }

    /// Drop every page past `max_pgno` (recovery trims pages that were
    /// allocated but never survive in the log).
    pub fn truncate_to(&self, max_pgno: u32) -> Result<()> {
        let source = self.cache.source();
        let file = source.file.lock();
        file.set_len(max_pgno as u64 * PAGE_SIZE as u64)?;
        file.sync_all()?;
        source.page_count.store(max_pgno, Ordering::SeqCst);
        Ok(())
    }

    pub fn page_count(&self) -> u32 {
        self.cache.source().page_count.load(Ordering::SeqCst)
    }

    pub fn close(&self) -> Result<()> {
        self.cache.close()?;
        self.cache.source().file.lock().sync_all()?;
        Ok(())
    }
}
