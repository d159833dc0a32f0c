//! Page layout and in-memory page state
//!
//! A page is an 8 KiB block owned by the page cache. Ordinary pages carry a
//! 2-byte free-space offset (FSO) followed by densely packed records; the
//! FSO only ever grows, so space freed by a logical delete is abandoned, not
//! compacted. Page 1 is reserved for metadata: a random "open" stamp written
//! at startup to bytes [100, 108) and copied to [108, 116) on clean
//! shutdown. A mismatch on reopen signals that the previous run crashed.

use parking_lot::RwLock;
use rand::RngCore;

pub const PAGE_SIZE: usize = 8192;

const OF_FREE: usize = 0;
const OF_DATA: usize = 2;

/// Usable bytes on an ordinary page.
pub const MAX_FREE_SPACE: usize = PAGE_SIZE - OF_DATA;

const STAMP_OFFSET: usize = 100;
const STAMP_LEN: usize = 8;

struct PageInner {
    data: Box<[u8]>,
    dirty: bool,
}

pub struct Page {
    pgno: u32,
    inner: RwLock<PageInner>,
}

impl Page {
    pub fn new(pgno: u32, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        Self {
            pgno,
            inner: RwLock::new(PageInner {
                data: data.into_boxed_slice(),
                dirty: false,
            }),
        }
    }

    pub fn pgno(&self) -> u32 {
        self.pgno
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.read().dirty
    }

    /// Read access to the page bytes.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let inner = self.inner.read();
        f(&inner.data)
    }

    /// Write access. The page is marked dirty before the closure runs, so a
    /// mutation can never slip out through the cache unflushed.
    pub fn update<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut inner = self.inner.write();
        inner.dirty = true;
        f(&mut inner.data)
    }

    /// Copy of the current bytes, for writing to disk.
    pub fn data_copy(&self) -> Vec<u8> {
        self.inner.read().data.to_vec()
    }

    /// If dirty, clear the flag and return a copy to flush; otherwise `None`.
    pub fn take_dirty_copy(&self) -> Option<Vec<u8>> {
        let mut inner = self.inner.write();
        if !inner.dirty {
            return None;
        }
        inner.dirty = false;
        Some(inner.data.to_vec())
    }

    // --- ordinary data pages -------------------------------------------------

    /// Zeroed page bytes with the FSO pointing at the first usable byte.
    pub fn init_raw() -> Vec<u8> {
        let mut raw = vec![0u8; PAGE_SIZE];
        set_fso_raw(&mut raw, OF_DATA as u16);
        raw
    }

    pub fn fso(&self) -> u16 {
        self.with_data(|d| fso_raw(d))
    }

    pub fn free_space(&self) -> usize {
        PAGE_SIZE - self.fso() as usize
    }

    /// Append a record at the FSO, advance it, and return the offset the
    /// record landed at.
    pub fn append_record(&self, raw: &[u8]) -> u16 {
        self.update(|data| {
            let offset = fso_raw(data);
            data[offset as usize..offset as usize + raw.len()].copy_from_slice(raw);
            set_fso_raw(data, offset + raw.len() as u16);
            offset
        })
    }

    /// Recovery writer for INSERT entries: rewrite the raw bytes at the
    /// logged offset and push the FSO forward if the record ends past it.
    pub fn recover_insert(&self, raw: &[u8], offset: u16) {
        self.update(|data| {
            data[offset as usize..offset as usize + raw.len()].copy_from_slice(raw);
            let end = offset + raw.len() as u16;
            if fso_raw(data) < end {
                set_fso_raw(data, end);
            }
        });
    }

    /// Recovery writer for UPDATE entries: rewrite in place, FSO untouched.
    pub fn recover_update(&self, raw: &[u8], offset: u16) {
        self.update(|data| {
            data[offset as usize..offset as usize + raw.len()].copy_from_slice(raw);
        });
    }

    // --- page one ------------------------------------------------------------

    /// Metadata-page bytes carrying a fresh open stamp.
    pub fn init_page_one_raw() -> Vec<u8> {
        let mut raw = vec![0u8; PAGE_SIZE];
        rand::thread_rng().fill_bytes(&mut raw[STAMP_OFFSET..STAMP_OFFSET + STAMP_LEN]);
        raw
    }

    /// Write a fresh random open stamp (startup).
    pub fn set_open_stamp(&self) {
        self.update(|data| {
            rand::thread_rng().fill_bytes(&mut data[STAMP_OFFSET..STAMP_OFFSET + STAMP_LEN]);
        });
    }

    /// Copy the open stamp into the clean-shutdown slot (close).
    pub fn set_close_stamp(&self) {
        self.update(|data| {
            data.copy_within(
                STAMP_OFFSET..STAMP_OFFSET + STAMP_LEN,
                STAMP_OFFSET + STAMP_LEN,
            );
        });
    }

    /// True when the previous shutdown copied the stamp, i.e. was clean.
    pub fn stamp_clean(&self) -> bool {
        self.with_data(|data| {
            data[STAMP_OFFSET..STAMP_OFFSET + STAMP_LEN]
                == data[STAMP_OFFSET + STAMP_LEN..STAMP_OFFSET + 2 * STAMP_LEN]
        })
    }
}

fn fso_raw(raw: &[u8]) -> u16 {
    u16::from_be_bytes([raw[OF_FREE], raw[OF_FREE + 1]])
}

fn set_fso_raw(raw: &mut [u8], fso: u16) {
    raw[OF_FREE..OF_DATA].copy_from_slice(&fso.to_be_bytes());
}
