//! Write-Ahead Log
//!
//! File layout: `[XChecksum: u32][Entry]* [BadTail]`, each entry being
//! `[Size: u32][Checksum: u32][Data]`. The per-entry checksum folds over the
//! data seeded with 0; `XChecksum` folds over every encoded entry in order,
//! seeded with the previous running value, and is rewritten after every
//! append. A crash can leave a bad tail: a partially written entry, or
//! entries appended before the running checksum made it to disk. The open
//! path verifies the whole file and trims exactly that tail; a corrupt entry
//! that is *not* the tail is unrecoverable.

use crate::{KeelError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

const SEED: u32 = 13331;

/// File header: the running checksum.
const OF_ENTRIES: u64 = 4;

/// Per-entry header: size + checksum.
const OF_DATA: u64 = 8;

fn fold(mut acc: u32, bytes: &[u8]) -> u32 {
    for &b in bytes {
        acc = acc.wrapping_mul(SEED).wrapping_add(b as u32);
    }
    acc
}

struct WalFile {
    file: File,
    /// Read cursor for `next()`.
    position: u64,
    file_size: u64,
    /// Running checksum over every entry, as last persisted.
    xchecksum: u32,
}

enum Parsed {
    Entry { raw: Vec<u8> },
    /// Remaining bytes cannot hold a complete, valid entry.
    Tail,
    /// A complete entry whose checksum fails, with more log after it.
    Corrupt,
}

impl WalFile {
    fn read_exact_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    /// Parse one entry at the cursor without advancing it.
    fn parse_entry(&mut self) -> Result<Parsed> {
        if self.position + OF_DATA >= self.file_size {
            return Ok(Parsed::Tail);
        }

        let mut size_buf = [0u8; 4];
        self.read_exact_at(self.position, &mut size_buf)?;
        let size = u32::from_be_bytes(size_buf) as u64;

        if self.position + OF_DATA + size > self.file_size {
            return Ok(Parsed::Tail);
        }

        let mut raw = vec![0u8; (OF_DATA + size) as usize];
        self.read_exact_at(self.position, &mut raw)?;

        let stored = u32::from_be_bytes(raw[4..8].try_into().unwrap());
        if fold(0, &raw[OF_DATA as usize..]) != stored {
            if self.position + OF_DATA + size == self.file_size {
                // Torn write of the final entry.
                return Ok(Parsed::Tail);
            }
            return Ok(Parsed::Corrupt);
        }
        Ok(Parsed::Entry { raw })
    }

    fn write_xchecksum(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.xchecksum.to_be_bytes())?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Verify every entry against the running checksum, discarding the bad
    /// tail a crash may have left. A checksum failure strictly inside the
    /// verified prefix is fatal corruption.
    fn check_and_trim(&mut self) -> Result<()> {
        self.position = OF_ENTRIES;
        let mut acc = 0u32;

        loop {
            match self.parse_entry()? {
                Parsed::Entry { raw } => {
                    acc = fold(acc, &raw);
                    self.position += raw.len() as u64;
                }
                Parsed::Tail => break,
                Parsed::Corrupt => {
                    return Err(KeelError::CorruptLogFile(format!(
                        "checksum mismatch at offset {}",
                        self.position
                    )));
                }
            }
        }

        if self.position < self.file_size {
            let trimmed = self.file_size - self.position;
            eprintln!("log open: discarding {} bytes of bad tail", trimmed);
            self.file.set_len(self.position)?;
            self.file.sync_all()?;
            self.file_size = self.position;
        }

        // Entries appended before the running checksum reached disk are now
        // part of the accepted prefix; persist the recomputed value.
        if acc != self.xchecksum {
            self.xchecksum = acc;
            self.write_xchecksum()?;
        }

        self.position = OF_ENTRIES;
        Ok(())
    }
}

/// Append-only checksummed log file.
pub struct WriteAheadLog {
    inner: Mutex<WalFile>,
}

impl WriteAheadLog {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.write_all(&0u32.to_be_bytes())?;
        file.sync_all()?;

        Ok(Self {
            inner: Mutex::new(WalFile {
                file,
                position: OF_ENTRIES,
                file_size: OF_ENTRIES,
                xchecksum: 0,
            }),
        })
    }

    /// Open an existing log, verifying it and trimming any bad tail.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let file_size = file.metadata()?.len();
        if file_size < OF_ENTRIES {
            return Err(KeelError::CorruptLogFile(format!(
                "file is {} bytes, shorter than the header",
                file_size
            )));
        }

        let mut header = [0u8; 4];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;

        let mut inner = WalFile {
            file,
            position: OF_ENTRIES,
            file_size,
            xchecksum: u32::from_be_bytes(header),
        };
        inner.check_and_trim()?;

        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Append one entry and force it, together with the updated running
    /// checksum, to disk before returning.
    pub fn log(&self, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();

        let mut raw = Vec::with_capacity(OF_DATA as usize + data.len());
        raw.extend_from_slice(&(data.len() as u32).to_be_bytes());
        raw.extend_from_slice(&fold(0, data).to_be_bytes());
        raw.extend_from_slice(data);

        let end = inner.file_size;
        inner.file.seek(SeekFrom::Start(end))?;
        inner.file.write_all(&raw)?;
        inner.file_size += raw.len() as u64;

        inner.xchecksum = fold(inner.xchecksum, &raw);
        inner.write_xchecksum()
    }

    /// Reset the read cursor to the first entry.
    pub fn rewind(&self) {
        self.inner.lock().position = OF_ENTRIES;
    }

    /// Sequentially read the next entry's data, or `None` at the end.
    pub fn next(&self) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();
        match inner.parse_entry()? {
            Parsed::Entry { raw } => {
                inner.position += raw.len() as u64;
                Ok(Some(raw[OF_DATA as usize..].to_vec()))
            }
            _ => Ok(None),
        }
    }

    /// Hard-truncate the file (recovery's tail trim only).
    pub fn truncate(&self, len: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.set_len(len)?;
        inner.file.sync_all()?;
        inner.file_size = len;
        inner.position = inner.position.min(len);
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.file.sync_all()?;
        Ok(())
    }
}
