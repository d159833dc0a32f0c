//! Version manager: the transactional API surface
//!
//! Composes the transaction ledger, the data manager, the row lock table
//! and an entry cache into `begin`/`commit`/`abort` plus versioned
//! `read`/`insert`/`delete`. A transaction hit by a deadlock or a
//! version-skip is rolled back on the spot and left carrying a fault that
//! every later operation re-surfaces until the caller aborts it.

use crate::cache::{CacheSource, RefCache};
use crate::mvcc::entry::{self, Entry};
use crate::mvcc::lock_table::LockTable;
use crate::mvcc::transaction::{IsolationLevel, Transaction, TxnFault};
use crate::mvcc::visibility;
use crate::storage::{DataManager, Uid};
use crate::txn::{TransactionLedger, Xid, SUPER_XID};
use crate::{KeelError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

struct EntrySource {
    dm: Arc<DataManager>,
}

impl CacheSource<Entry> for EntrySource {
    fn load(&self, uid: u64) -> Result<Option<Entry>> {
        let Some(record) = self.dm.read(uid)? else {
            return Ok(None);
        };
        // A window too small for a version header is not an entry.
        if record.data().len() < entry::ENTRY_HEADER {
            self.dm.release(&record)?;
            return Ok(None);
        }
        Ok(Some(Entry::new(uid, record)))
    }

    fn evict(&self, _uid: u64, entry: &Entry) -> Result<()> {
        entry.release(&self.dm)
    }
}

pub struct VersionManager {
    ledger: Arc<TransactionLedger>,
    dm: Arc<DataManager>,
    entries: RefCache<Entry, EntrySource>,
    active: Mutex<HashMap<Xid, Arc<Transaction>>>,
    lock_table: LockTable,
}

impl VersionManager {
    pub fn new(ledger: Arc<TransactionLedger>, dm: Arc<DataManager>) -> Self {
        let mut active = HashMap::new();
        // The super transaction is permanently active so system-internal
        // writes are always visible and never rolled back.
        active.insert(
            SUPER_XID,
            Arc::new(Transaction::new(
                SUPER_XID,
                IsolationLevel::ReadCommitted,
                std::iter::empty(),
            )),
        );

        Self {
            ledger,
            entries: RefCache::new(EntrySource { dm: dm.clone() }, 0),
            dm,
            active: Mutex::new(active),
            lock_table: LockTable::new(),
        }
    }

    /// Start a transaction at the given isolation level. The repeatable-read
    /// snapshot is taken while the active map is locked, so it is consistent
    /// with the xid assignment.
    pub fn begin(&self, level: IsolationLevel) -> Result<Xid> {
        let mut active = self.active.lock();
        let xid = self.ledger.begin()?;
        let txn = Arc::new(Transaction::new(xid, level, active.keys().copied()));
        active.insert(xid, txn);
        Ok(xid)
    }

    /// Read a version's data, or `None` when it does not exist or is not
    /// visible to this transaction.
    pub fn read(&self, xid: Xid, uid: Uid) -> Result<Option<Vec<u8>>> {
        let txn = self.transaction(xid)?;
        self.check_fault(&txn)?;

        let Some(entry) = self.entries.get(uid)? else {
            return Ok(None);
        };
        let outcome = (|| {
            if visibility::is_visible(&self.ledger, &txn, entry.xmin(), entry.xmax())? {
                Ok(Some(entry.data()))
            } else {
                Ok(None)
            }
        })();
        self.entries.release(uid)?;
        outcome
    }

    /// Insert data as a version created by `xid`.
    pub fn insert(&self, xid: Xid, data: &[u8]) -> Result<Uid> {
        let txn = self.transaction(xid)?;
        self.check_fault(&txn)?;

        let raw = Entry::wrap(xid, data);
        self.dm.insert(xid, &raw)
    }

    /// Delete the version at `uid`. Returns false when there is nothing
    /// visible to delete; fails with [`KeelError::ConcurrentUpdate`] (and
    /// auto-aborts the transaction) on deadlock or version-skip.
    pub fn delete(&self, xid: Xid, uid: Uid) -> Result<bool> {
        let txn = self.transaction(xid)?;
        self.check_fault(&txn)?;

        let Some(entry) = self.entries.get(uid)? else {
            return Ok(false);
        };
        let outcome = self.delete_entry(&txn, &entry);
        self.entries.release(uid)?;
        outcome
    }

    fn delete_entry(&self, txn: &Arc<Transaction>, entry: &Entry) -> Result<bool> {
        if !visibility::is_visible(&self.ledger, txn, entry.xmin(), entry.xmax())? {
            return Ok(false);
        }

        match self.lock_table.add(txn.xid, entry.uid()) {
            Ok(None) => {}
            Ok(Some(gate)) => gate.wait(),
            Err(KeelError::Deadlock) => return self.force_abort(txn),
            Err(e) => return Err(e),
        }

        // With the row lock held the entry can no longer move under us;
        // re-check what happened while we were waiting.
        if entry.xmax() == txn.xid {
            return Ok(false);
        }
        if visibility::is_version_skip(&self.ledger, txn, entry.xmax())? {
            return self.force_abort(txn);
        }

        entry.set_xmax(txn.xid, &self.dm)?;
        Ok(true)
    }

    /// Commit `xid`. A transaction carrying a fault cannot commit; the fault
    /// is returned instead.
    pub fn commit(&self, xid: Xid) -> Result<()> {
        let txn = self.transaction(xid)?;
        if let Some(fault) = txn.fault() {
            return Err(fault.into());
        }

        self.active.lock().remove(&xid);
        self.lock_table.remove(xid);
        self.ledger.commit(xid)
    }

    /// Abort `xid` explicitly. A transaction that was already auto-aborted
    /// is only dropped from the active map, not rolled back twice.
    pub fn abort(&self, xid: Xid) -> Result<()> {
        self.intern_abort(xid, false)
    }

    fn intern_abort(&self, xid: Xid, auto: bool) -> Result<()> {
        let txn = {
            let mut active = self.active.lock();
            if auto {
                active.get(&xid).cloned()
            } else {
                active.remove(&xid)
            }
        };
        let Some(txn) = txn else {
            return Err(KeelError::TransactionNotActive(xid));
        };

        if txn.auto_aborted() {
            return Ok(());
        }
        self.lock_table.remove(xid);
        self.ledger.abort(xid)
    }

    /// Record the conflict on the transaction, roll it back and surface
    /// [`KeelError::ConcurrentUpdate`].
    fn force_abort(&self, txn: &Arc<Transaction>) -> Result<bool> {
        txn.set_fault(TxnFault::ConcurrentUpdate);
        self.intern_abort(txn.xid, true)?;
        txn.set_auto_aborted();
        Err(KeelError::ConcurrentUpdate)
    }

    fn transaction(&self, xid: Xid) -> Result<Arc<Transaction>> {
        self.active
            .lock()
            .get(&xid)
            .cloned()
            .ok_or(KeelError::TransactionNotActive(xid))
    }

    fn check_fault(&self, txn: &Arc<Transaction>) -> Result<()> {
        match txn.fault() {
            Some(fault) => Err(fault.into()),
            None => Ok(()),
        }
    }

    /// Flush the entry cache and shut the data layer down cleanly.
    pub fn close(&self) -> Result<()> {
        self.entries.close()?;
        self.dm.close()?;
        self.ledger.close()
    }
}
