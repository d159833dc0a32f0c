//! Snapshot visibility rules
//!
//! Pure predicates over a version's `(xmin, xmax)` pair, the transaction
//! asking, and the ledger's final word on commit status.

use crate::mvcc::transaction::{IsolationLevel, Transaction};
use crate::txn::{TransactionLedger, Xid};
use crate::Result;

pub fn is_visible(
    ledger: &TransactionLedger,
    txn: &Transaction,
    xmin: Xid,
    xmax: Xid,
) -> Result<bool> {
    match txn.level {
        IsolationLevel::ReadCommitted => read_committed(ledger, txn, xmin, xmax),
        IsolationLevel::RepeatableRead => repeatable_read(ledger, txn, xmin, xmax),
    }
}

/// Read committed: a version is visible when this transaction created it and
/// has not deleted it, or when its creator committed and it is either
/// undeleted or deleted by some other, still-uncommitted transaction.
fn read_committed(
    ledger: &TransactionLedger,
    txn: &Transaction,
    xmin: Xid,
    xmax: Xid,
) -> Result<bool> {
    if xmin == txn.xid && xmax == 0 {
        return Ok(true);
    }

    if ledger.is_committed(xmin)? {
        if xmax == 0 {
            return Ok(true);
        }
        if xmax != txn.xid && !ledger.is_committed(xmax)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Repeatable read additionally pins the view to the transaction's start:
/// the creator must have committed before this transaction began (smaller
/// xid, not in the snapshot), and a delete only hides the version if its
/// author also committed before that point.
fn repeatable_read(
    ledger: &TransactionLedger,
    txn: &Transaction,
    xmin: Xid,
    xmax: Xid,
) -> Result<bool> {
    if xmin == txn.xid && xmax == 0 {
        return Ok(true);
    }

    if ledger.is_committed(xmin)? && xmin < txn.xid && !txn.in_snapshot(xmin) {
        if xmax == 0 {
            return Ok(true);
        }
        if xmax != txn.xid
            && (!ledger.is_committed(xmax)? || xmax > txn.xid || txn.in_snapshot(xmax))
        {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Version-skip guard for repeatable read: true when the version was deleted
/// by a transaction this one cannot have legitimately observed: one that
/// committed after this transaction began, or one that is still active and
/// is not this transaction itself. Converted into a forced abort by the
/// caller rather than silently missing the delete.
pub fn is_version_skip(
    ledger: &TransactionLedger,
    txn: &Transaction,
    xmax: Xid,
) -> Result<bool> {
    if txn.level == IsolationLevel::ReadCommitted {
        return Ok(false);
    }
    if ledger.is_committed(xmax)? && (xmax > txn.xid || txn.in_snapshot(xmax)) {
        return Ok(true);
    }
    Ok(ledger.is_active(xmax)? && xmax != txn.xid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ledger(dir: &TempDir) -> TransactionLedger {
        TransactionLedger::create(dir.path().join("t.xid")).unwrap()
    }

    fn txn(xid: Xid, level: IsolationLevel, active: &[Xid]) -> Transaction {
        Transaction::new(xid, level, active.iter().copied())
    }

    #[test]
    fn test_own_undeleted_version_is_visible() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        let a = ledger.begin().unwrap();

        let t = txn(a, IsolationLevel::ReadCommitted, &[]);
        assert!(is_visible(&ledger, &t, a, 0).unwrap());
        // Deleted by itself: no longer visible.
        assert!(!is_visible(&ledger, &t, a, a).unwrap());
    }

    #[test]
    fn test_read_committed_ignores_uncommitted_writers() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        let writer = ledger.begin().unwrap();
        let reader = ledger.begin().unwrap();
        let t = txn(reader, IsolationLevel::ReadCommitted, &[]);

        // Uncommitted insert is invisible, committed insert is visible.
        assert!(!is_visible(&ledger, &t, writer, 0).unwrap());
        ledger.commit(writer).unwrap();
        assert!(is_visible(&ledger, &t, writer, 0).unwrap());
    }

    #[test]
    fn test_read_committed_sees_through_uncommitted_delete() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        let creator = ledger.begin().unwrap();
        ledger.commit(creator).unwrap();
        let deleter = ledger.begin().unwrap();
        let reader = ledger.begin().unwrap();
        let t = txn(reader, IsolationLevel::ReadCommitted, &[]);

        // A pending delete does not hide the version...
        assert!(is_visible(&ledger, &t, creator, deleter).unwrap());
        // ...until it commits.
        ledger.commit(deleter).unwrap();
        assert!(!is_visible(&ledger, &t, creator, deleter).unwrap());
    }

    #[test]
    fn test_repeatable_read_pins_the_snapshot() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);

        // `writer` is active when `reader` begins, then commits.
        let writer = ledger.begin().unwrap();
        let reader = ledger.begin().unwrap();
        let t = txn(reader, IsolationLevel::RepeatableRead, &[writer]);

        ledger.commit(writer).unwrap();
        // Read committed would see it now; repeatable read must not.
        assert!(!is_visible(&ledger, &t, writer, 0).unwrap());

        // A transaction with a larger xid is invisible even when committed.
        let later = ledger.begin().unwrap();
        ledger.commit(later).unwrap();
        assert!(!is_visible(&ledger, &t, later, 0).unwrap());
    }

    #[test]
    fn test_repeatable_read_ignores_later_deletes() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        let creator = ledger.begin().unwrap();
        ledger.commit(creator).unwrap();

        let reader = ledger.begin().unwrap();
        let t = txn(reader, IsolationLevel::RepeatableRead, &[]);

        // Deleted by a transaction that began (and committed) after the
        // reader: the reader's view stays stable.
        let deleter = ledger.begin().unwrap();
        ledger.commit(deleter).unwrap();
        assert!(is_visible(&ledger, &t, creator, deleter).unwrap());
    }

    #[test]
    fn test_super_xid_writes_are_always_visible() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        let reader = ledger.begin().unwrap();

        let t = txn(reader, IsolationLevel::RepeatableRead, &[]);
        assert!(is_visible(&ledger, &t, crate::txn::SUPER_XID, 0).unwrap());
    }

    #[test]
    fn test_version_skip() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        let reader = ledger.begin().unwrap();
        let t = txn(reader, IsolationLevel::RepeatableRead, &[]);

        // Deleted by a later transaction that committed after `t` began.
        let later = ledger.begin().unwrap();
        ledger.commit(later).unwrap();
        assert!(is_version_skip(&ledger, &t, later).unwrap());

        // Still-active foreign deleter counts too.
        let active = ledger.begin().unwrap();
        assert!(is_version_skip(&ledger, &t, active).unwrap());

        // Own delete and undeleted versions never skip.
        assert!(!is_version_skip(&ledger, &t, reader).unwrap());
        assert!(!is_version_skip(&ledger, &t, 0).unwrap());

        // Read committed never reports a skip.
        let rc = txn(reader, IsolationLevel::ReadCommitted, &[]);
        assert!(!is_version_skip(&ledger, &rc, later).unwrap());
    }
}
