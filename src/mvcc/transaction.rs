//! Runtime transaction state

use crate::txn::{Xid, SUPER_XID};
use crate::KeelError;
use parking_lot::Mutex;
use std::collections::HashSet;

/// Isolation level, an integer at the outer interface: 0 is read committed,
/// anything else repeatable read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
}

impl From<u8> for IsolationLevel {
    fn from(level: u8) -> Self {
        if level == 0 {
            IsolationLevel::ReadCommitted
        } else {
            IsolationLevel::RepeatableRead
        }
    }
}

/// A fault recorded on a transaction. It forces the transaction into the
/// auto-aborted state and resurfaces on every later operation until the
/// caller aborts explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnFault {
    Deadlock,
    ConcurrentUpdate,
}

impl From<TxnFault> for KeelError {
    fn from(fault: TxnFault) -> Self {
        match fault {
            TxnFault::Deadlock => KeelError::Deadlock,
            TxnFault::ConcurrentUpdate => KeelError::ConcurrentUpdate,
        }
    }
}

#[derive(Debug, Default)]
struct TxnState {
    fault: Option<TxnFault>,
    auto_aborted: bool,
}

#[derive(Debug)]
pub struct Transaction {
    pub xid: Xid,
    pub level: IsolationLevel,

    /// Xids active at the moment this transaction began; captured only for
    /// repeatable read and immutable afterwards.
    snapshot: Option<HashSet<Xid>>,

    state: Mutex<TxnState>,
}

impl Transaction {
    pub fn new(xid: Xid, level: IsolationLevel, active: impl Iterator<Item = Xid>) -> Self {
        let snapshot = match level {
            IsolationLevel::ReadCommitted => None,
            IsolationLevel::RepeatableRead => Some(active.collect()),
        };
        Self {
            xid,
            level,
            snapshot,
            state: Mutex::new(TxnState::default()),
        }
    }

    /// Was `xid` active when this transaction began? The super transaction
    /// is never considered in-snapshot.
    pub fn in_snapshot(&self, xid: Xid) -> bool {
        if xid == SUPER_XID {
            return false;
        }
        self.snapshot
            .as_ref()
            .map_or(false, |snapshot| snapshot.contains(&xid))
    }

    pub fn fault(&self) -> Option<TxnFault> {
        self.state.lock().fault
    }

    pub fn set_fault(&self, fault: TxnFault) {
        self.state.lock().fault = Some(fault);
    }

    pub fn auto_aborted(&self) -> bool {
        self.state.lock().auto_aborted
    }

    pub fn set_auto_aborted(&self) {
        self.state.lock().auto_aborted = true;
    }
}
