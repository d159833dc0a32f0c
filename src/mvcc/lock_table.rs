//! Row lock table with deadlock detection
//!
//! Transactions take exclusive ownership of record uids for their whole
//! lifetime (released at commit/abort). The table keeps an explicit wait-for
//! graph; each transaction waits for at most one uid at a time, so the graph
//! is a union of chains and deadlock detection is a stamped walk along them.
//! A caller that must wait receives a [`WaitGate`] to block on; the gate is
//! opened by whichever transaction hands the uid over.

use crate::txn::Xid;
use crate::storage::Uid;
use crate::{KeelError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// One-shot gate a waiting transaction blocks on until its lock is granted.
pub struct WaitGate {
    granted: Mutex<bool>,
    cond: Condvar,
}

impl WaitGate {
    fn new() -> Self {
        Self {
            granted: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Block until the contested uid has been granted to this transaction.
    pub fn wait(&self) {
        let mut granted = self.granted.lock();
        while !*granted {
            self.cond.wait(&mut granted);
        }
    }

    fn open(&self) {
        *self.granted.lock() = true;
        self.cond.notify_one();
    }
}

#[derive(Default)]
struct Graph {
    /// Uids each transaction currently owns.
    holds: HashMap<Xid, Vec<Uid>>,
    /// Owner of each granted uid.
    granted: HashMap<Uid, Xid>,
    /// Queued waiters per uid, in arrival order.
    waiters: HashMap<Uid, VecDeque<Xid>>,
    /// The single uid each waiting transaction is blocked on.
    waiting_on: HashMap<Xid, Uid>,
    /// Gate per waiting transaction.
    gates: HashMap<Xid, Arc<WaitGate>>,
}

impl Graph {
    /// Walk the wait-for chains; a chain that returns to a node stamped in
    /// the current walk is a cycle.
    fn has_cycle(&self) -> bool {
        let mut stamps: HashMap<Xid, u32> = HashMap::new();
        let mut stamp = 0u32;

        for &start in self.holds.keys() {
            if stamps.contains_key(&start) {
                continue;
            }
            stamp += 1;
            let mut xid = start;
            loop {
                match stamps.get(&xid) {
                    Some(&s) if s == stamp => return true,
                    Some(_) => break,
                    None => {}
                }
                stamps.insert(xid, stamp);

                let Some(&uid) = self.waiting_on.get(&xid) else {
                    break;
                };
                let Some(&owner) = self.granted.get(&uid) else {
                    break;
                };
                xid = owner;
            }
        }
        false
    }

    /// Hand a released uid to its next live waiter, skipping transactions
    /// that have since vanished from the table.
    fn promote(&mut self, uid: Uid) {
        self.granted.remove(&uid);
        let Some(queue) = self.waiters.get_mut(&uid) else {
            return;
        };

        while let Some(next) = queue.pop_front() {
            let Some(gate) = self.gates.remove(&next) else {
                continue;
            };
            self.granted.insert(uid, next);
            self.holds.entry(next).or_default().push(uid);
            self.waiting_on.remove(&next);
            gate.open();
            break;
        }

        if self.waiters.get(&uid).is_some_and(|q| q.is_empty()) {
            self.waiters.remove(&uid);
        }
    }
}

#[derive(Default)]
pub struct LockTable {
    graph: Mutex<Graph>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request `uid` for `xid`.
    ///
    /// Returns `None` when the lock is held already or granted immediately;
    /// a [`WaitGate`] to block on when someone else owns it; or
    /// [`KeelError::Deadlock`] when waiting would close a cycle (the wait
    /// edge is rolled back before returning).
    pub fn add(&self, xid: Xid, uid: Uid) -> Result<Option<Arc<WaitGate>>> {
        let mut graph = self.graph.lock();

        if graph.holds.get(&xid).is_some_and(|uids| uids.contains(&uid)) {
            return Ok(None);
        }

        if !graph.granted.contains_key(&uid) {
            graph.granted.insert(uid, xid);
            graph.holds.entry(xid).or_default().push(uid);
            return Ok(None);
        }

        graph.waiting_on.insert(xid, uid);
        graph.waiters.entry(uid).or_default().push_back(xid);
        if graph.has_cycle() {
            graph.waiting_on.remove(&xid);
            if let Some(queue) = graph.waiters.get_mut(&uid) {
                queue.retain(|&waiter| waiter != xid);
            }
            if graph.waiters.get(&uid).is_some_and(|q| q.is_empty()) {
                graph.waiters.remove(&uid);
            }
            return Err(KeelError::Deadlock);
        }

        let gate = Arc::new(WaitGate::new());
        graph.gates.insert(xid, gate.clone());
        Ok(Some(gate))
    }

    /// Release everything `xid` owns and drop it from the graph, promoting
    /// the next waiter of each freed uid.
    pub fn remove(&self, xid: Xid) {
        let mut graph = self.graph.lock();

        if let Some(uids) = graph.holds.remove(&xid) {
            for uid in uids {
                graph.promote(uid);
            }
        }
        graph.waiting_on.remove(&xid);
        graph.gates.remove(&xid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_free_uid_granted_immediately() {
        let table = LockTable::new();
        assert!(table.add(1, 100).unwrap().is_none());
        // Re-requesting an owned uid is a no-op.
        assert!(table.add(1, 100).unwrap().is_none());
    }

    #[test]
    fn test_contended_uid_waits_until_release() {
        let table = Arc::new(LockTable::new());
        table.add(1, 100).unwrap();

        let gate = table.add(2, 100).unwrap().expect("must wait");

        let waiter = {
            let gate = gate.clone();
            thread::spawn(move || gate.wait())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        table.remove(1);
        waiter.join().unwrap();

        // Ownership moved to the waiter: a third transaction queues.
        assert!(table.add(3, 100).unwrap().is_some());
    }

    #[test]
    fn test_opposite_order_requests_deadlock() {
        let table = LockTable::new();
        table.add(1, 100).unwrap();
        table.add(2, 200).unwrap();

        // 2 waits for 100 (held by 1); 1 then asks for 200 (held by 2).
        assert!(table.add(2, 100).unwrap().is_some());
        assert!(matches!(table.add(1, 200), Err(KeelError::Deadlock)));

        // The failed edge was rolled back: releasing 1 unblocks 2.
        table.remove(1);
        let graph = table.graph.lock();
        assert_eq!(graph.granted.get(&100), Some(&2));
    }

    #[test]
    fn test_three_party_cycle() {
        let table = LockTable::new();
        table.add(1, 100).unwrap();
        table.add(2, 200).unwrap();
        table.add(3, 300).unwrap();

        assert!(table.add(1, 200).unwrap().is_some());
        assert!(table.add(2, 300).unwrap().is_some());
        assert!(matches!(table.add(3, 100), Err(KeelError::Deadlock)));
    }

    #[test]
    fn test_remove_skips_vanished_waiters() {
        let table = LockTable::new();
        table.add(1, 100).unwrap();
        table.add(2, 100).unwrap().expect("2 waits");
        table.add(3, 100).unwrap().expect("3 waits");

        // 2 gives up (e.g. aborted) before the uid frees up.
        table.remove(2);
        table.remove(1);

        let graph = table.graph.lock();
        assert_eq!(graph.granted.get(&100), Some(&3));
    }

    #[test]
    fn test_release_hands_over_in_fifo_order() {
        let table = Arc::new(LockTable::new());
        table.add(1, 100).unwrap();

        let g2 = table.add(2, 100).unwrap().unwrap();
        let g3 = table.add(3, 100).unwrap().unwrap();

        table.remove(1);
        g2.wait();
        {
            let graph = table.graph.lock();
            assert_eq!(graph.granted.get(&100), Some(&2));
        }

        table.remove(2);
        g3.wait();
        let graph = table.graph.lock();
        assert_eq!(graph.granted.get(&100), Some(&3));
    }
}
