//! Transaction ledger layer

pub mod ledger;

pub use ledger::{TransactionLedger, TxnStatus, Xid, SUPER_XID};
