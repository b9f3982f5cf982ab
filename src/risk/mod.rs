pub mod ledger;

pub use ledger::{AccountLedger, LedgerSnapshot};
