mod checkpoint;
mod connection;
mod freelist;
mod transaction;

pub use connection::Pager;
pub use transaction::{Snapshot, TransactionState};
