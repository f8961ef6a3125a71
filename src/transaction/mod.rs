//! Distributed transaction identifiers and the batch container a channel
//! hands to the message store.

mod data;
mod xid;

pub use data::{EnqueueEntry, TransactionData};
pub use xid::Xid;
