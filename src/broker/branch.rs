//! Distributed transaction branch bookkeeping.

use std::collections::BTreeSet;

use crate::message::Message;
use crate::transaction::{TransactionData, Xid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BranchState {
    /// Accepting staged operations
    Active,
    /// Durably prepared, awaiting commit or rollback
    Prepared,
}

/// Operations a transaction branch has staged so far.
///
/// `data` holds only what touches durable queues; the in-memory side is
/// staged directly on the queue handlers listed in `queues`.
#[derive(Debug)]
pub(crate) struct Branch {
    pub xid: Xid,
    pub state: BranchState,
    /// Rebuilt from the store at startup rather than started in this process
    pub recovered: bool,
    pub data: TransactionData,
    pub queues: BTreeSet<String>,
    /// Acknowledged messages, released on commit and redelivered on rollback
    pub detached: Vec<(String, Message)>,
}

impl Branch {
    pub fn new(xid: Xid) -> Self {
        Self {
            xid,
            state: BranchState::Active,
            recovered: false,
            data: TransactionData::new(),
            queues: BTreeSet::new(),
            detached: Vec::new(),
        }
    }

    pub fn recovered(xid: Xid) -> Self {
        Self {
            state: BranchState::Prepared,
            recovered: true,
            ..Self::new(xid)
        }
    }

    pub fn is_prepared(&self) -> bool {
        self.state == BranchState::Prepared
    }
}
