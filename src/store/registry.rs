//! Xid to internal transaction id registry.

use dashmap::DashMap;

use crate::transaction::Xid;

/// Concurrent mapping of prepared Xids to their store-local ids.
#[derive(Debug, Default)]
pub struct XidRegistry {
    entries: DashMap<Xid, i64>,
}

impl XidRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, xid: &Xid) -> Option<i64> {
        self.entries.get(xid).map(|entry| *entry)
    }

    pub fn contains(&self, xid: &Xid) -> bool {
        self.entries.contains_key(xid)
    }

    pub fn insert(&self, xid: Xid, internal_id: i64) -> Option<i64> {
        self.entries.insert(xid, internal_id)
    }

    pub fn remove(&self, xid: &Xid) -> Option<i64> {
        self.entries.remove(xid).map(|(_, id)| id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn xids(&self) -> Vec<Xid> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }
}
