//! Broker message model.
//!
//! A published message owns an immutable payload (metadata and content)
//! shared by every queue it was routed to, plus per-holder delivery
//! metadata. Each holder owns one [`Message`] value; dropping or
//! [`Message::release`]-ing it gives up that holder's reference.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Broker-internal message identifier, unique and monotonic per broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(u64);

impl MessageId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out message ids. Seeded past the highest stored id on recovery.
#[derive(Debug)]
pub struct MessageIdGenerator {
    next: AtomicU64,
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn next_id(&self) -> MessageId {
        MessageId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Make sure ids handed out from now on are greater than `seen`.
    pub fn advance_past(&self, seen: MessageId) {
        self.next.fetch_max(seen.0 + 1, Ordering::Relaxed);
    }
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Routing metadata attached at publish time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub exchange_name: String,
    pub routing_key: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl Metadata {
    pub fn new(exchange_name: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange_name: exchange_name.into(),
            routing_key: routing_key.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug)]
struct Payload {
    id: MessageId,
    metadata: Metadata,
    content: Vec<u8>,
    arrived_at: DateTime<Utc>,
}

/// A message as held by one queue, redelivery queue, or consumer.
pub struct Message {
    payload: Arc<Payload>,
    redelivery_count: u32,
    redelivered: bool,
}

impl Message {
    pub fn new(id: MessageId, metadata: Metadata, content: impl Into<Vec<u8>>) -> Self {
        Self::from_parts(id, metadata, content.into(), Utc::now())
    }

    /// Rebuild a message read back from the durable store.
    pub fn from_parts(
        id: MessageId,
        metadata: Metadata,
        content: Vec<u8>,
        arrived_at: DateTime<Utc>,
    ) -> Self {
        Self {
            payload: Arc::new(Payload {
                id,
                metadata,
                content,
                arrived_at,
            }),
            redelivery_count: 0,
            redelivered: false,
        }
    }

    pub fn id(&self) -> MessageId {
        self.payload.id
    }

    pub fn metadata(&self) -> &Metadata {
        &self.payload.metadata
    }

    pub fn content(&self) -> &[u8] {
        &self.payload.content
    }

    pub fn arrived_at(&self) -> DateTime<Utc> {
        self.payload.arrived_at
    }

    pub fn redelivery_count(&self) -> u32 {
        self.redelivery_count
    }

    pub fn is_redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn mark_redelivered(&mut self) {
        self.redelivered = true;
        self.redelivery_count = self.redelivery_count.saturating_add(1);
    }

    /// Another holder for the same payload (e.g. a second routed queue).
    pub fn shallow_copy(&self) -> Self {
        Self {
            payload: Arc::clone(&self.payload),
            redelivery_count: self.redelivery_count,
            redelivered: self.redelivered,
        }
    }

    /// Number of live holders of this payload.
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.payload)
    }

    /// Give up this holder's reference. The payload is freed with the last one.
    pub fn release(self) {
        tracing::trace!(
            message_id = %self.payload.id,
            remaining = Arc::strong_count(&self.payload) - 1,
            "Message reference released"
        );
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.payload.id)
            .field("exchange", &self.payload.metadata.exchange_name)
            .field("routing_key", &self.payload.metadata.routing_key)
            .field("content_len", &self.payload.content.len())
            .field("redelivery_count", &self.redelivery_count)
            .finish()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message[id={}, exchange={}, routing_key={}]",
            self.payload.id, self.payload.metadata.exchange_name, self.payload.metadata.routing_key
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: u64) -> Message {
        Message::new(MessageId::new(id), Metadata::new("amq.direct", "orders"), b"hello".to_vec())
    }

    #[test]
    fn test_id_generator_is_monotonic() {
        let generator = MessageIdGenerator::new();
        let a = generator.next_id();
        let b = generator.next_id();
        assert!(b > a);
    }

    #[test]
    fn test_id_generator_advance_past() {
        let generator = MessageIdGenerator::new();
        generator.advance_past(MessageId::new(41));
        assert_eq!(generator.next_id(), MessageId::new(42));

        // Never moves backwards
        generator.advance_past(MessageId::new(3));
        assert_eq!(generator.next_id(), MessageId::new(43));
    }

    #[test]
    fn test_shallow_copy_shares_payload() {
        let original = message(7);
        assert_eq!(original.reference_count(), 1);

        let copy = original.shallow_copy();
        assert_eq!(copy.id(), original.id());
        assert_eq!(original.reference_count(), 2);

        copy.release();
        assert_eq!(original.reference_count(), 1);
    }

    #[test]
    fn test_mark_redelivered() {
        let mut msg = message(1);
        assert!(!msg.is_redelivered());
        msg.mark_redelivered();
        msg.mark_redelivered();
        assert!(msg.is_redelivered());
        assert_eq!(msg.redelivery_count(), 2);
    }

    #[test]
    fn test_metadata_serialization_skips_empty_properties() {
        let metadata = Metadata::new("ex", "key");
        let json = serde_json::to_string(&metadata).unwrap();
        assert!(!json.contains("properties"));

        let with_props = metadata.with_property("content-type", "text/plain");
        let json = serde_json::to_string(&with_props).unwrap();
        let back: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, with_props);
    }
}
