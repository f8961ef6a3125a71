//! Ordered message buffer shared by the queue variants.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::message::{Message, MessageId};
use crate::observe::StagedCounts;
use crate::transaction::Xid;

/// Operations staged under one Xid, applied on commit.
#[derive(Debug, Default)]
struct StagedOperations {
    enqueues: Vec<Message>,
    detaches: Vec<MessageId>,
}

#[derive(Debug, Default)]
struct BufferState {
    messages: VecDeque<Message>,
    staged: HashMap<Xid, StagedOperations>,
}

impl BufferState {
    fn staged_enqueue_count(&self) -> usize {
        self.staged.values().map(|ops| ops.enqueues.len()).sum()
    }

    fn remove(&mut self, message_id: MessageId) -> Option<Message> {
        let position = self.messages.iter().position(|m| m.id() == message_id)?;
        self.messages.remove(position)
    }
}

/// FIFO buffer with optional capacity and per-Xid staging.
///
/// Staged enqueues count against the capacity so that a prepared
/// transaction can always be committed.
#[derive(Debug)]
pub(crate) struct QueueBuffer {
    state: Mutex<BufferState>,
    capacity: Option<usize>,
}

impl QueueBuffer {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(BufferState::default()),
            capacity,
        }
    }

    pub fn with_messages(messages: impl IntoIterator<Item = Message>) -> Self {
        let buffer = Self::new(None);
        buffer.state.lock().messages.extend(messages);
        buffer
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    fn has_room(&self, state: &BufferState) -> bool {
        match self.capacity {
            Some(capacity) => state.messages.len() + state.staged_enqueue_count() < capacity,
            None => true,
        }
    }

    /// Append to the tail. Hands the message back when the buffer is full.
    pub fn push_back(&self, message: Message) -> Result<(), Message> {
        let mut state = self.state.lock();
        if !self.has_room(&state) {
            return Err(message);
        }
        state.messages.push_back(message);
        Ok(())
    }

    /// Insert at the head, ignoring capacity.
    pub fn push_front(&self, message: Message) {
        self.state.lock().messages.push_front(message);
    }

    pub fn pop_front(&self) -> Option<Message> {
        self.state.lock().messages.pop_front()
    }

    pub fn remove(&self, message_id: MessageId) -> Option<Message> {
        self.state.lock().remove(message_id)
    }

    pub fn stage_enqueue(&self, xid: &Xid, message: Message) -> Result<(), Message> {
        let mut state = self.state.lock();
        if !self.has_room(&state) {
            return Err(message);
        }
        Self::push_staged(&mut state, xid, message);
        Ok(())
    }

    /// Stage an enqueue regardless of capacity.
    pub fn force_stage_enqueue(&self, xid: &Xid, message: Message) {
        Self::push_staged(&mut self.state.lock(), xid, message);
    }

    fn push_staged(state: &mut BufferState, xid: &Xid, message: Message) {
        state
            .staged
            .entry(xid.clone())
            .or_default()
            .enqueues
            .push(message);
    }

    pub fn stage_detach(&self, xid: &Xid, message_id: MessageId) {
        self.state
            .lock()
            .staged
            .entry(xid.clone())
            .or_default()
            .detaches
            .push(message_id);
    }

    /// Apply the staged operations of `xid`.
    ///
    /// Only detaches that found their message still buffered are counted.
    pub fn commit(&self, xid: &Xid) -> StagedCounts {
        let mut state = self.state.lock();
        let Some(ops) = state.staged.remove(xid) else {
            return StagedCounts::default();
        };
        let mut counts = StagedCounts {
            enqueues: ops.enqueues.len(),
            detaches: 0,
        };
        for message_id in ops.detaches {
            if let Some(message) = state.remove(message_id) {
                message.release();
                counts.detaches += 1;
            }
        }
        state.messages.extend(ops.enqueues);
        counts
    }

    /// Discard the staged operations of `xid`.
    pub fn rollback(&self, xid: &Xid) -> StagedCounts {
        let Some(ops) = self.state.lock().staged.remove(xid) else {
            return StagedCounts::default();
        };
        let counts = StagedCounts {
            enqueues: ops.enqueues.len(),
            detaches: ops.detaches.len(),
        };
        ops.enqueues.into_iter().for_each(Message::release);
        counts
    }

    pub fn has_staged(&self, xid: &Xid) -> bool {
        self.state.lock().staged.contains_key(xid)
    }

    /// Drop every buffered message. Staged operations are kept.
    pub fn clear(&self) -> usize {
        let drained: Vec<Message> = self.state.lock().messages.drain(..).collect();
        let count = drained.len();
        drained.into_iter().for_each(Message::release);
        count
    }
}
