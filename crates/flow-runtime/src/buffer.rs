//! In-memory buffer of delivered but not yet acknowledged messages.
//!
//! The buffer is shared between the intake task (appends) and the
//! reconciler (scan and removal). Every operation takes one short mutex
//! window; no lock is ever held across an `.await`.

use crate::message::{InboundMessage, MessageId};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

#[cfg(test)]
#[path = "buffer_tests.rs"]
mod tests;

/// Buffer-assigned sequence number identifying one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(u64);

impl EntryId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// One buffered message
#[derive(Debug, Clone)]
pub struct PendingEntry {
    id: EntryId,
    message: InboundMessage,
}

impl PendingEntry {
    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn message(&self) -> &InboundMessage {
        &self.message
    }

    pub fn message_id(&self) -> &MessageId {
        self.message.message_id()
    }
}

struct BufferState {
    entries: VecDeque<PendingEntry>,
    next_entry: u64,
}

/// Ordered collection of unacknowledged messages
///
/// Cloning yields another handle to the same buffer.
#[derive(Clone)]
pub struct PendingBuffer {
    state: Arc<Mutex<BufferState>>,
}

impl PendingBuffer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BufferState {
                entries: VecDeque::new(),
                next_entry: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        // A panic while holding the lock cannot leave the deque half-updated,
        // so a poisoned guard is still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a message at the tail
    pub fn append(&self, message: InboundMessage) -> EntryId {
        let mut state = self.lock();
        let id = EntryId(state.next_entry);
        state.next_entry += 1;
        state.entries.push_back(PendingEntry { id, message });
        id
    }

    /// Current number of buffered entries
    pub fn size(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Copy of the buffered message ids in scan order
    pub fn snapshot(&self) -> Vec<MessageId> {
        self.lock()
            .entries
            .iter()
            .map(|entry| entry.message_id().clone())
            .collect()
    }

    /// Start a scan at the head of the buffer
    pub fn scan(&self) -> Scan {
        Scan {
            buffer: self.clone(),
            position: 0,
            current: None,
        }
    }

    fn entry_at(&self, position: usize) -> Option<PendingEntry> {
        self.lock().entries.get(position).cloned()
    }

    /// Remove an entry by identity; returns false if it is no longer buffered
    fn remove_entry(&self, id: EntryId) -> bool {
        let mut state = self.lock();
        match state.entries.iter().position(|entry| entry.id == id) {
            Some(index) => {
                state.entries.remove(index);
                true
            }
            None => false,
        }
    }
}

impl Default for PendingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PendingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingBuffer")
            .field("size", &self.size())
            .finish()
    }
}

/// Restartable cursor over a [`PendingBuffer`]
///
/// Each call to [`Scan::current`] reads the entry at the cursor under the
/// buffer lock, so entries appended while the scan is running are visited
/// once the cursor reaches them. Removing the current entry leaves the cursor
/// in place; the following entry slides under it.
pub struct Scan {
    buffer: PendingBuffer,
    position: usize,
    current: Option<EntryId>,
}

impl Scan {
    /// Entry at the cursor, or `None` once the scan has passed the tail
    pub fn current(&mut self) -> Option<PendingEntry> {
        let entry = self.buffer.entry_at(self.position);
        self.current = entry.as_ref().map(PendingEntry::id);
        entry
    }

    /// Remove the entry last returned by [`Scan::current`]
    ///
    /// Returns false if there is no current entry or it was already removed.
    pub fn remove_current(&mut self) -> bool {
        match self.current.take() {
            Some(id) => self.buffer.remove_entry(id),
            None => false,
        }
    }

    /// Move past the current entry without removing it
    pub fn advance(&mut self) {
        self.position += 1;
        self.current = None;
    }

    /// Rewind to the head of the buffer
    pub fn restart(&mut self) {
        self.position = 0;
        self.current = None;
    }

    pub fn position(&self) -> usize {
        self.position
    }
}
