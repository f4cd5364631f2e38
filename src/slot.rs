//! Single-message slot shared between the console and the polling endpoint.
//!
//! Holds at most one outbound message. Every `set` overwrites the previous
//! value unconditionally; `get` never consumes. A message can therefore be
//! replaced before any client has polled it.

use serde::Serialize;
use std::sync::RwLock;
use tracing::trace;

/// A queued message together with its freshness id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub message: String,
    /// Opaque token; only equality is meaningful to clients.
    pub id: String,
}

#[derive(Debug, Default)]
struct SlotState {
    current: Option<Message>,
    last_id: i64,
}

/// Thread-safe last-write-wins message slot
#[derive(Debug, Default)]
pub struct MessageSlot {
    state: RwLock<SlotState>,
}

impl MessageSlot {
    /// Create an empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current message and stamp it with a fresh id.
    pub fn set(&self, text: impl Into<String>) -> Message {
        let mut state = match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        // Milliseconds since epoch, bumped past the last id so ids never repeat
        let now = chrono::Utc::now().timestamp_millis();
        let id = now.max(state.last_id + 1);
        state.last_id = id;

        let message = Message {
            message: text.into(),
            id: id.to_string(),
        };
        trace!(id, "Message slot overwritten");
        state.current = Some(message.clone());
        message
    }

    /// Current message, if one was ever set.
    pub fn get(&self) -> Option<Message> {
        match self.state.read() {
            Ok(state) => state.current.clone(),
            Err(poisoned) => poisoned.into_inner().current.clone(),
        }
    }
}
