//! Bounded drain-on-read message inbox.

use std::{
    collections::VecDeque,
    sync::Mutex,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::overlay::now_ms;

/// One delivered message as handed to the local agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxMessage {
    /// Full hex public key of the sender (self for loopback copies).
    pub sender: String,
    #[serde(rename = "senderShortId")]
    pub sender_short_id: String,
    pub timestamp: i64,
    pub content: Value,
}

/// FIFO of delivered messages; reading drains it. Oldest entries are dropped
/// once `capacity` is reached.
pub struct Inbox {
    messages: Mutex<VecDeque<InboxMessage>>,
    capacity: usize,
}

impl Inbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    pub fn push(&self, sender: &str, sender_short_id: &str, content: Value) {
        let mut messages = self.messages.lock().unwrap();
        if messages.len() == self.capacity {
            messages.pop_front();
        }
        messages.push_back(InboxMessage {
            sender: sender.to_string(),
            sender_short_id: sender_short_id.to_string(),
            timestamp: now_ms(),
            content,
        });
    }

    /// Atomically swap the buffer for an empty one and return the contents.
    pub fn drain(&self) -> Vec<InboxMessage> {
        let mut messages = self.messages.lock().unwrap();
        std::mem::take(&mut *messages).into()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
