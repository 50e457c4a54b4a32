//! Bounded message FIFOs feeding the session engine.

use std::collections::VecDeque;

use crate::error::{Result, RtpMidiError};

use super::MidiMessage;

/// A message waiting in a queue, together with the media timestamp at
/// which it becomes due (0 = immediately).
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: MidiMessage,
    pub timestamp: u64,
}

/// Bounded FIFO. `push` fails fast with queue-full when the capacity is
/// reached (drop-newest); ownership of messages transfers on push and pop.
pub struct MessageQueue {
    items: VecDeque<QueuedMessage>,
    capacity: usize,
}

impl MessageQueue {
    pub fn with_capacity(capacity: usize) -> MessageQueue {
        MessageQueue {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, message: MidiMessage, timestamp: u64) -> Result<()> {
        if self.items.len() >= self.capacity {
            return Err(RtpMidiError::QueueFull {
                capacity: self.capacity,
            });
        }
        self.items.push_back(QueuedMessage { message, timestamp });
        Ok(())
    }

    pub fn pop(&mut self) -> Option<QueuedMessage> {
        self.items.pop_front()
    }

    /// Timestamp of the message at the head of the queue, if any.
    pub fn head_timestamp(&self) -> Option<u64> {
        self.items.front().map(|m| m.timestamp)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
