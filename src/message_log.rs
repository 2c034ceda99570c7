//! Bounded in-order logs of received traffic.

use crate::{MessageText, NodeId, MESSAGE_LOG_CAPACITY};
use embassy_time::{Duration, Instant};
use heapless::Deque;

/// One received packet as recorded in a log: reception time, extracted or
/// placeholder sender, the full text and the link readings it arrived with.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub timestamp: Instant,
    pub sender: NodeId,
    pub content: MessageText,
    pub rssi: f32,
    pub snr: f32,
}

/// FIFO log of [`ReceivedMessage`] entries, oldest first.
///
/// Every log is count-bounded: pushing into a full log drops the oldest entry
/// first. A log built with a maximum age additionally drops entries older
/// than that age from the front after each push, so pruning only runs when
/// traffic arrives.
pub struct MessageLog {
    entries: Deque<ReceivedMessage, MESSAGE_LOG_CAPACITY>,
    max_age: Option<Duration>,
}

impl MessageLog {
    pub(crate) const fn new(max_age: Option<Duration>) -> Self {
        MessageLog {
            entries: Deque::new(),
            max_age,
        }
    }

    pub(crate) fn push(&mut self, entry: ReceivedMessage, now: Instant) {
        if self.entries.is_full() {
            self.entries.pop_front();
        }
        let _ = self.entries.push_back(entry);

        if let Some(max_age) = self.max_age {
            while let Some(front) = self.entries.front() {
                if front.timestamp + max_age < now {
                    self.entries.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    /// Entries oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &ReceivedMessage> {
        self.entries.iter()
    }

    pub fn newest(&self) -> Option<&ReceivedMessage> {
        self.entries.back()
    }

    pub fn oldest(&self) -> Option<&ReceivedMessage> {
        self.entries.front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
