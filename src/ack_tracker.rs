//! Message id allocation and acknowledgement correlation.
//!
//! Ids are the node's millisecond clock rendered as decimal text, bumped by
//! one whenever the clock has not advanced past the previous id, so two sends
//! in the same tick stay distinct. The tracker keeps two bounded records:
//! which of our ids still await an acknowledgement, and which ids we have
//! seen acknowledged. Both shed their oldest entry when full.

use crate::wire;
use crate::{MsgId, MAX_TRACKED_ACKS};
use core::fmt::Write;
use embassy_time::Instant;
use heapless::{Deque, Vec};
use log::{log, Level};

struct PendingAck {
    msg_id: MsgId,
    sent_at: Instant,
}

pub(crate) struct AckTracker {
    pending: Vec<PendingAck, MAX_TRACKED_ACKS>,
    received: Deque<MsgId, MAX_TRACKED_ACKS>,
    last_id: u64,
}

impl AckTracker {
    pub(crate) const fn new() -> Self {
        AckTracker {
            pending: Vec::new(),
            received: Deque::new(),
            last_id: 0,
        }
    }

    /// Allocates the next message id. Strictly increasing across calls even
    /// when the clock stalls within one millisecond.
    pub(crate) fn next_message_id(&mut self, now: Instant) -> MsgId {
        let millis = now.as_millis();
        let id = if millis > self.last_id { millis } else { self.last_id + 1 };
        self.last_id = id;
        let mut out = MsgId::new();
        // u64 decimal text always fits the id capacity
        let _ = write!(out, "{}", id);
        out
    }

    /// Records that `msg_id` was just transmitted and awaits acknowledgement.
    /// Re-sending an id refreshes its timestamp in place.
    pub(crate) fn register_pending(&mut self, msg_id: &MsgId, sent_at: Instant) {
        if let Some(pending) = self.pending.iter_mut().find(|p| p.msg_id == *msg_id) {
            pending.sent_at = sent_at;
            return;
        }
        if self.pending.is_full() {
            let dropped = self.pending.remove(0);
            log!(
                Level::Debug,
                "Pending list full, forgetting message {} sent at {} ms",
                dropped.msg_id.as_str(),
                dropped.sent_at.as_millis()
            );
        }
        let _ = self.pending.push(PendingAck {
            msg_id: msg_id.clone(),
            sent_at,
        });
    }

    /// Records an acknowledgement heard on the air. Duplicates are ignored;
    /// ids too long to store cannot be correlated and are dropped.
    pub(crate) fn record_ack(&mut self, msg_id: &str) {
        if self.is_acked(msg_id) {
            return;
        }
        let Some(msg_id) = wire::bounded(msg_id) else {
            log!(Level::Debug, "Acknowledged id is too long to track, ignoring");
            return;
        };
        if self.received.is_full() {
            self.received.pop_front();
        }
        let _ = self.received.push_back(msg_id);
    }

    /// Whether an acknowledgement for `msg_id` has been observed. This keeps
    /// answering true after the pending record ages out.
    pub(crate) fn is_acked(&self, msg_id: &str) -> bool {
        self.received.iter().any(|id| id.as_str() == msg_id)
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
