//! Fragment reassembly buffer.
//!
//! Messages longer than one radio packet arrive as `[id|index|total]` pieces
//! in arbitrary order. This module stores the pieces in a fixed pool and hands
//! back the concatenated message as soon as every index from 1 to the total
//! announced by the most recent piece is present. Completion always consumes
//! the stored set, so a duplicate delivery of the same id starts a fresh
//! accumulation.
//!
//! The pool is bounded two ways: a stale entry is dropped after a fixed
//! timeout, and when the pool is full the message whose newest piece is oldest
//! is evicted wholesale to make room.

use crate::wire::{self, FragmentHeader};
use crate::{MessageText, MsgId, FRAGMENT_POOL_SIZE, FRAGMENT_TIMEOUT, MAX_MSG_ID_LEN, MAX_WIRE_LEN};
use embassy_time::Instant;
use heapless::Vec;
use log::{log, Level};

struct Fragment {
    msg_id: MsgId,
    index: u16,
    total: u16,
    data: MessageText,
    received_at: Instant,
}

/// Result of storing one fragment.
pub(crate) enum ReassemblyOutcome {
    /// More pieces are still missing (or the set was unsatisfiable and has
    /// been discarded).
    Incomplete,
    /// All pieces arrived; the stored set has been consumed.
    Complete(MessageText),
}

pub(crate) struct FragmentBuffer {
    slots: Vec<Fragment, FRAGMENT_POOL_SIZE>,
}

impl FragmentBuffer {
    pub(crate) const fn new() -> Self {
        FragmentBuffer { slots: Vec::new() }
    }

    /// Stores one fragment and checks the set for completeness against the
    /// total carried by this fragment. A repeated (id, index) pair overwrites
    /// the stored piece. A total of 0 can never be satisfied, so the whole
    /// set for that id is discarded on the spot.
    pub(crate) fn insert(&mut self, header: &FragmentHeader<'_>, now: Instant) -> ReassemblyOutcome {
        let Some(msg_id) = wire::bounded::<MAX_MSG_ID_LEN>(header.msg_id) else {
            log!(Level::Warn, "Fragment message id longer than {} bytes, dropping fragment", MAX_MSG_ID_LEN);
            return ReassemblyOutcome::Incomplete;
        };
        let Some(data) = wire::bounded::<MAX_WIRE_LEN>(header.payload) else {
            return ReassemblyOutcome::Incomplete;
        };

        if let Some(slot) = self
            .slots
            .iter_mut()
            .find(|f| f.msg_id == msg_id && f.index == header.index)
        {
            slot.total = header.total;
            slot.data = data;
            slot.received_at = now;
        } else {
            if self.slots.is_full() {
                self.evict_stalest_message();
            }
            let _ = self.slots.push(Fragment {
                msg_id: msg_id.clone(),
                index: header.index,
                total: header.total,
                data,
                received_at: now,
            });
        }

        self.try_complete(&msg_id, header.total)
    }

    /// Drops every fragment older than the reassembly timeout.
    pub(crate) fn evict_expired(&mut self, now: Instant) {
        let before = self.slots.len();
        self.slots.retain(|f| f.received_at + FRAGMENT_TIMEOUT > now);
        let dropped = before - self.slots.len();
        if dropped > 0 {
            log!(Level::Debug, "Dropped {} expired fragment(s)", dropped);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.len()
    }

    fn try_complete(&mut self, msg_id: &MsgId, total: u16) -> ReassemblyOutcome {
        if total == 0 {
            self.purge(msg_id);
            return ReassemblyOutcome::Incomplete;
        }
        for index in 1..=total {
            if !self.slots.iter().any(|f| f.msg_id == *msg_id && f.index == index) {
                return ReassemblyOutcome::Incomplete;
            }
        }

        let mut full = MessageText::new();
        for index in 1..=total {
            if let Some(fragment) = self.slots.iter().find(|f| f.msg_id == *msg_id && f.index == index) {
                if full.push_str(&fragment.data).is_err() {
                    log!(Level::Warn, "Reassembled message for id {} does not fit a wire string, dropping set", msg_id.as_str());
                    self.purge(msg_id);
                    return ReassemblyOutcome::Incomplete;
                }
            }
        }
        self.purge(msg_id);
        log!(Level::Debug, "Reassembled message {} from {} fragment(s)", msg_id.as_str(), total);
        ReassemblyOutcome::Complete(full)
    }

    fn purge(&mut self, msg_id: &MsgId) {
        self.slots.retain(|f| f.msg_id != *msg_id);
    }

    /// Removes the message whose most recent fragment is the oldest in the
    /// pool. Called when a new fragment arrives and no slot is free.
    fn evict_stalest_message(&mut self) {
        let mut victim: Option<(MsgId, Instant)> = None;
        for fragment in &self.slots {
            let newest = self
                .slots
                .iter()
                .filter(|f| f.msg_id == fragment.msg_id)
                .map(|f| f.received_at)
                .max()
                .unwrap_or(fragment.received_at);
            match &victim {
                Some((_, kept)) if *kept <= newest => {}
                _ => victim = Some((fragment.msg_id.clone(), newest)),
            }
        }
        if let Some((msg_id, _)) = victim {
            log!(Level::Debug, "Fragment pool full, evicting message {}", msg_id.as_str());
            self.purge(&msg_id);
        }
    }
}
