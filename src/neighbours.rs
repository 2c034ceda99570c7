//! Last-heard bookkeeping for every station this node has received from.

use crate::wire;
use crate::{NodeId, MAX_NEIGHBOURS};
use embassy_time::{Duration, Instant};
use heapless::Vec;
use log::{log, Level};

/// Link readings from the most recent packet heard from a neighbour. An
/// upsert replaces the whole record, it never averages with history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeighbourInfo {
    pub last_seen: Instant,
    pub rssi: f32,
    pub snr: f32,
}

impl NeighbourInfo {
    /// Time elapsed since this neighbour was last heard.
    pub fn age(&self, now: Instant) -> Duration {
        if now > self.last_seen {
            now - self.last_seen
        } else {
            Duration::from_millis(0)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NeighbourEntry {
    pub node: NodeId,
    pub info: NeighbourInfo,
}

/// Bounded map from sender id to [`NeighbourInfo`]. When full, the entry with
/// the oldest `last_seen` makes way for the new sender.
pub struct NeighbourTable {
    entries: Vec<NeighbourEntry, MAX_NEIGHBOURS>,
}

impl NeighbourTable {
    pub(crate) const fn new() -> Self {
        NeighbourTable { entries: Vec::new() }
    }

    pub(crate) fn upsert(&mut self, node: &str, info: NeighbourInfo) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.node.as_str() == node) {
            entry.info = info;
            return;
        }
        if self.entries.is_full() {
            if let Some(oldest) = self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.info.last_seen)
                .map(|(i, _)| i)
            {
                let evicted = self.entries.swap_remove(oldest);
                log!(Level::Debug, "Neighbour table full, evicting {}", evicted.node.as_str());
            }
        }
        let _ = self.entries.push(NeighbourEntry {
            node: wire::bounded_lossy(node),
            info,
        });
    }

    pub fn get(&self, node: &str) -> Option<&NeighbourInfo> {
        self.entries
            .iter()
            .find(|e| e.node.as_str() == node)
            .map(|e| &e.info)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NeighbourEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
