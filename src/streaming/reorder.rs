//! Reordering buffer for bunches that arrive ahead of their turn.

use bytes::Bytes;
use std::collections::BTreeMap;

/// Outcome of offering a bunch to the pending set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Queued,
    /// The index is already pending or was consumed earlier.
    Duplicate,
}

/// Bunches keyed by sequence index, smallest first.
///
/// Only the bunch whose index equals the next expected index can be taken.
#[derive(Debug, Default)]
pub struct PendingBunches {
    pending: BTreeMap<u32, Bytes>,
    buffered_bytes: usize,
}

impl PendingBunches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer(&mut self, index: u32, next_expected: u32, payload: Bytes) -> Offer {
        if index < next_expected || self.pending.contains_key(&index) {
            return Offer::Duplicate;
        }
        self.buffered_bytes += payload.len();
        self.pending.insert(index, payload);
        Offer::Queued
    }

    /// Remove and return the payload for `next_expected`, if it has arrived.
    pub fn take_next(&mut self, next_expected: u32) -> Option<Bytes> {
        let mut first = self.pending.first_entry()?;
        if *first.key() != next_expected {
            return None;
        }
        let payload = first.remove();
        self.buffered_bytes -= payload.len();
        Some(payload)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Total payload bytes held while waiting for earlier bunches.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }
}
