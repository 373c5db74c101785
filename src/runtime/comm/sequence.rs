//! Receiver side of the sequence-id extension.
//!
//! Holds envelopes that arrive ahead of their turn and releases them in
//! per-sender order. Unsequenced envelopes pass straight through.

use std::collections::BTreeMap;

use hashbrown::HashMap;

use super::message::Envelope;
use crate::runtime::guid::DomainId;

#[derive(Debug, Default)]
pub struct ReorderBuffer {
    next: HashMap<DomainId, u64>,
    held: HashMap<DomainId, BTreeMap<u64, Envelope>>,
}

impl ReorderBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept one envelope and return everything now deliverable, in order.
    pub fn accept(
        &mut self,
        envelope: Envelope,
    ) -> Vec<Envelope> {
        let Some(seq) = envelope.seq else {
            return vec![envelope];
        };
        let from = envelope.from;
        let expected = self.next.entry(from).or_insert(0);
        if seq < *expected {
            tracing::warn!(from, seq, expected = *expected, "duplicate sequenced message dropped");
            return Vec::new();
        }
        let held = self.held.entry(from).or_default();
        held.insert(seq, envelope);

        let mut ready = Vec::new();
        while let Some(next) = held.remove(expected) {
            ready.push(next);
            *expected += 1;
        }
        ready
    }

    /// Envelopes waiting for a gap to fill.
    pub fn held(&self) -> usize {
        self.held.values().map(BTreeMap::len).sum()
    }

    /// Forget a sender entirely, returning what was held for it.
    pub fn forget(
        &mut self,
        from: DomainId,
    ) -> Vec<Envelope> {
        self.next.remove(&from);
        self.held
            .remove(&from)
            .map(|held| held.into_values().collect())
            .unwrap_or_default()
    }
}
