//! Publisher-side bookkeeping of in-flight deliveries.
//!
//! Sequence numbers follow the broker's confirm-mode numbering: the first
//! publish on a channel is 1 and every later publish takes the next integer.
//! A tracker lives exactly as long as one channel session.

use std::collections::BTreeMap;
use tracing::warn;
use types::{Confirmation, DeliveryRecord};
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct DeliveryTracker {
    last_sequence: u64,
    pending: BTreeMap<u64, DeliveryRecord>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next sequence number and record the delivery as pending
    pub fn register(&mut self, envelope_id: Uuid) -> u64 {
        self.last_sequence += 1;
        let sequence = self.last_sequence;
        self.pending
            .insert(sequence, DeliveryRecord::pending(sequence, envelope_id));
        sequence
    }

    /// Apply a broker confirmation, returning the records it resolved with
    /// their final state. Resolved records leave the pending set.
    pub fn resolve(&mut self, confirmation: Confirmation) -> Vec<DeliveryRecord> {
        if confirmation.sequence > self.last_sequence {
            warn!(
                sequence = confirmation.sequence,
                last_sequence = self.last_sequence,
                "Confirmation for a sequence never published"
            );
            return Vec::new();
        }

        let covered: Vec<u64> = self
            .pending
            .range(..=confirmation.sequence)
            .map(|(sequence, _)| *sequence)
            .filter(|sequence| confirmation.covers(*sequence))
            .collect();
        let resolved: Vec<DeliveryRecord> = covered
            .iter()
            .filter_map(|sequence| self.pending.remove(sequence))
            .collect();

        if resolved.is_empty() {
            warn!(
                sequence = confirmation.sequence,
                multiple = confirmation.multiple,
                "Confirmation matched no pending delivery"
            );
        }

        let state = confirmation.kind.resolved_state();
        resolved
            .into_iter()
            .map(|mut record| {
                record.state = state;
                record
            })
            .collect()
    }

    /// Forget a registered sequence the broker never received
    pub fn abandon(&mut self, sequence: u64) -> Option<DeliveryRecord> {
        self.pending.remove(&sequence)
    }

    /// Take every record still pending, leaving the set empty
    pub fn drain_unconfirmed(&mut self) -> Vec<DeliveryRecord> {
        std::mem::take(&mut self.pending).into_values().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn pending_sequences(&self) -> Vec<u64> {
        self.pending.keys().copied().collect()
    }
}
