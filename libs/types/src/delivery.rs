//! Publisher-confirm bookkeeping types.
//!
//! A [`DeliveryRecord`] is opened for every publish and closed by the
//! matching broker [`Confirmation`]. The tracking logic itself lives in the
//! reliability crate; these are the values it moves around.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryState {
    Pending,
    Acked,
    Nacked,
}

/// One in-flight publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub sequence: u64,
    pub envelope_id: Uuid,
    pub state: DeliveryState,
}

impl DeliveryRecord {
    pub fn pending(sequence: u64, envelope_id: Uuid) -> Self {
        Self {
            sequence,
            envelope_id,
            state: DeliveryState::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == DeliveryState::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfirmationKind {
    Ack,
    Nack,
}

impl ConfirmationKind {
    pub fn resolved_state(&self) -> DeliveryState {
        match self {
            ConfirmationKind::Ack => DeliveryState::Acked,
            ConfirmationKind::Nack => DeliveryState::Nacked,
        }
    }
}

/// Broker-to-publisher confirm for one or more sequence numbers.
///
/// With `multiple` set, the confirm covers `sequence` and every lower
/// sequence still pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Confirmation {
    pub sequence: u64,
    pub multiple: bool,
    pub kind: ConfirmationKind,
}

impl Confirmation {
    pub fn ack(sequence: u64) -> Self {
        Self {
            sequence,
            multiple: false,
            kind: ConfirmationKind::Ack,
        }
    }

    pub fn nack(sequence: u64) -> Self {
        Self {
            sequence,
            multiple: false,
            kind: ConfirmationKind::Nack,
        }
    }

    /// Extend this confirm to every lower pending sequence
    pub fn multiple(mut self) -> Self {
        self.multiple = true;
        self
    }

    /// Whether this confirm resolves the given sequence number
    pub fn covers(&self, sequence: u64) -> bool {
        if self.multiple {
            sequence <= self.sequence
        } else {
            sequence == self.sequence
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_covers_single() {
        let c = Confirmation::ack(5);
        assert!(c.covers(5));
        assert!(!c.covers(4));
        assert!(!c.covers(6));
    }

    #[test]
    fn test_covers_multiple() {
        let c = Confirmation::nack(5).multiple();
        assert!(c.covers(1));
        assert!(c.covers(5));
        assert!(!c.covers(6));
        assert_eq!(c.kind.resolved_state(), DeliveryState::Nacked);
    }
}
