use serde::{Deserialize, Serialize};

use crate::model::{LocalId, OutboxStatus};

/// Change notification emitted by the outbox for every mutation.
///
/// Consumed by the UI, by the decay timer, and by the sending engine's
/// auto-trigger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxEvent {
    Enqueued(LocalId),
    StatusChanged { id: LocalId, status: OutboxStatus },
    Removed(LocalId),
    Cleared,
}

impl OutboxEvent {
    pub fn id(&self) -> Option<LocalId> {
        match self {
            OutboxEvent::Enqueued(id)
            | OutboxEvent::StatusChanged { id, .. }
            | OutboxEvent::Removed(id) => Some(*id),
            OutboxEvent::Cleared => None,
        }
    }

    /// Whether this change can leave a new sendable message in the outbox.
    ///
    /// Only enqueueing can. A status change into `Enqueued` is always a
    /// move from `Enqueued` (terminal statuses are never left), which is
    /// the sending engine recording its own retryable failure.
    pub fn may_unblock_sending(&self) -> bool {
        match self {
            OutboxEvent::Enqueued(_) => true,
            OutboxEvent::StatusChanged { .. } | OutboxEvent::Removed(_) | OutboxEvent::Cleared => {
                false
            }
        }
    }
}
