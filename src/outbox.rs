use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::OutboxError;
use crate::event::OutboxEvent;
use crate::model::{LocalId, OutboundMessage, OutboxStatus};

/// The queue of outbound messages, as seen by the sending engine and the
/// decay timer.
///
/// Writers must refuse to move a message out of a terminal status and must
/// report the refusal rather than overwrite it.
pub trait OutboxStore: Send + Sync {
    /// All messages, in submission order.
    fn messages(&self) -> Vec<OutboundMessage>;

    fn get(&self, id: LocalId) -> Option<OutboundMessage> {
        self.messages().into_iter().find(|m| m.id == id)
    }

    /// Oldest message that should be attempted next.
    fn first_sendable(&self) -> Option<OutboundMessage> {
        self.messages().into_iter().find(OutboundMessage::is_sendable)
    }

    fn is_sendable(&self, id: LocalId) -> bool {
        self.get(id).is_some_and(|m| m.is_sendable())
    }

    fn mark_sent(&self, id: LocalId) -> Result<(), OutboxError>;

    fn update_status(&self, id: LocalId, status: OutboxStatus) -> Result<(), OutboxError>;
}

/// In-memory outbox with change notifications.
pub struct MemoryOutbox {
    messages: RwLock<Vec<OutboundMessage>>,
    events: broadcast::Sender<OutboxEvent>,
}

impl MemoryOutbox {
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            messages: RwLock::new(Vec::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboxEvent> {
        self.events.subscribe()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<OutboundMessage>> {
        self.messages.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<OutboundMessage>> {
        self.messages.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: OutboxEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Queue a freshly submitted message. A message whose id is already
    /// present is ignored and `false` returned.
    pub fn enqueue(&self, message: OutboundMessage) -> bool {
        let id = message.id;
        {
            let mut messages = self.write();
            if messages.iter().any(|m| m.id == id) {
                debug!(%id, "ignoring duplicate outbox message");
                return false;
            }
            messages.push(message);
        }
        self.emit(OutboxEvent::Enqueued(id));
        true
    }

    /// Drop a message: user deletion, or the server echoed it back to us.
    pub fn remove(&self, id: LocalId) -> Option<OutboundMessage> {
        let removed = {
            let mut messages = self.write();
            let index = messages.iter().position(|m| m.id == id)?;
            messages.remove(index)
        };
        self.emit(OutboxEvent::Removed(id));
        Some(removed)
    }

    /// After a fresh initial fetch, sent messages are already in the
    /// server's view; drop our local copies.
    pub fn drop_sent(&self) -> Vec<LocalId> {
        let dropped: Vec<LocalId> = {
            let mut messages = self.write();
            let dropped = messages
                .iter()
                .filter(|m| m.status == OutboxStatus::Sent)
                .map(|m| m.id)
                .collect();
            messages.retain(|m| m.status != OutboxStatus::Sent);
            dropped
        };
        for id in &dropped {
            self.emit(OutboxEvent::Removed(*id));
        }
        dropped
    }

    /// Logout or account switch: nothing queued survives.
    pub fn clear(&self) {
        let count = {
            let mut messages = self.write();
            let count = messages.len();
            messages.clear();
            count
        };
        info!(count, "outbox cleared");
        self.emit(OutboxEvent::Cleared);
    }

    fn transition(&self, id: LocalId, status: OutboxStatus) -> Result<(), OutboxError> {
        {
            let mut messages = self.write();
            let Some(message) = messages.iter_mut().find(|m| m.id == id) else {
                warn!(%id, to = status.name(), "status update for unknown outbox message");
                return Err(OutboxError::NotFound(id));
            };

            if message.status.is_terminal() {
                error!(
                    %id,
                    from = message.status.name(),
                    to = status.name(),
                    "attempted to transition outbox message away from terminal state"
                );
                return Err(OutboxError::InvalidStateTransition {
                    id,
                    from: message.status.name(),
                    to: status.name(),
                });
            }

            message.status = status.clone();
        }
        self.emit(OutboxEvent::StatusChanged { id, status });
        Ok(())
    }
}

impl Default for MemoryOutbox {
    fn default() -> Self {
        Self::new(crate::config::OutboxConfig::default().event_channel_capacity)
    }
}

impl OutboxStore for MemoryOutbox {
    fn messages(&self) -> Vec<OutboundMessage> {
        self.read().clone()
    }

    fn get(&self, id: LocalId) -> Option<OutboundMessage> {
        self.read().iter().find(|m| m.id == id).cloned()
    }

    fn first_sendable(&self) -> Option<OutboundMessage> {
        self.read().iter().find(|m| m.is_sendable()).cloned()
    }

    fn mark_sent(&self, id: LocalId) -> Result<(), OutboxError> {
        self.transition(id, OutboxStatus::Sent)
    }

    fn update_status(&self, id: LocalId, status: OutboxStatus) -> Result<(), OutboxError> {
        self.transition(id, status)
    }
}
