//! Expiry of outbox messages that stayed unsent for too long.
//!
//! Each non-terminal message gets a timer due at `created_at + decay_time`.
//! When it runs out the message moves to [`OutboxStatus::Age`], which is
//! terminal, so the sending engine stops trying it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::event::OutboxEvent;
use crate::model::{LocalId, OutboundMessage, OutboxStatus, UnixTimeMs};
use crate::outbox::OutboxStore;

pub struct DecayTimer<S: ?Sized> {
    store: Arc<S>,
    decay_time: Duration,
    timers: Mutex<HashMap<LocalId, JoinHandle<()>>>,
}

impl<S> DecayTimer<S>
where
    S: OutboxStore + ?Sized + 'static,
{
    pub fn new(store: Arc<S>, decay_time: Duration) -> Self {
        Self {
            store,
            decay_time,
            timers: Mutex::new(HashMap::new()),
        }
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<LocalId, JoinHandle<()>>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of timers still pending.
    pub fn pending(&self) -> usize {
        self.timers().values().filter(|t| !t.is_finished()).count()
    }

    /// Bring the timers in line with the outbox: one per present
    /// non-terminal message, none for anything else. Idempotent.
    pub fn sync(&self) {
        let messages = self.store.messages();
        let mut timers = self.timers();

        timers.retain(|id, handle| {
            let keep = messages.iter().any(|m| m.id == *id && !m.is_terminal());
            if !keep {
                handle.abort();
            }
            keep
        });

        for message in messages.iter().filter(|m| !m.is_terminal()) {
            let running = timers.get(&message.id).is_some_and(|t| !t.is_finished());
            if running {
                continue;
            }
            match self.spawn_timer(message) {
                Some(handle) => {
                    timers.insert(message.id, handle);
                }
                None => break,
            }
        }
    }

    fn spawn_timer(&self, message: &OutboundMessage) -> Option<JoinHandle<()>> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("decay timer used outside a tokio runtime; no timers armed");
            return None;
        };

        let decay_ms = u64::try_from(self.decay_time.as_millis()).unwrap_or(u64::MAX);
        let deadline = message.created_at.saturating_add(decay_ms);
        let remaining_ms = UnixTimeMs::now().millis_until(deadline);
        let store = Arc::clone(&self.store);
        let id = message.id;

        debug!(%id, remaining_ms, "decay timer armed");
        Some(runtime.spawn(async move {
            tokio::time::sleep(Duration::from_millis(remaining_ms)).await;
            decay(store.as_ref(), id);
        }))
    }

    /// Re-sync on every outbox change until the channel closes or the timer
    /// is dropped.
    pub fn watch(self: &Arc<Self>, mut events: broadcast::Receiver<OutboxEvent>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.sync();
        tokio::spawn(async move {
            loop {
                let received = events.recv().await;
                if matches!(received, Err(RecvError::Closed)) {
                    break;
                }
                let Some(timer) = weak.upgrade() else {
                    break;
                };
                timer.sync();
            }
        })
    }
}

impl<S: ?Sized> Drop for DecayTimer<S> {
    fn drop(&mut self) {
        let timers = self.timers.get_mut().unwrap_or_else(PoisonError::into_inner);
        for handle in timers.values() {
            handle.abort();
        }
    }
}

/// Expire one message, remembering the status it had.
pub fn decay<S: OutboxStore + ?Sized>(store: &S, id: LocalId) {
    let Some(message) = store.get(id) else {
        error!(%id, "decay timer ran out for nonexistent outbox message");
        return;
    };
    let status = OutboxStatus::Age {
        previous: Box::new(message.status),
    };
    match store.update_status(id, status) {
        Ok(()) => info!(%id, "outbox message expired unsent"),
        Err(err) => debug!(%id, error = %err, "outbox message not expired"),
    }
}
