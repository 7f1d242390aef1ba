use std::sync::{PoisonError, RwLock};

use crate::model::Auth;

/// Source of the currently logged-in session.
pub trait SessionProvider: Send + Sync {
    fn active_session(&self) -> Option<Auth>;

    /// Event queue registered for this session, if any. Sent along with
    /// messages so the server can match the echo to the local copy.
    fn event_queue_id(&self) -> Option<String> {
        None
    }
}

/// Captures the session active when a send series begins and answers
/// whether it is still the active one.
///
/// The session can change under us at any suspension point (logout, account
/// switch), so callers re-check [`AuthChecker::still_valid`] after every
/// await.
pub struct AuthChecker<'a, P: SessionProvider + ?Sized> {
    provider: &'a P,
    auth: Auth,
}

impl<'a, P: SessionProvider + ?Sized> AuthChecker<'a, P> {
    /// Returns `None` when nobody is logged in.
    pub fn new(provider: &'a P) -> Option<Self> {
        let auth = provider.active_session()?;
        Some(Self { provider, auth })
    }

    pub fn auth(&self) -> &Auth {
        &self.auth
    }

    pub fn still_valid(&self) -> bool {
        self.provider
            .active_session()
            .is_some_and(|current| current.same_identity(&self.auth))
    }
}

/// Session provider backed by a lock, for hosts that push login state into
/// the core.
#[derive(Debug, Default)]
pub struct SessionSlot {
    session: RwLock<Option<Auth>>,
    event_queue_id: RwLock<Option<String>>,
}

impl SessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn logged_in(auth: Auth) -> Self {
        let slot = Self::new();
        slot.login(auth);
        slot
    }

    pub fn login(&self, auth: Auth) {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(auth);
    }

    pub fn logout(&self) {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = None;
        *self
            .event_queue_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn set_event_queue_id(&self, queue_id: Option<String>) {
        *self
            .event_queue_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = queue_id;
    }
}

impl SessionProvider for SessionSlot {
    fn active_session(&self) -> Option<Auth> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn event_queue_id(&self) -> Option<String> {
        self.event_queue_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
