//! The active user session.
//!
//! Created at login, cleared at logout, read by every façade operation that
//! needs a token. Only one session is active at a time.

use std::sync::RwLock;

use crate::error::{Error, Result};
use crate::models::User;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub username: String,
    pub token: String,
    /// Local-only account; the token is synthetic and the server does not know it.
    pub is_offline: bool,
}

impl From<&User> for Session {
    fn from(user: &User) -> Self {
        Session {
            username: user.username.clone(),
            token: user.token.clone(),
            is_offline: user.is_offline,
        }
    }
}

/// Holder for the current [`Session`], single writer (the login flow).
#[derive(Debug, Default)]
pub struct SessionContext {
    current: RwLock<Option<Session>>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, session: Session) {
        // A poisoned lock only means a writer panicked; the value is still usable
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(session);
    }

    pub fn clear(&self) {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }

    pub fn get(&self) -> Option<Session> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn require(&self) -> Result<Session> {
        self.get().ok_or(Error::NoSession)
    }
}
