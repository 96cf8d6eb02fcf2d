//! Identity collaborator: the local user record and its change feed
//!
//! The identity provider supplies the local user and notifies the session
//! on profile changes, so the durable user record and published presence
//! stay in sync with profile edits.

use std::sync::Arc;

use tokio::sync::watch;

use crate::types::User;

/// Identity collaborator contract
pub trait IdentityProvider: Send {
    /// The local user record, if one has been set up
    fn current_user(&self) -> Option<User>;

    /// Change feed; receivers see a new value on every profile edit
    fn watch(&self) -> watch::Receiver<Option<User>>;
}

/// Owned identity provider holding the local user in-process
///
/// Cloneable: the session owns one handle, the host keeps another for
/// profile edits.
#[derive(Clone)]
pub struct LocalIdentity {
    tx: Arc<watch::Sender<Option<User>>>,
}

impl LocalIdentity {
    /// Create a provider with no user yet
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Create a provider with an existing user
    pub fn with_user(user: User) -> Self {
        let (tx, _) = watch::channel(Some(user));
        Self { tx: Arc::new(tx) }
    }

    /// Set or replace the local user, notifying watchers
    pub fn set_user(&self, user: User) {
        let _ = self.tx.send(Some(user));
    }

    /// Edit the local user's profile in place, notifying watchers
    ///
    /// No-op when no user has been set.
    pub fn update_profile(&self, edit: impl FnOnce(&mut User)) {
        self.tx.send_modify(|user| {
            if let Some(user) = user {
                edit(user);
            }
        });
    }

    /// Clear the local user (logout), notifying watchers
    pub fn clear(&self) {
        let _ = self.tx.send(None);
    }
}

impl Default for LocalIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityProvider for LocalIdentity {
    fn current_user(&self) -> Option<User> {
        self.tx.borrow().clone()
    }

    fn watch(&self) -> watch::Receiver<Option<User>> {
        self.tx.subscribe()
    }
}
