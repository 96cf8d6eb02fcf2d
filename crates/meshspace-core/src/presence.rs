//! Ephemeral presence and typing awareness
//!
//! Presence is per-peer broadcast state, independent of the durable
//! document: it is never persisted and vanishes when a peer disconnects.
//! Each peer publishes one [`PresenceState`] (its user snapshot plus an
//! optional typing indicator) keyed by its ephemeral connection id.
//!
//! Liveness is evaluated by readers, not writers: a typing indicator counts
//! only while `now - timestamp < 3000 ms`, so no timer synchronization
//! across peers is required. Peer state is removed outright when the
//! transport reports the connection gone.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::transport::ConnId;
use crate::types::{now_millis, ChannelId, User, UserId};

/// How long a typing indicator stays live without refresh
pub const TYPING_TTL_MS: i64 = 3_000;

/// A peer's claim to be typing in a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingIndicator {
    pub channel_id: ChannelId,
    pub user_id: UserId,
    /// Unix timestamp in milliseconds; readers apply the TTL against it
    pub timestamp: i64,
}

/// One peer's published presence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    pub user: User,
    #[serde(default)]
    pub typing: Option<TypingIndicator>,
}

impl PresenceState {
    /// Encode for broadcast
    pub fn to_payload(&self) -> Option<Vec<u8>> {
        serde_json::to_vec(self).ok()
    }

    /// Decode a peer payload, treating malformed input as absent
    pub fn from_payload(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

/// Awareness table: the local replica's state plus every live peer's state
///
/// Readers derive "online" and "typing" from the current table; there is no
/// durable record of either.
#[derive(Debug, Default)]
pub struct Awareness {
    local: Option<PresenceState>,
    remote: HashMap<ConnId, PresenceState>,
}

impl Awareness {
    pub fn new() -> Self {
        Self::default()
    }

    /// The local replica's published state, if any
    pub fn local(&self) -> Option<&PresenceState> {
        self.local.as_ref()
    }

    /// Set or refresh the local user snapshot, keeping any typing indicator
    pub fn set_local_user(&mut self, user: User) {
        match &mut self.local {
            Some(state) => state.user = user,
            None => {
                self.local = Some(PresenceState { user, typing: None });
            }
        }
    }

    /// Publish a local typing indicator for a channel
    ///
    /// Returns `false` when no local user has been published yet.
    pub fn set_typing(&mut self, channel_id: ChannelId, now: i64) -> bool {
        match &mut self.local {
            Some(state) => {
                state.typing = Some(TypingIndicator {
                    channel_id,
                    user_id: state.user.id.clone(),
                    timestamp: now,
                });
                true
            }
            None => false,
        }
    }

    /// Clear the local typing indicator; returns whether anything changed
    pub fn clear_typing(&mut self) -> bool {
        match &mut self.local {
            Some(state) => state.typing.take().is_some(),
            None => false,
        }
    }

    /// Clear a local typing indicator that has outlived the TTL
    ///
    /// Readers already ignore stale indicators; this just tidies the
    /// published state. Returns whether anything changed.
    pub fn expire_local_typing(&mut self, now: i64) -> bool {
        let stale = self
            .local
            .as_ref()
            .and_then(|s| s.typing.as_ref())
            .is_some_and(|t| now - t.timestamp >= TYPING_TTL_MS);
        if stale {
            self.clear_typing()
        } else {
            false
        }
    }

    /// Apply a peer's published state
    pub fn apply_remote(&mut self, conn: ConnId, state: PresenceState) {
        debug!(%conn, user = %state.user.id, "presence update");
        self.remote.insert(conn, state);
    }

    /// Remove a peer's state entirely (disconnect or explicit clear)
    pub fn remove(&mut self, conn: &ConnId) -> bool {
        self.remote.remove(conn).is_some()
    }

    /// Drop local and remote state (session teardown)
    pub fn reset(&mut self) {
        self.local = None;
        self.remote.clear();
    }

    /// Number of live remote peers
    pub fn peer_count(&self) -> usize {
        self.remote.len()
    }

    /// All current states, local first
    pub fn states(&self) -> impl Iterator<Item = &PresenceState> {
        self.local.iter().chain(self.remote.values())
    }

    /// Ids of users with any currently-published state
    pub fn online_users(&self) -> Vec<UserId> {
        let mut users = Vec::new();
        for state in self.states() {
            if !users.contains(&state.user.id) {
                users.push(state.user.id.clone());
            }
        }
        users
    }

    /// Whether a user has any currently-published state
    pub fn is_user_online(&self, user_id: &UserId) -> bool {
        self.states().any(|s| &s.user.id == user_id)
    }

    /// Users typing in a channel as of `now` (TTL applied by the reader)
    pub fn typing_users_at(&self, channel_id: &ChannelId, now: i64) -> Vec<UserId> {
        let mut users = Vec::new();
        for state in self.states() {
            let Some(typing) = &state.typing else {
                continue;
            };
            if &typing.channel_id == channel_id
                && now - typing.timestamp < TYPING_TTL_MS
                && !users.contains(&state.user.id)
            {
                users.push(state.user.id.clone());
            }
        }
        users
    }

    /// Users typing in a channel right now
    pub fn typing_users(&self, channel_id: &ChannelId) -> Vec<UserId> {
        self.typing_users_at(channel_id, now_millis())
    }
}
