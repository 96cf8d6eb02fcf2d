//! Transport collaborator contract and in-process loopback implementation
//!
//! The store engine never talks to the network directly: it hands opaque
//! document deltas and presence payloads to a [`DeltaTransport`] and drains
//! incoming [`TransportEvent`]s from it. A production transport exchanges
//! deltas with discovered peers over a signaling relay; connectivity
//! failures stay inside the transport, which only ever reports connected
//! vs. not connected while the store keeps accepting local writes.
//!
//! [`LoopbackHub`] is the shipped reference implementation: an in-process
//! room-keyed fan-out used by the integration tests and by anything that
//! wants several sessions in one process.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::error::{StoreError, StoreResult};

/// Ephemeral connection id, unique per transport attachment
///
/// Presence state is keyed by this id, not by user id: the same user on two
/// devices is two connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

impl ConnId {
    /// Generate a random connection id
    pub fn generate() -> Self {
        Self(rand::random())
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{:016x}", self.0)
    }
}

/// Events delivered by a transport to its session
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A document delta from a peer (opaque bytes, merged by the store)
    Delta { from: ConnId, payload: Vec<u8> },
    /// A peer's presence payload; `None` clears the peer's state
    Presence {
        from: ConnId,
        payload: Option<Vec<u8>>,
    },
    /// A new peer attached to the room
    PeerJoined { conn: ConnId },
    /// A peer detached; all its ephemeral state must be dropped
    PeerGone { conn: ConnId },
}

/// Contract the store engine consumes for delta exchange
///
/// Implementations must deliver every broadcast to every other room member
/// at least once; the store's merges are idempotent, so duplicates are
/// harmless.
pub trait DeltaTransport: Send {
    /// Attach to a room via the given signaling relays
    fn connect(&mut self, room: &str, relays: &[String]) -> StoreResult<()>;

    /// Detach from the room, dropping peer state on the other side
    fn disconnect(&mut self) -> StoreResult<()>;

    fn is_connected(&self) -> bool;

    /// This attachment's ephemeral connection id
    fn conn_id(&self) -> ConnId;

    /// Send a document delta to every other room member
    fn broadcast_delta(&mut self, payload: &[u8]) -> StoreResult<()>;

    /// Publish (or with `None`, clear) this peer's presence payload
    fn publish_presence(&mut self, payload: Option<&[u8]>) -> StoreResult<()>;

    /// Currently attached peers, keyed by connection id
    fn connected_peers(&self) -> Vec<ConnId>;

    /// Drain one pending event, if any
    fn try_recv(&mut self) -> Option<TransportEvent>;
}

#[derive(Default)]
struct Room {
    members: HashMap<ConnId, UnboundedSender<TransportEvent>>,
    presence: HashMap<ConnId, Vec<u8>>,
}

#[derive(Default)]
struct HubInner {
    rooms: HashMap<String, Room>,
}

/// In-process transport hub: every [`LoopbackTransport`] attached to the
/// same room sees every other member's deltas and presence
#[derive(Clone, Default)]
pub struct LoopbackHub {
    inner: Arc<Mutex<HubInner>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport bound to this hub
    pub fn transport(&self) -> LoopbackTransport {
        LoopbackTransport {
            hub: self.clone(),
            conn: ConnId::generate(),
            room: None,
            rx: None,
        }
    }

    fn join(&self, room: &str, conn: ConnId, tx: UnboundedSender<TransportEvent>) {
        let mut inner = self.inner.lock();
        let entry = inner.rooms.entry(room.to_string()).or_default();
        for member_tx in entry.members.values() {
            let _ = member_tx.send(TransportEvent::PeerJoined { conn });
        }
        // Late joiners still see who is already present
        for (&peer, payload) in &entry.presence {
            let _ = tx.send(TransportEvent::Presence {
                from: peer,
                payload: Some(payload.clone()),
            });
        }
        entry.members.insert(conn, tx);
    }

    fn leave(&self, room: &str, conn: ConnId) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.rooms.get_mut(room) {
            entry.members.remove(&conn);
            entry.presence.remove(&conn);
            for member_tx in entry.members.values() {
                let _ = member_tx.send(TransportEvent::PeerGone { conn });
            }
        }
    }

    fn broadcast_delta(&self, room: &str, from: ConnId, payload: &[u8]) {
        let inner = self.inner.lock();
        if let Some(entry) = inner.rooms.get(room) {
            for (&member, member_tx) in &entry.members {
                if member != from {
                    let _ = member_tx.send(TransportEvent::Delta {
                        from,
                        payload: payload.to_vec(),
                    });
                }
            }
        }
    }

    fn set_presence(&self, room: &str, from: ConnId, payload: Option<Vec<u8>>) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.rooms.get_mut(room) {
            match &payload {
                Some(bytes) => {
                    entry.presence.insert(from, bytes.clone());
                }
                None => {
                    entry.presence.remove(&from);
                }
            }
            for (&member, member_tx) in &entry.members {
                if member != from {
                    let _ = member_tx.send(TransportEvent::Presence {
                        from,
                        payload: payload.clone(),
                    });
                }
            }
        }
    }

    fn peers(&self, room: &str, this: ConnId) -> Vec<ConnId> {
        let inner = self.inner.lock();
        inner
            .rooms
            .get(room)
            .map(|entry| {
                entry
                    .members
                    .keys()
                    .copied()
                    .filter(|&c| c != this)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// One attachment to a [`LoopbackHub`] room
pub struct LoopbackTransport {
    hub: LoopbackHub,
    conn: ConnId,
    room: Option<String>,
    rx: Option<UnboundedReceiver<TransportEvent>>,
}

impl DeltaTransport for LoopbackTransport {
    fn connect(&mut self, room: &str, relays: &[String]) -> StoreResult<()> {
        if self.room.is_some() {
            return Ok(());
        }
        debug!(%room, ?relays, conn = %self.conn, "loopback transport connecting");
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub.join(room, self.conn, tx);
        self.room = Some(room.to_string());
        self.rx = Some(rx);
        Ok(())
    }

    fn disconnect(&mut self) -> StoreResult<()> {
        if let Some(room) = self.room.take() {
            debug!(%room, conn = %self.conn, "loopback transport disconnecting");
            self.hub.leave(&room, self.conn);
        }
        self.rx = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.room.is_some()
    }

    fn conn_id(&self) -> ConnId {
        self.conn
    }

    fn broadcast_delta(&mut self, payload: &[u8]) -> StoreResult<()> {
        let room = self
            .room
            .as_deref()
            .ok_or_else(|| StoreError::Collaborator("transport not connected".to_string()))?;
        self.hub.broadcast_delta(room, self.conn, payload);
        Ok(())
    }

    fn publish_presence(&mut self, payload: Option<&[u8]>) -> StoreResult<()> {
        let room = self
            .room
            .as_deref()
            .ok_or_else(|| StoreError::Collaborator("transport not connected".to_string()))?;
        self.hub
            .set_presence(room, self.conn, payload.map(|p| p.to_vec()));
        Ok(())
    }

    fn connected_peers(&self) -> Vec<ConnId> {
        match &self.room {
            Some(room) => self.hub.peers(room, self.conn),
            None => Vec::new(),
        }
    }

    fn try_recv(&mut self) -> Option<TransportEvent> {
        self.rx.as_mut().and_then(|rx| rx.try_recv().ok())
    }
}
