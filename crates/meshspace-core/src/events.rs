//! Change notifications emitted by the workspace store
//!
//! Readers subscribe and re-derive their projections (channel lists,
//! message lists, presence rosters) only when notified, instead of polling
//! on an interval. Events are advisory: they say *that* something changed,
//! the query surface says *what* the state now is.

use crate::transport::ConnId;

/// Where a document change originated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A local store operation
    Local,
    /// A delta merged from a peer
    Remote,
}

/// Events broadcast to store subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// The durable document changed; projections should be re-derived
    DocumentChanged { origin: ChangeOrigin },
    /// A peer attached to the room
    PeerJoined { conn: ConnId },
    /// A peer detached; its presence state is gone
    PeerLeft { conn: ConnId },
    /// Presence or typing state changed (local or remote)
    PresenceChanged,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_origin_equality() {
        assert_eq!(ChangeOrigin::Local, ChangeOrigin::Local);
        assert_ne!(ChangeOrigin::Local, ChangeOrigin::Remote);
    }

    #[test]
    fn test_event_equality() {
        let conn = ConnId(7);
        assert_eq!(
            StoreEvent::PeerJoined { conn },
            StoreEvent::PeerJoined { conn }
        );
        assert_ne!(
            StoreEvent::PeerJoined { conn },
            StoreEvent::PeerLeft { conn }
        );
    }
}
