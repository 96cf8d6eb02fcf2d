//! Meshspace Core Library
//!
//! Local-first replicated chat workspace built on Automerge CRDTs.
//!
//! ## Overview
//!
//! Meshspace maps a chat domain model (users, channels, messages, threads)
//! onto a conflict-free replicated hierarchical map. Every replica works
//! fully offline and applies its edits locally; peers exchange document
//! deltas through a pluggable transport and always converge to the same
//! state, with no central authority. Durable state (channels, messages,
//! users) lives in the replicated document; ephemeral state (online
//! presence, typing indicators) is broadcast per-peer and expires on
//! disconnect.
//!
//! ## Core Principles
//!
//! - **Local-first**: operations apply synchronously against the local
//!   replica; sync happens out-of-band
//! - **Convergent**: merges are commutative, associative and idempotent
//! - **Fail closed**: mutating operations return errors, never panic past
//!   the store boundary; malformed peer records are skipped by readers
//!
//! ## Quick Start
//!
//! ```ignore
//! use meshspace_core::{LocalIdentity, LoopbackHub, MemorySnapshotStore,
//!                      User, WorkspaceConfig, WorkspaceStore};
//!
//! let hub = LoopbackHub::new();
//! let identity = LocalIdentity::with_user(User::new("ada", None));
//! let mut store = WorkspaceStore::new(
//!     WorkspaceConfig::default(),
//!     Box::new(hub.transport()),
//!     Box::new(MemorySnapshotStore::new()),
//!     Box::new(identity),
//! );
//!
//! store.initialize()?;
//! store.bootstrap_default_workspace()?;
//!
//! let channel = store.create_channel("design", "Design talk")?;
//! let message = store.create_message(&channel.id, "hello", None)?;
//! store.create_message(&channel.id, "a reply", Some(&message.id))?;
//!
//! for msg in store.messages(&channel.id)? {
//!     println!("{}: {}", msg.user_id, msg.text);
//! }
//! ```

pub mod codec;
pub mod error;
pub mod events;
pub mod identity;
pub mod presence;
pub mod storage;
pub mod store;
pub mod transport;
pub mod types;
pub mod workspace;

// Re-exports
pub use error::{StoreError, StoreResult};
pub use events::{ChangeOrigin, StoreEvent};
pub use identity::{IdentityProvider, LocalIdentity};
pub use presence::{Awareness, PresenceState, TypingIndicator, TYPING_TTL_MS};
pub use storage::{MemorySnapshotStore, RedbSnapshotStore, SnapshotStore};
pub use store::{WorkspaceConfig, WorkspaceStore};
pub use transport::{ConnId, DeltaTransport, LoopbackHub, LoopbackTransport, TransportEvent};
pub use types::{Channel, ChannelId, Message, MessageId, User, UserId};
pub use workspace::WorkspaceDoc;
