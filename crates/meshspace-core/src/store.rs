//! WorkspaceStore - the replicated store engine and session lifecycle
//!
//! WorkspaceStore owns one replica of the workspace: the Automerge document,
//! the transport/persistence/identity collaborators, and the ephemeral
//! awareness table. It is an owned session object, not a process-wide
//! singleton; tests run several independent sessions side by side.
//!
//! Operations apply locally and synchronously, then propagate out-of-band:
//! each local change is snapshotted to the persistence collaborator and
//! broadcast as an incremental delta through the transport, without the
//! caller waiting on either. Remote deltas, presence updates and peer
//! departures are drained by [`WorkspaceStore::process_incoming`], the
//! host's drive cycle. All mutating operations fail closed: an error means
//! no-op, state unchanged.
//!
//! # Example
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
//! let channel = store.create_channel("design", "Design talk")?;
//! store.create_message(&channel.id, "hello", None)?;
//! ```

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::events::{ChangeOrigin, StoreEvent};
use crate::identity::IdentityProvider;
use crate::presence::{Awareness, PresenceState};
use crate::storage::SnapshotStore;
use crate::transport::{ConnId, DeltaTransport, TransportEvent};
use crate::types::{now_millis, Channel, ChannelId, Message, MessageId, User, UserId};
use crate::workspace::WorkspaceDoc;

/// Default capacity for the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Session configuration supplied at construction
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    /// Room identifier the transport attaches to
    pub room: String,
    /// Storage identifier for the persistence collaborator
    pub storage_id: String,
    /// Signaling relay addresses handed to the transport
    pub relays: Vec<String>,
    /// Channel selected when the session starts
    pub default_channel: ChannelId,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            room: "meshspace-workspace".to_string(),
            storage_id: "meshspace-workspace".to_string(),
            relays: Vec::new(),
            default_channel: ChannelId::general(),
        }
    }
}

/// One replica's session over the shared workspace
pub struct WorkspaceStore {
    config: WorkspaceConfig,
    transport: Box<dyn DeltaTransport>,
    snapshots: Box<dyn SnapshotStore>,
    identity: Box<dyn IdentityProvider>,
    identity_rx: watch::Receiver<Option<User>>,
    doc: Option<WorkspaceDoc>,
    awareness: Awareness,
    current_channel: Option<ChannelId>,
    event_tx: broadcast::Sender<StoreEvent>,
    initialized: bool,
}

impl WorkspaceStore {
    /// Create a session over the given collaborators (not yet initialized)
    pub fn new(
        config: WorkspaceConfig,
        transport: Box<dyn DeltaTransport>,
        snapshots: Box<dyn SnapshotStore>,
        identity: Box<dyn IdentityProvider>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let identity_rx = identity.watch();
        Self {
            config,
            transport,
            snapshots,
            identity,
            identity_rx,
            doc: None,
            awareness: Awareness::new(),
            current_channel: None,
            event_tx,
            initialized: false,
        }
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Read access to the presence table
    pub fn awareness(&self) -> &Awareness {
        &self.awareness
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Session lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Initialize the session: load the last snapshot, attach the transport,
    /// publish presence and select the default channel
    ///
    /// Idempotent: a second call on a live session is a no-op. Requires the
    /// identity collaborator to supply a local user. A collaborator failure
    /// mid-initialization triggers a full [`disconnect`](Self::disconnect)
    /// so no partially-attached collaborators are left behind.
    pub fn initialize(&mut self) -> StoreResult<()> {
        if self.initialized {
            debug!("session already initialized, skipping");
            return Ok(());
        }

        let user = self.identity.current_user().ok_or_else(|| {
            StoreError::Collaborator("identity provider has no local user".to_string())
        })?;
        info!(room = %self.config.room, user = %user.id, "initializing workspace session");

        if let Err(err) = self.try_initialize(user) {
            warn!(%err, "initialization failed, tearing down partial session");
            self.disconnect();
            return Err(err);
        }
        Ok(())
    }

    fn try_initialize(&mut self, user: User) -> StoreResult<()> {
        let snapshot = self
            .snapshots
            .load(&self.config.storage_id)
            .map_err(|e| StoreError::Collaborator(format!("persistence load: {e}")))?;
        let mut doc = match snapshot {
            Some(bytes) => WorkspaceDoc::load(&bytes)?,
            None => WorkspaceDoc::new(),
        };
        doc.put_user(&user)?;
        self.doc = Some(doc);

        // Only identity edits made after this point should replay
        let _ = self.identity_rx.borrow_and_update();

        self.transport
            .connect(&self.config.room, &self.config.relays)
            .map_err(|e| StoreError::Collaborator(format!("transport connect: {e}")))?;

        self.awareness.set_local_user(user);
        self.publish_presence()
            .map_err(|e| StoreError::Collaborator(format!("presence publish: {e}")))?;

        self.current_channel = Some(self.config.default_channel.clone());
        self.initialized = true;
        self.persist_snapshot();

        // Announce our document so peers already in the room pick up the
        // seeded user record without waiting for our next edit
        let snapshot = self.doc.as_mut().map(|doc| doc.save());
        if let Some(snapshot) = snapshot {
            if let Err(err) = self.transport.broadcast_delta(&snapshot) {
                warn!(%err, "initial document broadcast failed");
            }
        }

        self.emit(StoreEvent::DocumentChanged {
            origin: ChangeOrigin::Local,
        });
        self.emit(StoreEvent::PresenceChanged);
        Ok(())
    }

    /// Tear the session down: presence, transport, persistence, document,
    /// in that order
    ///
    /// Collaborator errors are logged and teardown continues; calling this
    /// twice in a row produces no error and leaves state identical to a
    /// single call.
    pub fn disconnect(&mut self) {
        if !self.initialized && self.doc.is_none() && !self.transport.is_connected() {
            debug!("disconnect called with no active session");
            return;
        }
        info!("disconnecting workspace session");

        self.awareness.reset();
        if self.transport.is_connected() {
            if let Err(err) = self.transport.publish_presence(None) {
                warn!(%err, "failed to clear presence during teardown");
            }
        }
        if let Err(err) = self.transport.disconnect() {
            warn!(%err, "transport teardown failed");
        }

        if let Some(doc) = self.doc.as_mut() {
            let snapshot = doc.save();
            if let Err(err) = self.snapshots.save(&self.config.storage_id, &snapshot) {
                warn!(%err, "final snapshot save failed during teardown");
            }
        }

        self.doc = None;
        self.current_channel = None;
        self.initialized = false;
    }

    /// Drain pending transport events and identity changes
    ///
    /// Applies peer deltas to the document, updates the awareness table,
    /// answers newly-joined peers with the full document, and tidies a
    /// stale local typing indicator. Returns the number of deltas applied.
    pub fn process_incoming(&mut self) -> StoreResult<usize> {
        if !self.initialized {
            return Err(StoreError::NotInitialized);
        }

        if self.identity_rx.has_changed().unwrap_or(false) {
            let user = self.identity_rx.borrow_and_update().clone();
            if let Some(user) = user {
                debug!(user = %user.id, "local profile changed");
                if let Some(doc) = self.doc.as_mut() {
                    doc.put_user(&user)?;
                }
                self.after_local_change();
                self.awareness.set_local_user(user);
                self.publish_presence_lossy();
                self.emit(StoreEvent::PresenceChanged);
            }
        }

        let mut applied = 0;
        while let Some(event) = self.transport.try_recv() {
            match event {
                TransportEvent::Delta { from, payload } => {
                    let Some(doc) = self.doc.as_mut() else {
                        continue;
                    };
                    match doc.apply_sync_message(&payload) {
                        Ok(()) => {
                            applied += 1;
                            self.persist_snapshot();
                            self.emit(StoreEvent::DocumentChanged {
                                origin: ChangeOrigin::Remote,
                            });
                        }
                        Err(err) => warn!(%from, %err, "skipping invalid delta from peer"),
                    }
                }
                TransportEvent::Presence { from, payload } => match payload {
                    Some(bytes) => match PresenceState::from_payload(&bytes) {
                        Some(state) => {
                            self.awareness.apply_remote(from, state);
                            self.emit(StoreEvent::PresenceChanged);
                        }
                        None => warn!(%from, "skipping malformed presence payload"),
                    },
                    None => {
                        if self.awareness.remove(&from) {
                            self.emit(StoreEvent::PresenceChanged);
                        }
                    }
                },
                TransportEvent::PeerJoined { conn } => {
                    debug!(%conn, "peer joined, sending full document");
                    // Merges are idempotent, so a room-wide snapshot is safe
                    let snapshot = self.doc.as_mut().map(|doc| doc.save());
                    if let Some(snapshot) = snapshot {
                        if let Err(err) = self.transport.broadcast_delta(&snapshot) {
                            warn!(%err, "catch-up broadcast failed");
                        }
                    }
                    self.emit(StoreEvent::PeerJoined { conn });
                }
                TransportEvent::PeerGone { conn } => {
                    debug!(%conn, "peer gone, dropping presence");
                    self.awareness.remove(&conn);
                    self.emit(StoreEvent::PeerLeft { conn });
                    self.emit(StoreEvent::PresenceChanged);
                }
            }
        }

        if self.awareness.expire_local_typing(now_millis()) {
            self.publish_presence_lossy();
            self.emit(StoreEvent::PresenceChanged);
        }

        Ok(applied)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Channel operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Create a channel with a fresh id and an empty message map
    pub fn create_channel(&mut self, name: &str, description: &str) -> StoreResult<Channel> {
        if !self.initialized {
            return Err(StoreError::NotInitialized);
        }
        let user = self.require_user()?;
        let channel = Channel::new(name, description, user.id);
        let doc = self.doc.as_mut().ok_or(StoreError::NotInitialized)?;
        doc.create_channel(&channel)?;
        info!(channel = %channel.id, name, "channel created");
        self.after_local_change();
        Ok(channel)
    }

    /// Merge the supplied fields over the channel's metadata and stamp
    /// `updatedAt`
    pub fn update_channel(&mut self, channel: &Channel) -> StoreResult<()> {
        if !self.initialized {
            return Err(StoreError::NotInitialized);
        }
        let doc = self.doc.as_mut().ok_or(StoreError::NotInitialized)?;
        doc.update_channel_meta(channel, now_millis())?;
        self.after_local_change();
        Ok(())
    }

    /// Toggle the channel's archived flag; archived channels reject message
    /// mutations but stay readable
    pub fn archive_channel(&mut self, channel_id: &ChannelId) -> StoreResult<Channel> {
        if !self.initialized {
            return Err(StoreError::NotInitialized);
        }
        let doc = self.doc.as_mut().ok_or(StoreError::NotInitialized)?;
        let meta = doc.toggle_archived(channel_id, now_millis())?;
        info!(channel = %channel_id, archived = meta.archived, "channel archive toggled");
        self.after_local_change();
        Ok(meta)
    }

    /// Remove a channel subtree entirely (hard delete, irreversible)
    ///
    /// Clears the active-channel selection when it pointed at this channel.
    /// Removing an absent channel succeeds as a no-op.
    pub fn delete_channel(&mut self, channel_id: &ChannelId) -> StoreResult<()> {
        if !self.initialized {
            return Err(StoreError::NotInitialized);
        }
        let doc = self.doc.as_mut().ok_or(StoreError::NotInitialized)?;
        doc.remove_channel(channel_id)?;
        if self.current_channel.as_ref() == Some(channel_id) {
            self.current_channel = None;
        }
        info!(channel = %channel_id, "channel deleted");
        self.after_local_change();
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Message operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Create a message in a channel, or a thread reply when `parent_id`
    /// is given
    ///
    /// The parent must exist in the same channel and be a root message;
    /// threads are exactly one level deep. Sending clears the local typing
    /// indicator immediately.
    pub fn create_message(
        &mut self,
        channel_id: &ChannelId,
        text: &str,
        parent_id: Option<&MessageId>,
    ) -> StoreResult<Message> {
        if !self.initialized {
            return Err(StoreError::NotInitialized);
        }
        let user = self.require_user()?;
        let doc = self.doc.as_mut().ok_or(StoreError::NotInitialized)?;
        let meta = doc
            .channel_meta(channel_id)?
            .ok_or_else(|| StoreError::ChannelNotFound(channel_id.clone()))?;
        if meta.archived {
            return Err(StoreError::ChannelArchived(channel_id.clone()));
        }

        let message = Message::new(channel_id.clone(), user.id, text, parent_id.cloned());
        doc.insert_message(&message)?;

        if self.awareness.clear_typing() {
            self.publish_presence_lossy();
            self.emit(StoreEvent::PresenceChanged);
        }
        self.after_local_change();
        Ok(message)
    }

    /// Update a message's fields (everything except `id`), stamping
    /// `updatedAt`
    ///
    /// Authorship is not validated: any replica may update any message
    /// (the workspace trust model).
    pub fn update_message(&mut self, message: &Message) -> StoreResult<()> {
        if !self.initialized {
            return Err(StoreError::NotInitialized);
        }
        let doc = self.doc.as_mut().ok_or(StoreError::NotInitialized)?;
        let meta = doc
            .channel_meta(&message.channel_id)?
            .ok_or_else(|| StoreError::ChannelNotFound(message.channel_id.clone()))?;
        if meta.archived {
            return Err(StoreError::ChannelArchived(message.channel_id.clone()));
        }
        doc.update_message(message, now_millis())?;
        self.after_local_change();
        Ok(())
    }

    /// Soft-delete a message; deleting a root message soft-deletes every
    /// reply in its thread
    pub fn delete_message(&mut self, message: &Message) -> StoreResult<()> {
        if !self.initialized {
            return Err(StoreError::NotInitialized);
        }
        let doc = self.doc.as_mut().ok_or(StoreError::NotInitialized)?;
        let meta = doc
            .channel_meta(&message.channel_id)?
            .ok_or_else(|| StoreError::ChannelNotFound(message.channel_id.clone()))?;
        if meta.archived {
            return Err(StoreError::ChannelArchived(message.channel_id.clone()));
        }
        doc.mark_deleted(message, now_millis())?;
        debug!(message = %message.id, "message soft-deleted");
        self.after_local_change();
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Query surface (pure projections)
    // ═══════════════════════════════════════════════════════════════════════

    /// All channels, oldest first; empty before initialization
    pub fn channels(&self) -> StoreResult<Vec<Channel>> {
        match &self.doc {
            Some(doc) => doc.list_channels(),
            None => Ok(Vec::new()),
        }
    }

    /// One channel's metadata
    pub fn channel(&self, channel_id: &ChannelId) -> StoreResult<Option<Channel>> {
        match &self.doc {
            Some(doc) => doc.channel_meta(channel_id),
            None => Ok(None),
        }
    }

    /// A channel's visible root messages, oldest first
    pub fn messages(&self, channel_id: &ChannelId) -> StoreResult<Vec<Message>> {
        match &self.doc {
            Some(doc) => doc.list_messages(channel_id),
            None => Ok(Vec::new()),
        }
    }

    /// The visible replies in a message's thread, oldest first
    pub fn thread_messages(
        &self,
        message_id: &MessageId,
        channel_hint: Option<&ChannelId>,
    ) -> StoreResult<Vec<Message>> {
        match &self.doc {
            Some(doc) => doc.list_thread_messages(message_id, channel_hint),
            None => Ok(Vec::new()),
        }
    }

    /// A message by id, including soft-deleted records (identity stays
    /// addressable after deletion)
    pub fn message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> StoreResult<Option<Message>> {
        match &self.doc {
            Some(doc) => doc.get_message(channel_id, message_id),
            None => Ok(None),
        }
    }

    /// All user records, oldest first
    pub fn users(&self) -> StoreResult<Vec<User>> {
        match &self.doc {
            Some(doc) => doc.list_users(),
            None => Ok(Vec::new()),
        }
    }

    /// A user record by id
    pub fn user(&self, user_id: &UserId) -> StoreResult<Option<User>> {
        match &self.doc {
            Some(doc) => doc.get_user(user_id),
            None => Ok(None),
        }
    }

    /// Whether the workspace already has channels (seeded or synced)
    pub fn is_workspace_initialized(&self) -> StoreResult<bool> {
        match &self.doc {
            Some(doc) => Ok(!doc.is_empty()?),
            None => Ok(false),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Presence surface
    // ═══════════════════════════════════════════════════════════════════════

    /// Publish or clear the local typing indicator for a channel
    pub fn set_typing(&mut self, channel_id: &ChannelId, is_typing: bool) -> StoreResult<()> {
        if !self.initialized {
            return Err(StoreError::NotInitialized);
        }
        let changed = if is_typing {
            self.awareness.set_typing(channel_id.clone(), now_millis())
        } else {
            self.awareness.clear_typing()
        };
        if changed {
            self.publish_presence()?;
            self.emit(StoreEvent::PresenceChanged);
        }
        Ok(())
    }

    /// Users currently typing in a channel (3 s TTL, reader-evaluated)
    pub fn typing_users(&self, channel_id: &ChannelId) -> Vec<UserId> {
        self.awareness.typing_users(channel_id)
    }

    /// Users with any currently-published presence
    pub fn online_users(&self) -> Vec<UserId> {
        self.awareness.online_users()
    }

    pub fn is_user_online(&self, user_id: &UserId) -> bool {
        self.awareness.is_user_online(user_id)
    }

    /// Peers currently attached to the room, by connection id
    pub fn connected_peers(&self) -> Vec<ConnId> {
        self.transport.connected_peers()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Active channel selection
    // ═══════════════════════════════════════════════════════════════════════

    pub fn current_channel(&self) -> Option<&ChannelId> {
        self.current_channel.as_ref()
    }

    pub fn set_current_channel(&mut self, channel_id: Option<ChannelId>) {
        self.current_channel = channel_id;
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Bootstrap
    // ═══════════════════════════════════════════════════════════════════════

    /// Seed an empty workspace with the system user, the default channels
    /// and one welcome message each
    ///
    /// Returns `false` without touching the document when the workspace
    /// already has channels (seeded locally or synced from a peer).
    pub fn bootstrap_default_workspace(&mut self) -> StoreResult<bool> {
        if !self.initialized {
            return Err(StoreError::NotInitialized);
        }
        let doc = self.doc.as_mut().ok_or(StoreError::NotInitialized)?;
        if !doc.is_empty()? {
            return Ok(false);
        }

        let system = User {
            id: UserId::from("user-system"),
            username: "system".to_string(),
            full_name: Some("System Bot".to_string()),
            avatar_url: None,
            created_at: now_millis(),
            extra: Default::default(),
        };
        doc.put_user(&system)?;

        let defaults = [
            (
                "channel-general",
                "general",
                "General discussion channel",
                "msg-welcome-general",
                "Hello everyone! Welcome to the workspace.",
            ),
            (
                "channel-random",
                "random",
                "Random topics and fun stuff",
                "msg-welcome-random",
                "Anything goes in here.",
            ),
            (
                "channel-help",
                "help",
                "Get help with anything",
                "msg-welcome-help",
                "If anyone needs help, ask away.",
            ),
        ];
        for (channel_id, name, description, message_id, text) in defaults {
            // Stable ids: replicas seeding concurrently converge on one copy
            let channel = Channel {
                id: ChannelId::from(channel_id),
                name: name.to_string(),
                description: Some(description.to_string()),
                created_at: now_millis(),
                created_by: system.id.clone(),
                archived: false,
                updated_at: None,
                extra: Default::default(),
            };
            doc.create_channel(&channel)?;

            let message = Message {
                id: MessageId::from(message_id),
                channel_id: channel.id.clone(),
                user_id: system.id.clone(),
                text: text.to_string(),
                created_at: now_millis(),
                updated_at: None,
                deleted: false,
                parent_id: None,
                extra: Default::default(),
            };
            doc.insert_message(&message)?;
        }

        info!("seeded default workspace");
        self.after_local_change();
        Ok(true)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Internal helpers
    // ═══════════════════════════════════════════════════════════════════════

    fn require_user(&self) -> StoreResult<User> {
        self.identity.current_user().ok_or_else(|| {
            StoreError::Collaborator("identity provider has no local user".to_string())
        })
    }

    /// Persist, broadcast and announce a local document change
    ///
    /// Persistence and propagation are out-of-band from the caller's point
    /// of view: failures are logged, never surfaced, and the next change or
    /// teardown retries the snapshot.
    fn after_local_change(&mut self) {
        let delta = match self.doc.as_mut() {
            Some(doc) => doc.generate_sync_message(),
            None => return,
        };
        self.persist_snapshot();
        if self.transport.is_connected() && !delta.is_empty() {
            if let Err(err) = self.transport.broadcast_delta(&delta) {
                warn!(%err, "delta broadcast failed; peers will catch up on reconnect");
            }
        }
        self.emit(StoreEvent::DocumentChanged {
            origin: ChangeOrigin::Local,
        });
    }

    fn persist_snapshot(&mut self) {
        let Some(doc) = self.doc.as_mut() else {
            return;
        };
        let snapshot = doc.save();
        if let Err(err) = self.snapshots.save(&self.config.storage_id, &snapshot) {
            warn!(%err, "snapshot save failed; will retry on next change");
        }
    }

    fn publish_presence(&mut self) -> StoreResult<()> {
        let payload = self.awareness.local().and_then(|s| s.to_payload());
        self.transport.publish_presence(payload.as_deref())
    }

    fn publish_presence_lossy(&mut self) {
        if let Err(err) = self.publish_presence() {
            warn!(%err, "presence publish failed");
        }
    }

    fn emit(&self, event: StoreEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl Drop for WorkspaceStore {
    fn drop(&mut self) {
        if self.initialized {
            self.disconnect();
        }
    }
}
