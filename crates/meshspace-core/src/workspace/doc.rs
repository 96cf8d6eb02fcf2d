//! Automerge document wrapper for the replicated workspace
//!
//! WorkspaceDoc owns the conflict-free document holding users, channels,
//! messages and threads. It defines the map topology and the write
//! granularity of each subtree:
//!
//! ```text
//! ROOT
//! ├── users[userId]            = User JSON register (whole-object replace)
//! └── channels[channelId]      = map
//!     ├── meta                 = Channel JSON register (whole-object replace)
//!     └── messages[msgId]      = map of scalar fields (field-level writes)
//!         └── threads[replyId] = map of scalar fields, one level deep
//! ```
//!
//! Per-id map keys sidestep concurrent list-insertion conflicts entirely;
//! display order is recomputed from `createdAt` at read time. Merging is
//! delegated to Automerge, so applying the same set of remote changes in any
//! order, any number of times, converges.

use automerge::{
    transaction::{CommitOptions, Transactable},
    ActorId, AutoCommit, ObjId, ObjType, ReadDoc, ScalarValue, Value, ROOT,
};
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::codec::{self, FieldMap};
use crate::error::{StoreError, StoreResult};
use crate::types::{Channel, ChannelId, Message, MessageId, User, UserId};

const USERS: &str = "users";
const CHANNELS: &str = "channels";
const META: &str = "meta";
const MESSAGES: &str = "messages";
const THREADS: &str = "threads";

/// Fixed actor for the genesis change; see [`WorkspaceDoc::new`]
const GENESIS_ACTOR: &[u8] = b"meshspace-genesis";

const FIELD_ID: &str = "id";
const FIELD_DELETED: &str = "deleted";
const FIELD_UPDATED_AT: &str = "updatedAt";
const FIELD_PARENT_ID: &str = "parentId";

fn doc_err(e: automerge::AutomergeError) -> StoreError {
    StoreError::Document(e.to_string())
}

fn scalar_to_json(value: &ScalarValue) -> JsonValue {
    match value {
        ScalarValue::Str(s) => JsonValue::String(s.to_string()),
        ScalarValue::Int(i) => JsonValue::from(*i),
        ScalarValue::Uint(u) => JsonValue::from(*u),
        ScalarValue::F64(f) => serde_json::Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        ScalarValue::Boolean(b) => JsonValue::Bool(*b),
        ScalarValue::Timestamp(t) => JsonValue::from(*t),
        _ => JsonValue::Null,
    }
}

fn json_to_scalar(value: &JsonValue) -> ScalarValue {
    match value {
        JsonValue::String(s) => ScalarValue::Str(s.as_str().into()),
        JsonValue::Bool(b) => ScalarValue::Boolean(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                ScalarValue::Int(i)
            } else if let Some(u) = n.as_u64() {
                ScalarValue::Uint(u)
            } else {
                ScalarValue::F64(n.as_f64().unwrap_or(0.0))
            }
        }
        JsonValue::Null => ScalarValue::Null,
        // Arrays/objects from newer peers are carried as canonical JSON text
        other => ScalarValue::Str(other.to_string().into()),
    }
}

/// Automerge document wrapper for a chat workspace
///
/// Provides typed CRUD over the workspace topology. All operations are
/// tracked by Automerge for CRDT conflict resolution during sync.
///
/// # Example
///
/// ```ignore
/// let mut doc = WorkspaceDoc::new();
/// doc.create_channel(&channel)?;
/// doc.insert_message(&message)?;
///
/// for msg in doc.list_messages(&channel.id)? {
///     println!("{}: {}", msg.user_id, msg.text);
/// }
/// ```
pub struct WorkspaceDoc {
    doc: AutoCommit,
}

impl WorkspaceDoc {
    /// Create a new empty workspace document
    ///
    /// Initializes the root with empty `users` and `channels` maps. The
    /// genesis change uses a fixed actor and time zero, so replicas that
    /// create their document independently produce the identical change and
    /// end up sharing the same root map objects when they first merge.
    pub fn new() -> Self {
        let mut doc = AutoCommit::new();
        doc.set_actor(ActorId::from(GENESIS_ACTOR));
        doc.put_object(ROOT, USERS, ObjType::Map).unwrap();
        doc.put_object(ROOT, CHANNELS, ObjType::Map).unwrap();
        let _ = doc.commit_with(CommitOptions::default().with_time(0));
        doc.set_actor(ActorId::random());
        Self { doc }
    }

    /// Load a workspace document from saved bytes
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Document` if the bytes are not a valid
    /// Automerge document.
    pub fn load(data: &[u8]) -> StoreResult<Self> {
        let doc = AutoCommit::load(data).map_err(doc_err)?;
        Ok(Self { doc })
    }

    /// Save the full document state to bytes
    pub fn save(&mut self) -> Vec<u8> {
        self.doc.save()
    }

    /// Fork the document for concurrent editing
    pub fn fork(&mut self) -> Self {
        Self {
            doc: self.doc.fork(),
        }
    }

    /// Merge another document into this one
    ///
    /// The merge is commutative, associative and idempotent; the result is
    /// the same regardless of merge order or repetition.
    pub fn merge(&mut self, other: &mut WorkspaceDoc) -> StoreResult<()> {
        self.doc.merge(&mut other.doc).map_err(doc_err)?;
        Ok(())
    }

    /// Generate an incremental sync message (changes since the last save)
    pub fn generate_sync_message(&mut self) -> Vec<u8> {
        self.doc.save_incremental()
    }

    /// Apply a sync message from a peer
    ///
    /// Accepts both incremental change sets and full document saves.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Document` if the sync message is invalid.
    pub fn apply_sync_message(&mut self, data: &[u8]) -> StoreResult<()> {
        self.doc.load_incremental(data).map_err(doc_err)?;
        Ok(())
    }

    /// Get the document heads (change hashes)
    pub fn heads(&mut self) -> Vec<automerge::ChangeHash> {
        self.doc.get_heads()
    }

    /// Whether the workspace has no channels yet
    pub fn is_empty(&self) -> StoreResult<bool> {
        let channels = self.root_map(CHANNELS)?;
        Ok(self.doc.keys(&channels).next().is_none())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Users (whole-object registers)
    // ═══════════════════════════════════════════════════════════════════════

    /// Insert or replace a user record
    pub fn put_user(&mut self, user: &User) -> StoreResult<()> {
        let users = self.root_map(USERS)?;
        let raw = codec::encode_register(user)?;
        self.doc
            .put(&users, user.id.as_str(), raw)
            .map_err(doc_err)?;
        Ok(())
    }

    /// Get a user by id
    ///
    /// Returns `None` for missing or malformed records.
    pub fn get_user(&self, id: &UserId) -> StoreResult<Option<User>> {
        let users = self.root_map(USERS)?;
        match self.doc.get(&users, id.as_str()).map_err(doc_err)? {
            Some((value, _)) => Ok(value.to_str().and_then(codec::decode_register)),
            None => Ok(None),
        }
    }

    /// List all valid user records, oldest first
    pub fn list_users(&self) -> StoreResult<Vec<User>> {
        let users_obj = self.root_map(USERS)?;
        let ids: Vec<String> = self.doc.keys(&users_obj).collect();

        let mut users = Vec::new();
        for id in ids {
            let raw = match self.doc.get(&users_obj, &id).map_err(doc_err)? {
                Some((value, _)) => value.to_str().map(|s| s.to_string()),
                None => None,
            };
            match raw.as_deref().and_then(codec::decode_register::<User>) {
                Some(user) => users.push(user),
                None => warn!(user = %id, "skipping malformed user record"),
            }
        }

        users.sort_by_key(|u| u.created_at);
        Ok(users)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Channels (whole-object meta register + nested message map)
    // ═══════════════════════════════════════════════════════════════════════

    /// Create a channel subtree: meta register plus empty messages map
    pub fn create_channel(&mut self, channel: &Channel) -> StoreResult<()> {
        let channels = self.root_map(CHANNELS)?;
        let obj = self
            .doc
            .put_object(&channels, channel.id.as_str(), ObjType::Map)
            .map_err(doc_err)?;
        let raw = codec::encode_register(channel)?;
        self.doc.put(&obj, META, raw).map_err(doc_err)?;
        self.doc
            .put_object(&obj, MESSAGES, ObjType::Map)
            .map_err(doc_err)?;
        Ok(())
    }

    /// Get a channel's metadata by id
    ///
    /// Returns `None` for missing channels and malformed meta registers.
    pub fn channel_meta(&self, id: &ChannelId) -> StoreResult<Option<Channel>> {
        let Some(obj) = self.channel_obj(id)? else {
            return Ok(None);
        };
        match self.doc.get(&obj, META).map_err(doc_err)? {
            Some((value, _)) => Ok(value.to_str().and_then(codec::decode_register)),
            None => Ok(None),
        }
    }

    /// List all valid channels, oldest first
    pub fn list_channels(&self) -> StoreResult<Vec<Channel>> {
        let channels_obj = self.root_map(CHANNELS)?;
        let ids: Vec<String> = self.doc.keys(&channels_obj).collect();

        let mut channels = Vec::new();
        for id in ids {
            match self.channel_meta(&ChannelId::from(id.clone()))? {
                Some(channel) => channels.push(channel),
                None => warn!(channel = %id, "skipping channel with malformed meta"),
            }
        }

        channels.sort_by_key(|c| c.created_at);
        Ok(channels)
    }

    /// Replace a channel's meta register with the caller's fields merged
    /// over the previous value
    ///
    /// The previous object's keys (including unknown ones) are kept, the
    /// caller's keys win, and `updatedAt` is stamped last.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ChannelNotFound` if the channel or its meta
    /// register is missing or malformed.
    pub fn update_channel_meta(&mut self, channel: &Channel, now: i64) -> StoreResult<()> {
        let obj = self
            .channel_obj(&channel.id)?
            .ok_or_else(|| StoreError::ChannelNotFound(channel.id.clone()))?;

        let prev_raw = match self.doc.get(&obj, META).map_err(doc_err)? {
            Some((value, _)) => value.to_str().map(|s| s.to_string()),
            None => None,
        };
        let mut merged = match prev_raw.as_deref().map(serde_json::from_str::<JsonValue>) {
            Some(Ok(JsonValue::Object(map))) => map,
            _ => return Err(StoreError::ChannelNotFound(channel.id.clone())),
        };

        for (key, value) in codec::encode_fields(channel)? {
            merged.insert(key, value);
        }
        merged.insert(FIELD_UPDATED_AT.to_string(), JsonValue::from(now));

        let raw = serde_json::to_string(&JsonValue::Object(merged))
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.doc.put(&obj, META, raw).map_err(doc_err)?;
        Ok(())
    }

    /// Toggle a channel's archived flag, stamping `updatedAt`
    ///
    /// Returns the updated metadata.
    pub fn toggle_archived(&mut self, id: &ChannelId, now: i64) -> StoreResult<Channel> {
        let mut meta = self
            .channel_meta(id)?
            .ok_or_else(|| StoreError::ChannelNotFound(id.clone()))?;
        meta.archived = !meta.archived;
        meta.updated_at = Some(now);

        let obj = self
            .channel_obj(id)?
            .ok_or_else(|| StoreError::ChannelNotFound(id.clone()))?;
        let raw = codec::encode_register(&meta)?;
        self.doc.put(&obj, META, raw).map_err(doc_err)?;
        Ok(meta)
    }

    /// Remove a channel subtree entirely (hard delete)
    ///
    /// Removing an absent channel is a no-op.
    pub fn remove_channel(&mut self, id: &ChannelId) -> StoreResult<()> {
        if self.channel_obj(id)?.is_none() {
            return Ok(());
        }
        let channels = self.root_map(CHANNELS)?;
        self.doc.delete(&channels, id.as_str()).map_err(doc_err)?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Messages (field-level maps, threads one level deep)
    // ═══════════════════════════════════════════════════════════════════════

    /// Insert a new message into a channel's message map, or into its
    /// parent's thread map when `parent_id` is set
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ChannelNotFound` if the channel is missing, and
    /// `StoreError::ParentNotFound` if the parent does not exist or is
    /// itself a thread reply (threads are exactly one level deep).
    pub fn insert_message(&mut self, message: &Message) -> StoreResult<()> {
        let channel = self
            .channel_obj(&message.channel_id)?
            .ok_or_else(|| StoreError::ChannelNotFound(message.channel_id.clone()))?;
        let messages = self
            .map_slot(&channel, MESSAGES)?
            .ok_or_else(|| StoreError::ChannelNotFound(message.channel_id.clone()))?;

        let target = match &message.parent_id {
            Some(parent_id) => {
                let parent = self
                    .map_entry(&messages, parent_id.as_str())?
                    .ok_or_else(|| StoreError::ParentNotFound(parent_id.clone()))?;
                let parent_is_reply = match self.doc.get(&parent, FIELD_PARENT_ID).map_err(doc_err)?
                {
                    Some((value, _)) => value.to_str().is_some(),
                    None => false,
                };
                if parent_is_reply {
                    return Err(StoreError::ParentNotFound(parent_id.clone()));
                }
                self.ensure_map(&parent, THREADS)?
            }
            None => messages,
        };

        let obj = self
            .doc
            .put_object(&target, message.id.as_str(), ObjType::Map)
            .map_err(doc_err)?;
        self.write_fields(&obj, message, true)?;
        Ok(())
    }

    /// Update a message's fields (everything except `id`), stamping
    /// `updatedAt`
    ///
    /// `deleted` is never written back as `false`: soft delete is terminal.
    pub fn update_message(&mut self, message: &Message, now: i64) -> StoreResult<()> {
        let obj = self
            .find_message_obj(&message.channel_id, &message.id, message.parent_id.as_ref())?
            .ok_or_else(|| StoreError::MessageNotFound(message.id.clone()))?;
        self.write_fields(&obj, message, false)?;
        self.doc
            .put(&obj, FIELD_UPDATED_AT, now)
            .map_err(doc_err)?;
        Ok(())
    }

    /// Soft-delete a message, cascading to its thread replies when it is a
    /// root message
    ///
    /// Sets `deleted=true` and stamps `updatedAt` on the record and, for a
    /// root message, on every entry in its thread map. Records stay
    /// addressable; only projections exclude them.
    pub fn mark_deleted(&mut self, message: &Message, now: i64) -> StoreResult<()> {
        let obj = self
            .find_message_obj(&message.channel_id, &message.id, message.parent_id.as_ref())?
            .ok_or_else(|| StoreError::MessageNotFound(message.id.clone()))?;
        self.doc.put(&obj, FIELD_DELETED, true).map_err(doc_err)?;
        self.doc
            .put(&obj, FIELD_UPDATED_AT, now)
            .map_err(doc_err)?;

        if message.parent_id.is_none() {
            if let Some(threads) = self.map_slot(&obj, THREADS)? {
                let reply_ids: Vec<String> = self.doc.keys(&threads).collect();
                for reply_id in reply_ids {
                    let reply = match self.doc.get(&threads, &reply_id).map_err(doc_err)? {
                        Some((Value::Object(ObjType::Map), reply)) => reply,
                        _ => continue,
                    };
                    self.doc.put(&reply, FIELD_DELETED, true).map_err(doc_err)?;
                    self.doc
                        .put(&reply, FIELD_UPDATED_AT, now)
                        .map_err(doc_err)?;
                }
            }
        }
        Ok(())
    }

    /// Get a message by id, including soft-deleted records
    ///
    /// Searches the channel's root message map first, then every root
    /// message's thread map.
    pub fn get_message(
        &self,
        channel_id: &ChannelId,
        id: &MessageId,
    ) -> StoreResult<Option<Message>> {
        let Some(channel) = self.channel_obj(channel_id)? else {
            return Ok(None);
        };
        let Some(messages) = self.map_slot(&channel, MESSAGES)? else {
            return Ok(None);
        };

        if let Some(obj) = self.map_entry(&messages, id.as_str())? {
            return Ok(self.decode_message(&obj)?);
        }

        let root_ids: Vec<String> = self.doc.keys(&messages).collect();
        for root_id in root_ids {
            let Some(root) = self.map_entry(&messages, &root_id)? else {
                continue;
            };
            let Some(threads) = self.map_slot(&root, THREADS)? else {
                continue;
            };
            if let Some(obj) = self.map_entry(&threads, id.as_str())? {
                return Ok(self.decode_message(&obj)?);
            }
        }
        Ok(None)
    }

    /// List a channel's visible root messages, oldest first
    ///
    /// Filters out soft-deleted records, thread replies and malformed nodes.
    pub fn list_messages(&self, channel_id: &ChannelId) -> StoreResult<Vec<Message>> {
        let Some(channel) = self.channel_obj(channel_id)? else {
            return Ok(Vec::new());
        };
        let Some(messages_obj) = self.map_slot(&channel, MESSAGES)? else {
            return Ok(Vec::new());
        };

        let ids: Vec<String> = self.doc.keys(&messages_obj).collect();
        let mut messages = Vec::new();
        for id in ids {
            let Some(obj) = self.map_entry(&messages_obj, &id)? else {
                continue;
            };
            match self.decode_message(&obj)? {
                Some(msg) if !msg.deleted && msg.is_root() => messages.push(msg),
                Some(_) => {}
                None => warn!(message = %id, "skipping malformed message node"),
            }
        }

        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    /// List the visible replies in a message's thread, oldest first
    ///
    /// The channel hint avoids a workspace-wide scan; when absent, channels
    /// are searched for the parent message. Missing parents or threads
    /// project to an empty list.
    pub fn list_thread_messages(
        &self,
        message_id: &MessageId,
        channel_hint: Option<&ChannelId>,
    ) -> StoreResult<Vec<Message>> {
        let channel = match channel_hint {
            Some(id) => self.channel_obj(id)?,
            None => self.find_channel_containing(message_id)?,
        };
        let Some(channel) = channel else {
            return Ok(Vec::new());
        };
        let Some(messages) = self.map_slot(&channel, MESSAGES)? else {
            return Ok(Vec::new());
        };
        let Some(parent) = self.map_entry(&messages, message_id.as_str())? else {
            return Ok(Vec::new());
        };
        let Some(threads) = self.map_slot(&parent, THREADS)? else {
            return Ok(Vec::new());
        };

        let ids: Vec<String> = self.doc.keys(&threads).collect();
        let mut replies = Vec::new();
        for id in ids {
            let Some(obj) = self.map_entry(&threads, &id)? else {
                continue;
            };
            match self.decode_message(&obj)? {
                Some(msg) if !msg.deleted => replies.push(msg),
                Some(_) => {}
                None => warn!(message = %id, "skipping malformed thread reply"),
            }
        }

        replies.sort_by_key(|m| m.created_at);
        Ok(replies)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Internal helpers
    // ═══════════════════════════════════════════════════════════════════════

    fn root_map(&self, key: &str) -> StoreResult<ObjId> {
        match self.doc.get(ROOT, key).map_err(doc_err)? {
            Some((Value::Object(ObjType::Map), obj)) => Ok(obj),
            _ => Err(StoreError::Document(format!("{key} map not found"))),
        }
    }

    /// Get a named map-valued slot of an object, if present
    fn map_slot(&self, obj: &ObjId, key: &str) -> StoreResult<Option<ObjId>> {
        match self.doc.get(obj, key).map_err(doc_err)? {
            Some((Value::Object(ObjType::Map), slot)) => Ok(Some(slot)),
            _ => Ok(None),
        }
    }

    /// Get a map-valued entry of a map, if present
    fn map_entry(&self, obj: &ObjId, key: &str) -> StoreResult<Option<ObjId>> {
        match self.doc.get(obj, key).map_err(doc_err)? {
            Some((Value::Object(ObjType::Map), entry)) => Ok(Some(entry)),
            _ => Ok(None),
        }
    }

    fn ensure_map(&mut self, obj: &ObjId, key: &str) -> StoreResult<ObjId> {
        if let Some(existing) = self.map_slot(obj, key)? {
            return Ok(existing);
        }
        self.doc.put_object(obj, key, ObjType::Map).map_err(doc_err)
    }

    fn channel_obj(&self, id: &ChannelId) -> StoreResult<Option<ObjId>> {
        let channels = self.root_map(CHANNELS)?;
        self.map_entry(&channels, id.as_str())
    }

    fn find_channel_containing(&self, message_id: &MessageId) -> StoreResult<Option<ObjId>> {
        let channels = self.root_map(CHANNELS)?;
        let ids: Vec<String> = self.doc.keys(&channels).collect();
        for id in ids {
            let Some(channel) = self.map_entry(&channels, &id)? else {
                continue;
            };
            let Some(messages) = self.map_slot(&channel, MESSAGES)? else {
                continue;
            };
            if self.map_entry(&messages, message_id.as_str())?.is_some() {
                return Ok(Some(channel));
            }
        }
        Ok(None)
    }

    /// Locate a message map, falling back to the parent's thread map when
    /// the message is a reply
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ChannelNotFound` if the channel is missing.
    fn find_message_obj(
        &self,
        channel_id: &ChannelId,
        id: &MessageId,
        parent_id: Option<&MessageId>,
    ) -> StoreResult<Option<ObjId>> {
        let channel = self
            .channel_obj(channel_id)?
            .ok_or_else(|| StoreError::ChannelNotFound(channel_id.clone()))?;
        let Some(messages) = self.map_slot(&channel, MESSAGES)? else {
            return Ok(None);
        };

        if let Some(obj) = self.map_entry(&messages, id.as_str())? {
            return Ok(Some(obj));
        }
        if let Some(parent_id) = parent_id {
            if let Some(parent) = self.map_entry(&messages, parent_id.as_str())? {
                if let Some(threads) = self.map_slot(&parent, THREADS)? {
                    return self.map_entry(&threads, id.as_str());
                }
            }
        }
        Ok(None)
    }

    /// Read a message map's scalar fields into a field map
    ///
    /// Nested objects (the `threads` map) are not message fields and are
    /// skipped.
    fn read_fields(&self, obj: &ObjId) -> StoreResult<FieldMap> {
        let keys: Vec<String> = self.doc.keys(obj).collect();
        let mut fields = FieldMap::new();
        for key in keys {
            if let Some((Value::Scalar(scalar), _)) = self.doc.get(obj, &key).map_err(doc_err)? {
                fields.insert(key, scalar_to_json(scalar.as_ref()));
            }
        }
        Ok(fields)
    }

    fn decode_message(&self, obj: &ObjId) -> StoreResult<Option<Message>> {
        Ok(codec::decode_fields(self.read_fields(obj)?))
    }

    /// Write a message's encoded fields into its map
    ///
    /// Updates skip `id`; `deleted=false` is never encoded, so the flag is
    /// write-once in practice.
    fn write_fields(&mut self, obj: &ObjId, message: &Message, include_id: bool) -> StoreResult<()> {
        for (key, value) in codec::encode_fields(message)? {
            // `threads` is a schema slot, never a message field
            if key == THREADS || (!include_id && key == FIELD_ID) {
                continue;
            }
            self.doc
                .put(obj, key, json_to_scalar(&value))
                .map_err(doc_err)?;
        }
        Ok(())
    }
}

impl Default for WorkspaceDoc {
    fn default() -> Self {
        Self::new()
    }
}
