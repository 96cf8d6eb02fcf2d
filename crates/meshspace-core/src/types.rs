//! Core types for the meshspace workspace
//!
//! Entity records mirror the replicated document's node shapes. Serialized
//! keys are camelCase so encoded nodes interoperate with other workspace
//! implementations, and every record carries a flattened `extra` map that
//! preserves unknown keys written by newer peers.

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use ulid::Ulid;

/// Current Unix timestamp in milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh globally-unique id
            pub fn generate() -> Self {
                Self(format!(concat!($prefix, "-{}"), Ulid::new()))
            }

            /// Borrow the raw id string
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self(raw)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self(raw.to_string())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Opaque identifier for a workspace member
    UserId,
    "user"
);

id_type!(
    /// Opaque identifier for a channel
    ChannelId,
    "channel"
);

id_type!(
    /// Opaque identifier for a message (root or thread reply)
    MessageId,
    "msg"
);

impl ChannelId {
    /// Well-known id of the default channel every session starts in
    pub fn general() -> Self {
        Self::from("channel-general")
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A workspace member.
///
/// Created once at local session start, updated only by its own replica,
/// visible workspace-wide. Users are never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    /// Unix timestamp in milliseconds
    pub created_at: i64,
    /// Unknown keys from newer peers, preserved across round-trips
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

impl User {
    /// Create a new user with a fresh id
    pub fn new(username: impl Into<String>, full_name: Option<String>) -> Self {
        Self {
            id: UserId::generate(),
            username: username.into(),
            full_name,
            avatar_url: None,
            created_at: now_millis(),
            extra: JsonMap::new(),
        }
    }
}

/// Channel metadata.
///
/// Stored as a single whole-object register: every settings change rewrites
/// the full record, so concurrent edits resolve last-writer-wins on the
/// whole object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Unix timestamp in milliseconds
    pub created_at: i64,
    pub created_by: UserId,
    #[serde(default)]
    pub archived: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

impl Channel {
    /// Create a new channel with a fresh id
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        created_by: UserId,
    ) -> Self {
        Self {
            id: ChannelId::generate(),
            name: name.into(),
            description: Some(description.into()),
            created_at: now_millis(),
            created_by,
            archived: false,
            updated_at: None,
            extra: JsonMap::new(),
        }
    }
}

/// A chat message, root or thread reply.
///
/// Message nodes use field-level writes in the document, so `deleted` can be
/// flipped without touching `text`. `deleted` is only ever encoded when
/// `true`: soft delete is terminal and a stale update cannot resurrect a
/// concurrently deleted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub text: String,
    /// Unix timestamp in milliseconds
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    /// Set on thread replies; threads are one level deep
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

impl Message {
    /// Create a new message with a fresh id
    pub fn new(
        channel_id: ChannelId,
        user_id: UserId,
        text: impl Into<String>,
        parent_id: Option<MessageId>,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            channel_id,
            user_id,
            text: text.into(),
            created_at: now_millis(),
            updated_at: None,
            deleted: false,
            parent_id,
            extra: JsonMap::new(),
        }
    }

    /// Whether this is a root message (owns a thread)
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(ChannelId::generate(), ChannelId::generate());
        assert_ne!(MessageId::generate(), MessageId::generate());
        assert_ne!(UserId::generate(), UserId::generate());
    }

    #[test]
    fn test_id_prefixes() {
        assert!(ChannelId::generate().as_str().starts_with("channel-"));
        assert!(MessageId::generate().as_str().starts_with("msg-"));
        assert!(UserId::generate().as_str().starts_with("user-"));
    }

    #[test]
    fn test_general_channel_id() {
        assert_eq!(ChannelId::general().as_str(), "channel-general");
    }

    #[test]
    fn test_user_creation() {
        let user = User::new("ada", Some("Ada Lovelace".to_string()));
        assert_eq!(user.username, "ada");
        assert_eq!(user.full_name.as_deref(), Some("Ada Lovelace"));
        assert!(user.created_at > 0);
    }

    #[test]
    fn test_channel_starts_unarchived() {
        let channel = Channel::new("design", "Design talk", UserId::generate());
        assert!(!channel.archived);
        assert!(channel.updated_at.is_none());
    }

    #[test]
    fn test_message_root_and_reply() {
        let channel_id = ChannelId::generate();
        let user_id = UserId::generate();
        let root = Message::new(channel_id.clone(), user_id.clone(), "hello", None);
        assert!(root.is_root());

        let reply = Message::new(channel_id, user_id, "reply", Some(root.id.clone()));
        assert!(!reply.is_root());
        assert_eq!(reply.parent_id.as_ref(), Some(&root.id));
    }

    #[test]
    fn test_message_serializes_camel_case() {
        let msg = Message::new(
            ChannelId::from("channel-general"),
            UserId::from("user-1"),
            "hi",
            None,
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("channelId").is_some());
        assert!(value.get("createdAt").is_some());
        // deleted=false and absent optionals stay off the wire
        assert!(value.get("deleted").is_none());
        assert!(value.get("parentId").is_none());
    }
}
