//! Entity codec: canonical node encoding and lenient decoding
//!
//! Two node forms exist in the workspace document:
//!
//! - whole-object registers (users, channel meta) stored as one canonical
//!   JSON string per slot,
//! - field maps (messages) stored as one document map entry per field.
//!
//! Decoding is lenient by contract: a node missing required fields, or with
//! mistyped values, decodes to `None` so readers can skip malformed
//! peer-constructed nodes instead of failing. Unknown keys are captured by
//! each record's flattened `extra` map and survive re-encoding, so fields
//! written by newer peers round-trip through this implementation intact.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{StoreError, StoreResult};

/// Field name → value map, the canonical shape of a field-level node
pub type FieldMap = Map<String, Value>;

/// Encode an entity into its whole-object register form.
pub fn encode_register<T: Serialize>(entity: &T) -> StoreResult<String> {
    serde_json::to_string(entity).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Decode a whole-object register, treating malformed input as absent.
pub fn decode_register<T: DeserializeOwned>(raw: &str) -> Option<T> {
    serde_json::from_str(raw).ok()
}

/// Encode an entity into its field-map form.
pub fn encode_fields<T: Serialize>(entity: &T) -> StoreResult<FieldMap> {
    match serde_json::to_value(entity).map_err(|e| StoreError::Serialization(e.to_string()))? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Serialization(format!(
            "entity did not encode to an object: {}",
            other
        ))),
    }
}

/// Decode a field map, treating malformed input as absent.
pub fn decode_fields<T: DeserializeOwned>(fields: FieldMap) -> Option<T> {
    serde_json::from_value(Value::Object(fields)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Channel, ChannelId, Message, User, UserId};
    use serde_json::json;

    #[test]
    fn test_register_roundtrip() {
        let user = User::new("ada", None);
        let raw = encode_register(&user).unwrap();
        let decoded: User = decode_register(&raw).unwrap();
        assert_eq!(decoded, user);
    }

    #[test]
    fn test_decode_rejects_missing_required_fields() {
        // no `username`
        let raw = r#"{"id":"user-1","createdAt":1}"#;
        assert!(decode_register::<User>(raw).is_none());
    }

    #[test]
    fn test_decode_rejects_mistyped_fields() {
        let raw = r#"{"id":"user-1","username":42,"createdAt":1}"#;
        assert!(decode_register::<User>(raw).is_none());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_register::<Channel>("not json at all").is_none());
    }

    #[test]
    fn test_unknown_fields_survive_roundtrip() {
        let raw = r#"{"id":"channel-1","name":"general","createdAt":1,"createdBy":"user-1","type":"public","memberLimit":50}"#;
        let channel: Channel = decode_register(raw).unwrap();
        assert_eq!(channel.extra.get("type"), Some(&json!("public")));
        assert_eq!(channel.extra.get("memberLimit"), Some(&json!(50)));

        let reencoded = encode_register(&channel).unwrap();
        let value: Value = serde_json::from_str(&reencoded).unwrap();
        assert_eq!(value.get("type"), Some(&json!("public")));
        assert_eq!(value.get("memberLimit"), Some(&json!(50)));
    }

    #[test]
    fn test_field_map_roundtrip() {
        let mut msg = Message::new(
            ChannelId::from("channel-general"),
            UserId::from("user-1"),
            "hello",
            None,
        );
        msg.extra
            .insert("reactions".to_string(), json!({"+1": ["user-2"]}));

        let fields = encode_fields(&msg).unwrap();
        assert_eq!(fields.get("text"), Some(&json!("hello")));
        assert!(fields.contains_key("reactions"));

        let decoded: Message = decode_fields(fields).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_deleted_false_not_encoded() {
        let msg = Message::new(
            ChannelId::from("channel-general"),
            UserId::from("user-1"),
            "hello",
            None,
        );
        let fields = encode_fields(&msg).unwrap();
        assert!(!fields.contains_key("deleted"));

        let mut deleted = msg;
        deleted.deleted = true;
        let fields = encode_fields(&deleted).unwrap();
        assert_eq!(fields.get("deleted"), Some(&json!(true)));
    }

    #[test]
    fn test_decode_fields_rejects_missing_text() {
        let mut fields = FieldMap::new();
        fields.insert("id".to_string(), json!("msg-1"));
        fields.insert("channelId".to_string(), json!("channel-general"));
        fields.insert("userId".to_string(), json!("user-1"));
        fields.insert("createdAt".to_string(), json!(1));
        assert!(decode_fields::<Message>(fields).is_none());
    }
}
