//! Message envelope carried in frame payloads.
//!
//! Two shapes cross the wire: a state snapshot traveling from the
//! producing process to the observer, and a replacement state pushed
//! back. State and attachment contents are opaque bytes to this layer;
//! in JSON they travel as base64 strings.

use serde::{Deserialize, Serialize};

/// One wire message, serialized as a tagged JSON object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    /// Producer → observer: a state snapshot with the action that caused
    /// it and an optional rendered attachment.
    StateUpdate {
        /// Opaque serialized application state.
        #[serde(with = "base64_bytes")]
        state: Vec<u8>,
        /// Short label for the change that produced this snapshot.
        action: String,
        /// Opaque rendered-image bytes, if the producer captured one.
        #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
        attachment: Option<Vec<u8>>,
    },
    /// Observer → producer: replace the producer's current state.
    StateReplace {
        /// Opaque serialized application state.
        #[serde(with = "base64_bytes")]
        state: Vec<u8>,
    },
}

impl Message {
    /// Build a state update.
    pub fn update(state: Vec<u8>, action: impl Into<String>, attachment: Option<Vec<u8>>) -> Self {
        Message::StateUpdate {
            state,
            action: action.into(),
            attachment,
        }
    }

    /// Build a state replacement.
    pub fn replace(state: Vec<u8>) -> Self {
        Message::StateReplace { state }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

mod base64_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    #[test]
    fn test_update_serializes_binary_fields_as_base64() {
        let msg = Message::update(b"snapshot".to_vec(), "tap", Some(vec![0xFF, 0x00, 0x7F]));

        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["kind"], "state_update");
        assert_eq!(value["action"], "tap");
        assert_eq!(value["state"], STANDARD.encode(b"snapshot"));
        assert_eq!(value["attachment"], STANDARD.encode([0xFF, 0x00, 0x7F]));
    }

    #[test]
    fn test_attachment_omitted_when_absent() {
        let msg = Message::update(b"snapshot".to_vec(), "launch", None);

        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();

        assert!(value.get("attachment").is_none());
    }

    #[test]
    fn test_roundtrip_both_kinds() {
        let update = Message::update(vec![1, 2, 3], "scroll", Some(vec![9, 8]));
        let bytes = serde_json::to_vec(&update).unwrap();
        let decoded: Message = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, update);

        let replace = Message::replace(vec![4, 5, 6]);
        let bytes = serde_json::to_vec(&replace).unwrap();
        let decoded: Message = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, replace);
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        let raw = br#"{"kind":"state_replace","state":"!!not-base64!!"}"#;
        let result: Result<Message, _> = serde_json::from_slice(raw);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let raw = br#"{"kind":"state_delete","state":""}"#;
        let result: Result<Message, _> = serde_json::from_slice(raw);
        assert!(result.is_err());
    }
}
