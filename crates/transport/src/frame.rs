//! Wire format of the push channel.
//!
//! Every websocket text frame carries one named event:
//! `{"event": "<name>", "data": <payload>}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events generated by the channel itself rather than the server.
pub mod names {
    pub const CONNECT: &str = "connect";
    pub const CONNECT_ERROR: &str = "connect_error";
    pub const DISCONNECT: &str = "disconnect";
    pub const RECONNECT_FAILED: &str = "reconnect_failed";
    pub const JOIN_CHAT: &str = "join-chat";
    pub const LEAVE_CHAT: &str = "leave-chat";
}

/// A named push event and its JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_defaults_missing_payload_to_null() {
        let frame = Frame::decode(r#"{"event":"chat-users-updated"}"#).unwrap();
        assert_eq!(frame.event, "chat-users-updated");
        assert_eq!(frame.data, Value::Null);
    }

    #[test]
    fn encode_uses_event_and_data_keys() {
        let frame = Frame::new(names::JOIN_CHAT, json!("u1"));
        let encoded: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(encoded, json!({"event": "join-chat", "data": "u1"}));
    }

    #[test]
    fn decode_rejects_frames_without_event_name() {
        assert!(Frame::decode(r#"{"data":{}}"#).is_err());
        assert!(Frame::decode("not json").is_err());
    }
}
