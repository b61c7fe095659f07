//! Typed view of the push events the engine consumes and emits.

use chatline_transport::{names as channel, Frame};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Direction, Message, PeerId};

pub const NEW_MESSAGE: &str = "new-message";
pub const TYPING: &str = "typing";
pub const CHAT_USERS_UPDATED: &str = "chat-users-updated";
pub const USER_STATUS_CHANGE: &str = "user-status-change";

/// Every event name the orchestrator subscribes to.
pub const SUBSCRIBED_EVENTS: &[&str] = &[
    channel::CONNECT,
    channel::CONNECT_ERROR,
    channel::DISCONNECT,
    channel::RECONNECT_FAILED,
    NEW_MESSAGE,
    TYPING,
    CHAT_USERS_UPDATED,
    USER_STATUS_CHANGE,
];

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub sender_id: PeerId,
    pub receiver_id: PeerId,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}

impl NewMessage {
    /// Whether this message belongs to the conversation with `peer`.
    pub fn involves(&self, peer: &PeerId) -> bool {
        &self.sender_id == peer || &self.receiver_id == peer
    }

    pub fn into_message(self, local_user: &PeerId) -> Message {
        Message {
            direction: Direction::from_sender(&self.sender_id, local_user),
            sender: self.sender_id,
            receiver: self.receiver_id,
            text: self.text,
            sent_at: self.timestamp,
            read: self.read,
        }
    }
}

/// Payload of the `typing` event, both inbound and outbound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    pub user_id: PeerId,
    pub receiver_id: PeerId,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterChanged {
    pub user_id: PeerId,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceChanged {
    pub user_id: PeerId,
    pub is_online: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Connected,
    ConnectError { message: String },
    Disconnected { reason: String },
    ReconnectFailed,
    NewMessage(NewMessage),
    Typing(TypingSignal),
    RosterChanged(RosterChanged),
    PresenceChanged(PresenceChanged),
}

impl PushEvent {
    /// Parse a channel frame. Unknown event names yield `Ok(None)`.
    pub fn from_frame(frame: &Frame) -> Result<Option<Self>, serde_json::Error> {
        let data = frame.data.clone();
        let event = match frame.event.as_str() {
            channel::CONNECT => PushEvent::Connected,
            channel::CONNECT_ERROR => PushEvent::ConnectError {
                message: text_field(&frame.data, "message"),
            },
            channel::DISCONNECT => PushEvent::Disconnected {
                reason: text_field(&frame.data, "reason"),
            },
            channel::RECONNECT_FAILED => PushEvent::ReconnectFailed,
            NEW_MESSAGE => PushEvent::NewMessage(serde_json::from_value(data)?),
            TYPING => PushEvent::Typing(serde_json::from_value(data)?),
            CHAT_USERS_UPDATED => PushEvent::RosterChanged(serde_json::from_value(data)?),
            USER_STATUS_CHANGE => PushEvent::PresenceChanged(serde_json::from_value(data)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    /// Get event type name for logging
    pub fn event_type_name(&self) -> &'static str {
        match self {
            PushEvent::Connected => channel::CONNECT,
            PushEvent::ConnectError { .. } => channel::CONNECT_ERROR,
            PushEvent::Disconnected { .. } => channel::DISCONNECT,
            PushEvent::ReconnectFailed => channel::RECONNECT_FAILED,
            PushEvent::NewMessage(_) => NEW_MESSAGE,
            PushEvent::Typing(_) => TYPING,
            PushEvent::RosterChanged(_) => CHAT_USERS_UPDATED,
            PushEvent::PresenceChanged(_) => USER_STATUS_CHANGE,
        }
    }
}

fn text_field(data: &Value, key: &str) -> String {
    match data {
        Value::String(text) => text.clone(),
        Value::Object(map) => map
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_new_message_payload() {
        let frame = Frame::new(
            NEW_MESSAGE,
            json!({
                "senderId": "u2",
                "receiverId": "u1",
                "text": "yo",
                "timestamp": "2024-05-01T10:00:00.000Z"
            }),
        );

        let Some(PushEvent::NewMessage(message)) = PushEvent::from_frame(&frame).unwrap() else {
            panic!("expected a new message");
        };
        assert!(message.involves(&"u2".into()));
        assert!(!message.involves(&"u3".into()));

        let message = message.into_message(&"u1".into());
        assert_eq!(message.direction, Direction::Remote);
        assert_eq!(message.text, "yo");
        assert!(!message.read);
    }

    #[test]
    fn parses_presence_and_roster_signals() {
        let presence = Frame::new(USER_STATUS_CHANGE, json!({"userId": "u2", "isOnline": false}));
        assert_eq!(
            PushEvent::from_frame(&presence).unwrap(),
            Some(PushEvent::PresenceChanged(PresenceChanged {
                user_id: "u2".into(),
                is_online: false,
            }))
        );

        let roster = Frame::new(CHAT_USERS_UPDATED, json!({"userId": "u1"}));
        assert_eq!(
            PushEvent::from_frame(&roster).unwrap(),
            Some(PushEvent::RosterChanged(RosterChanged { user_id: "u1".into() }))
        );
    }

    #[test]
    fn connect_error_message_is_extracted() {
        let frame = Frame::new(channel::CONNECT_ERROR, json!({"message": "refused"}));
        assert_eq!(
            PushEvent::from_frame(&frame).unwrap(),
            Some(PushEvent::ConnectError {
                message: "refused".to_string()
            })
        );
    }

    #[test]
    fn unknown_events_are_ignored_and_malformed_payloads_fail() {
        let unknown = Frame::new("server-announcement", json!({}));
        assert_eq!(PushEvent::from_frame(&unknown).unwrap(), None);

        let malformed = Frame::new(TYPING, json!({"receiverId": "u1"}));
        assert!(PushEvent::from_frame(&malformed).is_err());
    }

    #[test]
    fn typing_signal_serializes_camel_case() {
        let signal = TypingSignal {
            user_id: "u1".into(),
            receiver_id: "u2".into(),
        };
        assert_eq!(
            serde_json::to_value(&signal).unwrap(),
            json!({"userId": "u1", "receiverId": "u2"})
        );
    }
}
