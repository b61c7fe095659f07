//! REST client for the chat backend.
//!
//! The [`ChatApi`] trait is the seam the orchestrator depends on; [`HttpChatApi`]
//! is the reqwest implementation used in production.

use async_trait::async_trait;
use chatline_config::ApiConfig;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, Response, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{ApiError, ApiResult};
use crate::types::{Direction, Message, Peer, PeerId};

#[async_trait]
pub trait ChatApi: Send + Sync {
    /// `GET users/chat-users?userId=`: authoritative roster snapshot.
    async fn fetch_roster(&self, local_user: &PeerId) -> ApiResult<Vec<Peer>>;

    /// `GET users/search?query=`: candidate peers.
    async fn search_users(&self, query: &str) -> ApiResult<Vec<Peer>>;

    /// `POST users/add-chat`.
    async fn add_peer(&self, local_user: &PeerId, target: &PeerId) -> ApiResult<AddPeerResponse>;

    /// `POST users/remove-chat`.
    async fn remove_peer(
        &self,
        local_user: &PeerId,
        target: &PeerId,
    ) -> ApiResult<RemovePeerResponse>;

    /// `GET messages?userId=<peer>&currentUserId=<local>`: history snapshot.
    async fn fetch_history(&self, peer: &PeerId, local_user: &PeerId)
        -> ApiResult<Vec<HistoryRecord>>;

    /// `POST messages`.
    async fn send_message(&self, request: &SendMessageRequest) -> ApiResult<()>;

    /// `POST messages/clear`.
    async fn clear_history(&self, local_user: &PeerId, target: &PeerId) -> ApiResult<()>;

    /// `GET users/:id`.
    async fn fetch_profile(&self, user: &PeerId) -> ApiResult<Peer>;
}

/// Sender or receiver of a history record: either a bare id or a populated profile.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum UserRef {
    Id(PeerId),
    Profile {
        #[serde(rename = "_id", alias = "id")]
        id: PeerId,
    },
}

impl UserRef {
    pub fn id(&self) -> &PeerId {
        match self {
            UserRef::Id(id) | UserRef::Profile { id } => id,
        }
    }
}

/// One message as stored by the backend.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HistoryRecord {
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
    pub sender: UserRef,
    pub receiver: UserRef,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}

impl HistoryRecord {
    pub fn into_message(self, local_user: &PeerId) -> Message {
        let sender = self.sender.id().clone();
        Message {
            direction: Direction::from_sender(&sender, local_user),
            sender,
            receiver: self.receiver.id().clone(),
            text: self.text,
            sent_at: self.timestamp,
            read: self.read,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub text: String,
    pub receiver_id: PeerId,
    pub sender_id: PeerId,
    pub timestamp: String,
}

impl SendMessageRequest {
    pub fn new(text: impl Into<String>, receiver: PeerId, sender: PeerId) -> Self {
        Self {
            text: text.into(),
            receiver_id: receiver,
            sender_id: sender,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct PeerPair<'a> {
    user_id: &'a PeerId,
    target_user_id: &'a PeerId,
}

/// The add-peer endpoint answers in one of several shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum AddPeerResponse {
    /// A bare array or `{chatUsers: [...]}`: the full updated roster.
    Roster(Vec<Peer>),
    /// `{user: {...}}` or `{addedUser: {...}}`: only the new peer.
    Added(Peer),
    /// Anything else; the caller must refetch the roster.
    Unrecognized,
}

impl AddPeerResponse {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Array(_) => serde_json::from_value(value)
                .map(AddPeerResponse::Roster)
                .unwrap_or(AddPeerResponse::Unrecognized),
            Value::Object(mut map) => {
                if let Some(roster @ Value::Array(_)) = map.remove("chatUsers") {
                    if let Ok(peers) = serde_json::from_value(roster) {
                        return AddPeerResponse::Roster(peers);
                    }
                }
                map.remove("addedUser")
                    .or_else(|| map.remove("user"))
                    .and_then(|peer| serde_json::from_value(peer).ok())
                    .map(AddPeerResponse::Added)
                    .unwrap_or(AddPeerResponse::Unrecognized)
            }
            _ => AddPeerResponse::Unrecognized,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RemovePeerResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(rename = "chatUsers", default)]
    pub chat_users: Option<Vec<Peer>>,
}

impl RemovePeerResponse {
    pub fn from_value(value: Value) -> Self {
        serde_json::from_value(value).unwrap_or_default()
    }

    /// The authoritative roster, when the server sent one.
    pub fn roster(self) -> Option<Vec<Peer>> {
        if self.success {
            self.chat_users
        } else {
            None
        }
    }
}

/// reqwest-backed [`ChatApi`].
#[derive(Debug, Clone)]
pub struct HttpChatApi {
    client: Client,
    base_url: Url,
}

impl HttpChatApi {
    pub fn new(config: &ApiConfig) -> ApiResult<Self> {
        let client = Client::builder().timeout(config.request_timeout()).build()?;
        Self::with_client(client, &config.base_url)
    }

    pub fn with_client(client: Client, base_url: &str) -> ApiResult<Self> {
        let base_url = Url::parse(base_url)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| ApiError::InvalidBaseUrl {
                url: base_url.to_string(),
            })?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn get<T: DeserializeOwned>(&self, segments: &[&str], query: &[(&str, &str)]) -> ApiResult<T> {
        let url = self.endpoint(segments);
        debug!(%url, "GET");
        let response = self.client.get(url).query(query).send().await?;
        let body = read_body(response).await?;
        Ok(serde_json::from_value(body)?)
    }

    async fn post<B: Serialize + ?Sized>(&self, segments: &[&str], body: &B) -> ApiResult<Value> {
        let url = self.endpoint(segments);
        debug!(%url, "POST");
        let response = self.client.post(url).json(body).send().await?;
        read_body(response).await
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_roster(&self, local_user: &PeerId) -> ApiResult<Vec<Peer>> {
        self.get(&["users", "chat-users"], &[("userId", local_user.as_str())])
            .await
    }

    async fn search_users(&self, query: &str) -> ApiResult<Vec<Peer>> {
        self.get(&["users", "search"], &[("query", query)]).await
    }

    async fn add_peer(&self, local_user: &PeerId, target: &PeerId) -> ApiResult<AddPeerResponse> {
        let body = PeerPair {
            user_id: local_user,
            target_user_id: target,
        };
        let value = self.post(&["users", "add-chat"], &body).await?;
        Ok(AddPeerResponse::from_value(value))
    }

    async fn remove_peer(
        &self,
        local_user: &PeerId,
        target: &PeerId,
    ) -> ApiResult<RemovePeerResponse> {
        let body = PeerPair {
            user_id: local_user,
            target_user_id: target,
        };
        let value = self.post(&["users", "remove-chat"], &body).await?;
        Ok(RemovePeerResponse::from_value(value))
    }

    async fn fetch_history(
        &self,
        peer: &PeerId,
        local_user: &PeerId,
    ) -> ApiResult<Vec<HistoryRecord>> {
        self.get(
            &["messages"],
            &[("userId", peer.as_str()), ("currentUserId", local_user.as_str())],
        )
        .await
    }

    async fn send_message(&self, request: &SendMessageRequest) -> ApiResult<()> {
        self.post(&["messages"], request).await?;
        Ok(())
    }

    async fn clear_history(&self, local_user: &PeerId, target: &PeerId) -> ApiResult<()> {
        let body = PeerPair {
            user_id: local_user,
            target_user_id: target,
        };
        self.post(&["messages", "clear"], &body).await?;
        Ok(())
    }

    async fn fetch_profile(&self, user: &PeerId) -> ApiResult<Peer> {
        self.get(&["users", user.as_str()], &[]).await
    }
}

/// Read a response body, turning non-success statuses into [`ApiError::Rejected`].
///
/// Bodies wrapped as `{"data": ...}` are unwrapped.
async fn read_body(response: Response) -> ApiResult<Value> {
    let status = response.status();
    let text = response.text().await?;

    if !status.is_success() {
        return Err(ApiError::rejected(status.as_u16(), rejection_message(status.as_u16(), &text)));
    }

    if text.trim().is_empty() {
        return Ok(Value::Null);
    }

    let value: Value = serde_json::from_str(&text)?;
    Ok(unwrap_envelope(value))
}

fn unwrap_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.contains_key("data") && !map.contains_key("_id") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn rejection_message(status: u16, body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            ["error", "message"]
                .iter()
                .find_map(|key| value.get(key).and_then(Value::as_str).map(str::to_string))
        })
        .or_else(|| {
            let trimmed = body.trim();
            (!trimmed.is_empty() && trimmed.len() <= 200).then(|| trimmed.to_string())
        })
        .unwrap_or_else(|| format!("HTTP error! status: {status}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn add_response_recognizes_each_shape() {
        let peer = json!({"_id": "u3", "name": "Grace", "email": "g@example.com"});

        assert!(matches!(
            AddPeerResponse::from_value(json!([peer.clone()])),
            AddPeerResponse::Roster(peers) if peers.len() == 1
        ));
        assert!(matches!(
            AddPeerResponse::from_value(json!({"chatUsers": [peer.clone()]})),
            AddPeerResponse::Roster(_)
        ));
        assert!(matches!(
            AddPeerResponse::from_value(json!({"addedUser": peer.clone()})),
            AddPeerResponse::Added(p) if p.id == "u3"
        ));
        assert!(matches!(
            AddPeerResponse::from_value(json!({"user": peer})),
            AddPeerResponse::Added(_)
        ));
        assert_eq!(
            AddPeerResponse::from_value(json!({"ok": true})),
            AddPeerResponse::Unrecognized
        );
        assert_eq!(AddPeerResponse::from_value(Value::Null), AddPeerResponse::Unrecognized);
        assert_eq!(
            AddPeerResponse::from_value(json!([{"unexpected": 1}])),
            AddPeerResponse::Unrecognized
        );
    }

    #[test]
    fn remove_response_only_trusts_successful_rosters() {
        let accepted = RemovePeerResponse::from_value(json!({"success": true, "chatUsers": []}));
        assert_eq!(accepted.roster(), Some(Vec::new()));

        let partial = RemovePeerResponse::from_value(json!({"chatUsers": []}));
        assert_eq!(partial.roster(), None);

        assert_eq!(RemovePeerResponse::from_value(json!("ok")).roster(), None);
    }

    #[test]
    fn history_record_accepts_ids_and_profiles() {
        let record: HistoryRecord = serde_json::from_value(json!({
            "_id": "m1",
            "sender": {"_id": "u2", "name": "Ada"},
            "receiver": "u1",
            "text": "hi",
            "timestamp": "2024-05-01T10:00:00Z",
            "read": true
        }))
        .unwrap();

        let message = record.into_message(&"u1".into());
        assert_eq!(message.sender, "u2");
        assert_eq!(message.receiver, "u1");
        assert_eq!(message.direction, Direction::Remote);
        assert!(message.read);
    }

    #[test]
    fn rejection_message_prefers_server_error_field() {
        assert_eq!(rejection_message(400, r#"{"error":"User not found"}"#), "User not found");
        assert_eq!(rejection_message(409, r#"{"message":"Already added"}"#), "Already added");
        assert_eq!(rejection_message(502, ""), "HTTP error! status: 502");
    }

    #[test]
    fn envelope_is_unwrapped_but_documents_are_not() {
        assert_eq!(unwrap_envelope(json!({"data": [1]})), json!([1]));
        let document = json!({"_id": "u1", "data": "x"});
        assert_eq!(unwrap_envelope(document.clone()), document);
    }

    #[test]
    fn endpoint_appends_encoded_segments() {
        let api = HttpChatApi::with_client(Client::new(), "http://localhost:5000/api/").unwrap();
        assert_eq!(
            api.endpoint(&["users", "a b"]).as_str(),
            "http://localhost:5000/api/users/a%20b"
        );
        assert!(HttpChatApi::with_client(Client::new(), "mailto:x").is_err());
    }
}
