//! Websocket implementation of the push channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chatline_config::{PushConfig, MAX_RECONNECT_ATTEMPTS};
use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{TransportError, TransportResult};
use crate::frame::{names, Frame};
use crate::listeners::{Listener, Listeners, SubscriptionId};
use crate::{Connector, PushChannel};

/// Fixed-delay retry policy for the push connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive attempts after a failure before giving up.
    pub max_attempts: u32,
    /// Delay between attempts; never grows.
    pub delay: Duration,
    /// Budget for a single handshake before it counts as a failed attempt.
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RECONNECT_ATTEMPTS,
            delay: Duration::from_millis(1000),
            connect_timeout: Duration::from_secs(20),
        }
    }
}

impl From<&PushConfig> for ReconnectPolicy {
    fn from(config: &PushConfig) -> Self {
        Self {
            max_attempts: config.reconnect_attempts.min(MAX_RECONNECT_ATTEMPTS),
            delay: config.reconnect_delay(),
            connect_timeout: config.connect_timeout(),
        }
    }
}

/// Build the handshake URL carrying the local user id as `userId`.
///
/// `http`/`https` endpoints are mapped onto `ws`/`wss`; there is no
/// polling fallback.
pub fn handshake_url(endpoint: &str, local_user: &str) -> TransportResult<Url> {
    let mut url = Url::parse(endpoint)?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(TransportError::UnsupportedScheme {
                scheme: other.to_string(),
            })
        }
    };
    if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
        return Err(TransportError::UnsupportedScheme {
            scheme: url.scheme().to_string(),
        });
    }
    url.query_pairs_mut().append_pair("userId", local_user);
    Ok(url)
}

/// Opens websocket channels against the configured push endpoint.
#[derive(Debug, Clone)]
pub struct WsConnector {
    config: PushConfig,
}

impl WsConnector {
    pub fn new(config: PushConfig) -> Self {
        Self { config }
    }
}

impl Connector for WsConnector {
    fn open(&self, local_user: &str) -> TransportResult<Arc<dyn PushChannel>> {
        let url = handshake_url(&self.config.url, local_user)?;
        let policy = ReconnectPolicy::from(&self.config);
        Ok(Arc::new(WsChannel::new(url, local_user, policy)))
    }
}

enum Command {
    Emit(Frame),
    Close,
}

#[derive(Default)]
struct Shared {
    connected: AtomicBool,
    listeners: Listeners,
}

impl Shared {
    fn notify(&self, event: &str, data: Value) {
        self.listeners.dispatch(&Frame::new(event, data));
    }
}

/// A single duplex push connection for one local user.
pub struct WsChannel {
    url: Url,
    local_user: String,
    policy: ReconnectPolicy,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
}

impl WsChannel {
    pub fn new(url: Url, local_user: impl Into<String>, policy: ReconnectPolicy) -> Self {
        let (commands, pending) = mpsc::unbounded_channel();
        Self {
            url,
            local_user: local_user.into(),
            policy,
            shared: Arc::new(Shared::default()),
            commands,
            pending: Mutex::new(Some(pending)),
        }
    }
}

impl PushChannel for WsChannel {
    fn connect(&self) {
        let Some(commands) = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            debug!(user = %self.local_user, "push channel already started");
            return;
        };

        tokio::spawn(run_connection(
            self.url.clone(),
            self.local_user.clone(),
            self.policy,
            Arc::clone(&self.shared),
            commands,
        ));
    }

    fn emit(&self, event: &str, payload: Value) -> bool {
        if !self.shared.connected.load(Ordering::SeqCst) {
            debug!(event, "push channel not connected, dropping emit");
            return false;
        }
        self.commands
            .send(Command::Emit(Frame::new(event, payload)))
            .is_ok()
    }

    fn subscribe(&self, event: &str, listener: Listener) -> SubscriptionId {
        self.shared.listeners.subscribe(event, listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.listeners.unsubscribe(id)
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn close(&self) {
        // Drop the receiver of a never-started channel so later connects are no-ops.
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let _ = self.commands.send(Command::Close);
    }
}

enum SessionEnd {
    Closed,
    Lost(String),
}

async fn run_connection(
    url: Url,
    local_user: String,
    policy: ReconnectPolicy,
    shared: Arc<Shared>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut attempt: u32 = 0;

    loop {
        match open_socket(&url, policy.connect_timeout).await {
            Ok(stream) => {
                attempt = 0;
                let outcome = drive(stream, &local_user, &shared, &mut commands).await;
                shared.connected.store(false, Ordering::SeqCst);

                match outcome {
                    SessionEnd::Closed => {
                        info!(user = %local_user, "push channel closed");
                        shared.notify(names::DISCONNECT, json!({ "reason": "client disconnect" }));
                        return;
                    }
                    SessionEnd::Lost(reason) => {
                        warn!(user = %local_user, %reason, "push channel lost");
                        shared.notify(names::DISCONNECT, json!({ "reason": reason }));
                    }
                }
            }
            Err(error) => {
                warn!(user = %local_user, attempt, %error, "push channel connection failed");
                shared.notify(
                    names::CONNECT_ERROR,
                    json!({ "message": error.to_string() }),
                );
            }
        }

        if attempt >= policy.max_attempts {
            warn!(user = %local_user, attempts = attempt, "giving up on push channel");
            shared.notify(names::RECONNECT_FAILED, Value::Null);
            return;
        }
        attempt += 1;

        let wait = tokio::time::sleep(policy.delay);
        tokio::pin!(wait);
        loop {
            tokio::select! {
                _ = &mut wait => break,
                command = commands.recv() => match command {
                    Some(Command::Emit(frame)) => {
                        debug!(event = %frame.event, "push channel reconnecting, dropping emit");
                    }
                    Some(Command::Close) | None => {
                        debug!(user = %local_user, "push channel closed while reconnecting");
                        return;
                    }
                },
            }
        }
        debug!(user = %local_user, attempt, "reconnecting push channel");
    }
}

async fn open_socket(
    url: &Url,
    timeout: Duration,
) -> TransportResult<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str())).await {
        Ok(connected) => Ok(connected?.0),
        Err(_) => Err(TransportError::HandshakeTimeout(timeout)),
    }
}

async fn drive<S>(
    stream: WebSocketStream<S>,
    local_user: &str,
    shared: &Shared,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut source) = stream.split();

    let join = Frame::new(names::JOIN_CHAT, json!(local_user));
    if let Err(error) = send_frame(&mut sink, &join).await {
        return SessionEnd::Lost(error.to_string());
    }

    shared.connected.store(true, Ordering::SeqCst);
    info!(user = %local_user, "push channel connected");
    shared.notify(names::CONNECT, Value::Null);

    loop {
        tokio::select! {
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => match Frame::decode(&text) {
                    Ok(frame) => shared.listeners.dispatch(&frame),
                    Err(error) => debug!(%error, "ignoring malformed push frame"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    return SessionEnd::Lost("server closed the connection".to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => return SessionEnd::Lost(error.to_string()),
            },
            command = commands.recv() => match command {
                Some(Command::Emit(frame)) => {
                    if let Err(error) = send_frame(&mut sink, &frame).await {
                        return SessionEnd::Lost(error.to_string());
                    }
                }
                Some(Command::Close) | None => {
                    let leave = Frame::new(names::LEAVE_CHAT, json!(local_user));
                    if let Err(error) = send_frame(&mut sink, &leave).await {
                        debug!(%error, "failed to announce leave");
                    }
                    if let Err(error) = sink.close().await {
                        debug!(%error, "failed to close websocket cleanly");
                    }
                    return SessionEnd::Closed;
                }
            },
        }
    }
}

async fn send_frame<K>(sink: &mut K, frame: &Frame) -> TransportResult<()>
where
    K: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = frame.encode()?;
    sink.send(Message::Text(text)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_url_carries_user_id_query() {
        let url = handshake_url("ws://localhost:5000/ws", "u 1").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:5000/ws?userId=u+1");
    }

    #[test]
    fn handshake_url_maps_http_onto_websocket() {
        let url = handshake_url("https://chat.example/socket", "u1").unwrap();
        assert_eq!(url.scheme(), "wss");

        let url = handshake_url("http://chat.example/socket", "u1").unwrap();
        assert_eq!(url.scheme(), "ws");
    }

    #[test]
    fn handshake_url_rejects_other_schemes() {
        let error = handshake_url("ftp://chat.example/", "u1").unwrap_err();
        assert!(matches!(error, TransportError::UnsupportedScheme { .. }));
        assert!(handshake_url("not a url", "u1").is_err());
    }

    #[test]
    fn policy_from_config_caps_attempts() {
        let config = PushConfig {
            url: "ws://localhost".to_string(),
            reconnect_attempts: 9,
            reconnect_delay_ms: 250,
            connect_timeout_ms: 1500,
        };
        let policy = ReconnectPolicy::from(&config);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay, Duration::from_millis(250));
        assert_eq!(policy.connect_timeout, Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn emit_before_connect_returns_false() {
        let url = handshake_url("ws://127.0.0.1:9/ws", "u1").unwrap();
        let channel = WsChannel::new(url, "u1", ReconnectPolicy::default());
        assert!(!channel.is_connected());
        assert!(!channel.emit("typing", json!({"userId": "u1"})));
        channel.close();
    }
}
