//! # Chatline Transport
//!
//! A single duplex push connection per local user. The channel performs the
//! handshake with the user id in the query string, announces `join-chat` on
//! every (re)connect, forwards every server frame to subscribers by event
//! name, and retries lost connections with a fixed-delay bounded policy.

use std::sync::Arc;

use serde_json::Value;

pub mod channel;
pub mod error;
pub mod frame;
mod listeners;

pub use channel::{handshake_url, ReconnectPolicy, WsChannel, WsConnector};
pub use error::{TransportError, TransportResult};
pub use frame::{names, Frame};
pub use listeners::{Listener, SubscriptionId};

/// Capability handed to the synchronization layer.
pub trait PushChannel: Send + Sync {
    /// Start connecting. Listeners registered before this call observe the
    /// first `connect` event.
    fn connect(&self);

    /// Send a named event. Returns `false` when the channel is not connected.
    fn emit(&self, event: &str, payload: Value) -> bool;

    fn subscribe(&self, event: &str, listener: Listener) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    fn is_connected(&self) -> bool;

    /// Announce `leave-chat` and terminate the connection.
    fn close(&self);
}

/// Opens push channels for a local user.
pub trait Connector: Send + Sync {
    fn open(&self, local_user: &str) -> TransportResult<Arc<dyn PushChannel>>;
}
