//! # Chatline Sync
//!
//! The chat synchronization engine. It reconciles history fetched over REST
//! with live pushes from the channel, keeps the roster and per-peer
//! conversations, and tracks remote typing indicators.
//!
//! The engine is driven by a single loop:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use chatline_sync::{ChatApi, SyncOrchestrator, SyncSettings};
//! # use chatline_transport::Connector;
//! # async fn run(api: Arc<dyn ChatApi>, connector: Arc<dyn Connector>) -> chatline_sync::SyncResult<()> {
//! let mut engine = SyncOrchestrator::new(api, connector, SyncSettings::default());
//! engine.start_session("u1")?;
//! while let Some(input) = engine.next_input().await {
//!     if let Some(update) = engine.apply(input) {
//!         println!("{update:?}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod conversation;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod roster;
pub mod typing;
pub mod types;

pub use api::{AddPeerResponse, ChatApi, HistoryRecord, HttpChatApi, RemovePeerResponse, SendMessageRequest};
pub use conversation::ConversationStore;
pub use error::{ApiError, ApiResult, SyncError, SyncResult};
pub use events::PushEvent;
pub use orchestrator::{Notification, SyncInput, SyncOrchestrator, SyncSettings, SyncState, SyncUpdate};
pub use roster::{AddPeerOutcome, Roster, RosterChange};
pub use typing::{TypingExpiry, TypingTracker};
pub use types::{DedupKey, Direction, Message, Peer, PeerId, SessionContext};
