//! The synchronization orchestrator.
//!
//! All session state lives in one [`Session`] owned by [`SyncOrchestrator`]
//! and is mutated only through `&mut self`. Push frames, REST responses, and
//! typing timers never touch that state directly: they enqueue a
//! [`SyncInput`] on the session's queue, and the driver feeds each input back
//! through [`SyncOrchestrator::apply`]. Dropping the session drops its queue,
//! so responses spawned for a previous user can never land.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chatline_config::TypingConfig;
use chatline_transport::{Connector, Frame, Listener, PushChannel, SubscriptionId};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::{ChatApi, HistoryRecord, SendMessageRequest};
use crate::conversation::ConversationStore;
use crate::error::{ApiResult, SyncError, SyncResult};
use crate::events::{self, PushEvent, TypingSignal, SUBSCRIBED_EVENTS};
use crate::roster::{AddPeerOutcome, Roster, RosterChange};
use crate::typing::{TypingExpiry, TypingTracker, DEFAULT_TYPING_TTL};
use crate::types::{Message, Peer, PeerId, SessionContext};

/// Timing knobs for the typing indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    /// How long a remote typing indicator stays active after its last signal.
    pub typing_ttl: Duration,
    /// Minimum gap between outbound typing signals to the same peer.
    pub typing_emit_interval: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            typing_ttl: DEFAULT_TYPING_TTL,
            typing_emit_interval: Duration::from_millis(1000),
        }
    }
}

impl From<&TypingConfig> for SyncSettings {
    fn from(config: &TypingConfig) -> Self {
        Self {
            typing_ttl: config.expiry(),
            typing_emit_interval: config.emit_interval(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Disconnected,
    Connecting,
    Connected { selected_peer: Option<PeerId> },
}

/// Work queued for the orchestrator's event loop.
#[derive(Debug)]
pub enum SyncInput {
    Push(Frame),
    RosterFetched {
        seq: u64,
        result: ApiResult<Vec<Peer>>,
    },
    HistoryLoaded {
        peer: PeerId,
        seq: u64,
        result: ApiResult<Vec<HistoryRecord>>,
    },
    ProfileLoaded(ApiResult<Peer>),
    TypingExpired(TypingExpiry),
}

/// Observable effect of applying one input.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncUpdate {
    StateChanged(SyncState),
    RosterUpdated,
    PresenceChanged { peer: PeerId, online: bool },
    HistoryLoaded { peer: PeerId },
    MessageAppended { peer: PeerId, message: Message },
    TypingStarted { peer: PeerId },
    TypingStopped { peer: PeerId },
    ProfileLoaded(Peer),
}

/// User-facing message produced by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Info(String),
    Error(String),
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::Info(message) => write!(f, "{message}"),
            Notification::Error(message) => write!(f, "error: {message}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Connected,
}

struct PendingHistory {
    peer: PeerId,
    seq: u64,
    /// Pushes for `peer` that arrived while the snapshot was in flight.
    buffered: Vec<Message>,
}

struct Session {
    context: SessionContext,
    phase: Phase,
    connected_once: bool,
    roster: Roster,
    store: ConversationStore,
    typing: TypingTracker,
    profile: Option<Peer>,
    settings: SyncSettings,
    api: Arc<dyn ChatApi>,
    notifier: mpsc::UnboundedSender<Notification>,
    channel: Arc<dyn PushChannel>,
    subscriptions: Vec<SubscriptionId>,
    inbound_tx: mpsc::UnboundedSender<SyncInput>,
    inbound: mpsc::UnboundedReceiver<SyncInput>,
    expiries: mpsc::UnboundedReceiver<TypingExpiry>,
    /// Tag of the newest roster fetch; older responses are dropped.
    roster_seq: u64,
    history_seq: u64,
    pending_history: Option<PendingHistory>,
    typing_emitted: HashMap<PeerId, Instant>,
}

impl Session {
    fn open(
        local_user: PeerId,
        channel: Arc<dyn PushChannel>,
        api: Arc<dyn ChatApi>,
        notifier: mpsc::UnboundedSender<Notification>,
        settings: SyncSettings,
    ) -> Self {
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (expiry_tx, expiries) = mpsc::unbounded_channel();

        let forward = inbound_tx.clone();
        let listener: Listener = Arc::new(move |frame: &Frame| {
            let _ = forward.send(SyncInput::Push(frame.clone()));
        });
        let subscriptions = SUBSCRIBED_EVENTS
            .iter()
            .map(|event| channel.subscribe(event, Arc::clone(&listener)))
            .collect();

        let mut session = Self {
            context: SessionContext::new(local_user),
            phase: Phase::Connecting,
            connected_once: false,
            roster: Roster::new(),
            store: ConversationStore::new(),
            typing: TypingTracker::new(settings.typing_ttl, expiry_tx),
            profile: None,
            settings,
            api,
            notifier,
            channel,
            subscriptions,
            inbound_tx,
            inbound,
            expiries,
            roster_seq: 0,
            history_seq: 0,
            pending_history: None,
            typing_emitted: HashMap::new(),
        };

        session.channel.connect();
        session.spawn_roster_fetch();
        session.spawn_profile_fetch();
        session
    }

    fn close(self) {
        for id in &self.subscriptions {
            self.channel.unsubscribe(*id);
        }
        self.channel.close();
        info!(user = %self.context.local_user, "session closed");
    }

    fn state(&self) -> SyncState {
        match self.phase {
            Phase::Connecting => SyncState::Connecting,
            Phase::Connected => SyncState::Connected {
                selected_peer: self.context.selected_peer.clone(),
            },
        }
    }

    fn notify_error(&self, message: String) {
        warn!(user = %self.context.local_user, %message, "sync error");
        let _ = self.notifier.send(Notification::Error(message));
    }

    fn spawn_roster_fetch(&mut self) {
        let seq = self.supersede_roster_fetches();
        let api = Arc::clone(&self.api);
        let inbound = self.inbound_tx.clone();
        let user = self.context.local_user.clone();
        debug!(seq, "fetching roster");
        tokio::spawn(async move {
            let result = api.fetch_roster(&user).await;
            let _ = inbound.send(SyncInput::RosterFetched { seq, result });
        });
    }

    /// Invalidate every roster fetch in flight. Called before the roster is
    /// refreshed or changed locally.
    fn supersede_roster_fetches(&mut self) -> u64 {
        self.roster_seq += 1;
        self.roster_seq
    }

    fn spawn_profile_fetch(&self) {
        let api = Arc::clone(&self.api);
        let inbound = self.inbound_tx.clone();
        let user = self.context.local_user.clone();
        tokio::spawn(async move {
            let result = api.fetch_profile(&user).await;
            let _ = inbound.send(SyncInput::ProfileLoaded(result));
        });
    }

    /// Request a history snapshot for `peer`, superseding any request in flight.
    fn load_history(&mut self, peer: PeerId) {
        self.history_seq += 1;
        let seq = self.history_seq;

        let buffered = match self.pending_history.take() {
            Some(pending) if pending.peer == peer => pending.buffered,
            _ => Vec::new(),
        };
        self.pending_history = Some(PendingHistory {
            peer: peer.clone(),
            seq,
            buffered,
        });

        let api = Arc::clone(&self.api);
        let inbound = self.inbound_tx.clone();
        let user = self.context.local_user.clone();
        debug!(peer = %peer, seq, "loading history");
        tokio::spawn(async move {
            let result = api.fetch_history(&peer, &user).await;
            let _ = inbound.send(SyncInput::HistoryLoaded { peer, seq, result });
        });
    }

    fn select(&mut self, peer: Option<PeerId>) {
        self.context.selected_peer = peer.clone();
        match peer {
            Some(peer) => self.load_history(peer),
            None => self.pending_history = None,
        }
    }

    fn apply(&mut self, input: SyncInput) -> Option<SyncUpdate> {
        match input {
            SyncInput::Push(frame) => self.on_push(frame),
            SyncInput::RosterFetched { seq, .. } if seq != self.roster_seq => {
                debug!(seq, latest = self.roster_seq, "discarding stale roster response");
                None
            }
            SyncInput::RosterFetched { result: Ok(peers), .. } => {
                self.roster.replace(peers);
                debug!(count = self.roster.len(), "roster replaced");
                Some(SyncUpdate::RosterUpdated)
            }
            SyncInput::RosterFetched { result: Err(error), .. } => {
                self.notify_error(format!("Failed to load chat users: {error}"));
                None
            }
            SyncInput::HistoryLoaded { peer, seq, result } => self.on_history(peer, seq, result),
            SyncInput::ProfileLoaded(Ok(profile)) => {
                self.profile = Some(profile.clone());
                Some(SyncUpdate::ProfileLoaded(profile))
            }
            SyncInput::ProfileLoaded(Err(error)) => {
                warn!(user = %self.context.local_user, %error, "failed to load local profile");
                None
            }
            SyncInput::TypingExpired(expiry) => self
                .typing
                .expire(&expiry)
                .then(|| SyncUpdate::TypingStopped { peer: expiry.peer }),
        }
    }

    fn on_push(&mut self, frame: Frame) -> Option<SyncUpdate> {
        let event = match PushEvent::from_frame(&frame) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!(event = %frame.event, "ignoring unknown push event");
                return None;
            }
            Err(error) => {
                warn!(event = %frame.event, %error, "dropping malformed push event");
                return None;
            }
        };
        debug!(event = event.event_type_name(), "push event");

        match event {
            PushEvent::Connected => {
                self.phase = Phase::Connected;
                if self.connected_once {
                    info!(user = %self.context.local_user, "push channel reconnected, resynchronizing");
                    self.spawn_roster_fetch();
                    if let Some(peer) = self.context.selected_peer.clone() {
                        self.load_history(peer);
                    }
                    let _ = self
                        .notifier
                        .send(Notification::Info("Connection restored".to_string()));
                } else {
                    info!(user = %self.context.local_user, "push channel connected");
                }
                self.connected_once = true;
                Some(SyncUpdate::StateChanged(self.state()))
            }
            PushEvent::ConnectError { message } => {
                self.notify_error(format!("Connection error: {message}"));
                None
            }
            PushEvent::Disconnected { reason } => {
                info!(user = %self.context.local_user, %reason, "push channel disconnected");
                if self.phase == Phase::Connecting {
                    return None;
                }
                self.phase = Phase::Connecting;
                Some(SyncUpdate::StateChanged(self.state()))
            }
            PushEvent::ReconnectFailed => {
                self.notify_error("Unable to reach the chat server".to_string());
                None
            }
            PushEvent::NewMessage(incoming) => {
                let peer = self.context.selected_peer.clone()?;
                if !incoming.involves(&peer) {
                    return None;
                }
                let message = incoming.into_message(&self.context.local_user);
                if let Some(pending) = self.pending_history.as_mut().filter(|p| p.peer == peer) {
                    pending.buffered.push(message.clone());
                }
                self.store
                    .append(&peer, message.clone())
                    .then(|| SyncUpdate::MessageAppended { peer, message })
            }
            PushEvent::Typing(signal) => {
                if signal.user_id == self.context.local_user {
                    return None;
                }
                self.typing
                    .signal(&signal.user_id)
                    .then(|| SyncUpdate::TypingStarted {
                        peer: signal.user_id,
                    })
            }
            PushEvent::RosterChanged(changed) => {
                if changed.user_id == self.context.local_user {
                    self.spawn_roster_fetch();
                }
                None
            }
            PushEvent::PresenceChanged(presence) => self
                .roster
                .set_presence(&presence.user_id, presence.is_online)
                .then(|| SyncUpdate::PresenceChanged {
                    peer: presence.user_id,
                    online: presence.is_online,
                }),
        }
    }

    fn on_history(
        &mut self,
        peer: PeerId,
        seq: u64,
        result: ApiResult<Vec<HistoryRecord>>,
    ) -> Option<SyncUpdate> {
        let is_latest = self
            .pending_history
            .as_ref()
            .is_some_and(|pending| pending.peer == peer && pending.seq == seq);
        if !is_latest || !self.context.is_selected(&peer) {
            debug!(peer = %peer, seq, "discarding stale history response");
            return None;
        }
        let pending = self.pending_history.take()?;

        match result {
            Ok(records) => {
                let local_user = &self.context.local_user;
                let messages = records
                    .into_iter()
                    .map(|record| record.into_message(local_user))
                    .collect();
                self.store.replace(&peer, messages);
                for message in pending.buffered {
                    self.store.append(&peer, message);
                }
                debug!(peer = %peer, count = self.store.messages(&peer).len(), "history loaded");
                Some(SyncUpdate::HistoryLoaded { peer })
            }
            Err(error) => {
                self.notify_error(format!("Failed to load messages: {error}"));
                None
            }
        }
    }

    fn emit_typing(&mut self) -> bool {
        let Some(peer) = self.context.selected_peer.clone() else {
            return false;
        };
        if !self.channel.is_connected() {
            return false;
        }

        let now = Instant::now();
        if let Some(last) = self.typing_emitted.get(&peer) {
            if now.duration_since(*last) < self.settings.typing_emit_interval {
                return false;
            }
        }

        let signal = TypingSignal {
            user_id: self.context.local_user.clone(),
            receiver_id: peer.clone(),
        };
        let payload = match serde_json::to_value(&signal) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(%error, "failed to encode typing signal");
                return false;
            }
        };

        let sent = self.channel.emit(events::TYPING, payload);
        if sent {
            self.typing_emitted.insert(peer, now);
        }
        sent
    }

    fn forget_peer(&mut self, peer: &PeerId) {
        if self.context.is_selected(peer) {
            self.context.selected_peer = None;
            self.pending_history = None;
        }
        self.store.remove(peer);
        self.typing.forget(peer);
        self.typing_emitted.remove(peer);
    }
}

/// Drives one chat session at a time.
pub struct SyncOrchestrator {
    api: Arc<dyn ChatApi>,
    connector: Arc<dyn Connector>,
    settings: SyncSettings,
    session: Option<Session>,
    notifier: mpsc::UnboundedSender<Notification>,
    notifications: Option<mpsc::UnboundedReceiver<Notification>>,
}

impl SyncOrchestrator {
    pub fn new(api: Arc<dyn ChatApi>, connector: Arc<dyn Connector>, settings: SyncSettings) -> Self {
        let (notifier, notifications) = mpsc::unbounded_channel();
        Self {
            api,
            connector,
            settings,
            session: None,
            notifier,
            notifications: Some(notifications),
        }
    }

    /// Hand out the notification stream. Only the first call returns it.
    pub fn take_notifications(&mut self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        self.notifications.take()
    }

    /// Start a session for `local_user`, closing any previous one.
    ///
    /// Opens the push channel and requests the roster and the local profile.
    /// Must be called from within a tokio runtime.
    pub fn start_session(&mut self, local_user: impl Into<PeerId>) -> SyncResult<()> {
        let local_user = local_user.into();
        self.end_session();

        let channel = self.report(
            self.connector
                .open(local_user.as_str())
                .map_err(SyncError::from),
        )?;
        info!(user = %local_user, "starting session");
        self.session = Some(Session::open(
            local_user,
            channel,
            Arc::clone(&self.api),
            self.notifier.clone(),
            self.settings,
        ));
        Ok(())
    }

    /// Close the channel and drop all session state. Returns `false` when no
    /// session was active.
    pub fn end_session(&mut self) -> bool {
        match self.session.take() {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    pub fn state(&self) -> SyncState {
        self.session
            .as_ref()
            .map(Session::state)
            .unwrap_or(SyncState::Disconnected)
    }

    pub fn context(&self) -> Option<&SessionContext> {
        self.session.as_ref().map(|session| &session.context)
    }

    pub fn roster(&self) -> &[Peer] {
        self.session
            .as_ref()
            .map(|session| session.roster.peers())
            .unwrap_or_default()
    }

    pub fn messages(&self, peer: &PeerId) -> &[Message] {
        self.session
            .as_ref()
            .map(|session| session.store.messages(peer))
            .unwrap_or_default()
    }

    /// Case-insensitive substring search over one conversation.
    pub fn search(&self, peer: &PeerId, needle: &str) -> Vec<Message> {
        self.session
            .as_ref()
            .map(|session| session.store.search(peer, needle))
            .unwrap_or_default()
    }

    pub fn is_typing(&self, peer: &PeerId) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.typing.is_typing(peer))
    }

    pub fn typing_peers(&self) -> Vec<PeerId> {
        self.session
            .as_ref()
            .map(|session| session.typing.active_peers().cloned().collect())
            .unwrap_or_default()
    }

    pub fn local_profile(&self) -> Option<&Peer> {
        self.session.as_ref().and_then(|session| session.profile.as_ref())
    }

    /// Change the selected peer. Selecting a peer requests its history;
    /// the channel is left untouched.
    pub fn select_peer(&mut self, peer: Option<PeerId>) -> SyncResult<()> {
        let result = self.session_mut().map(|session| session.select(peer));
        self.report(result)
    }

    /// Record a local keystroke and emit a throttled typing signal to the
    /// selected peer. Returns whether a signal went out.
    pub fn compose_input(&mut self) -> bool {
        self.session
            .as_mut()
            .is_some_and(|session| session.emit_typing())
    }

    /// Send `text` to the selected peer. The message shows up in the
    /// conversation only once the server echoes it back over the channel.
    pub async fn send_message(&mut self, text: &str) -> SyncResult<()> {
        let result = self.try_send_message(text).await;
        self.report(result)
    }

    async fn try_send_message(&mut self, text: &str) -> SyncResult<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        let request = {
            let context = &self.session_ref()?.context;
            let peer = context
                .selected_peer
                .clone()
                .ok_or(SyncError::NoPeerSelected)?;
            SendMessageRequest::new(text, peer, context.local_user.clone())
        };
        self.api.send_message(&request).await?;
        debug!(peer = %request.receiver_id, "message sent");
        Ok(())
    }

    pub async fn add_peer(&mut self, target: impl Into<PeerId>) -> SyncResult<AddPeerOutcome> {
        let result = self.try_add_peer(target.into()).await;
        self.report(result)
    }

    async fn try_add_peer(&mut self, target: PeerId) -> SyncResult<AddPeerOutcome> {
        let local_user = self.local_user()?;
        let response = self.api.add_peer(&local_user, &target).await?;

        let session = self.session_mut()?;
        session.supersede_roster_fetches();
        let was_member = session.roster.contains(&target);
        let outcome = match session.roster.apply_add(response) {
            RosterChange::NeedsRefetch => {
                warn!(peer = %target, "unrecognized add-peer response, refetching roster");
                let peers = self.api.fetch_roster(&local_user).await?;
                let session = self.session_mut()?;
                session.supersede_roster_fetches();
                session.roster.replace(peers);
                AddPeerOutcome::Refetched
            }
            RosterChange::Unchanged => AddPeerOutcome::AlreadyPresent,
            RosterChange::Replaced if was_member => AddPeerOutcome::AlreadyPresent,
            _ => AddPeerOutcome::Added,
        };
        info!(peer = %target, ?outcome, "peer added");
        Ok(outcome)
    }

    /// Remove `target` from the roster, dropping its conversation and typing
    /// state. A selected peer is deselected.
    pub async fn remove_peer(&mut self, target: &PeerId) -> SyncResult<()> {
        let result = self.try_remove_peer(target).await;
        self.report(result)
    }

    async fn try_remove_peer(&mut self, target: &PeerId) -> SyncResult<()> {
        let local_user = self.local_user()?;
        let response = self.api.remove_peer(&local_user, target).await?;

        let session = self.session_mut()?;
        session.supersede_roster_fetches();
        match response.roster() {
            Some(peers) => {
                session.roster.replace(peers);
            }
            None => {
                session.roster.remove(target);
            }
        }
        session.forget_peer(target);
        info!(peer = %target, "peer removed");
        Ok(())
    }

    /// Delete the conversation with `peer` on the server, then empty it locally.
    pub async fn clear_history(&mut self, peer: &PeerId) -> SyncResult<()> {
        let result = self.try_clear_history(peer).await;
        self.report(result)
    }

    async fn try_clear_history(&mut self, peer: &PeerId) -> SyncResult<()> {
        let local_user = self.local_user()?;
        self.api.clear_history(&local_user, peer).await?;
        self.session_mut()?.store.clear(peer);
        info!(peer = %peer, "history cleared");
        Ok(())
    }

    /// Search for users that could be added: not the local user and not
    /// already in the roster. A blank query returns nothing without a request.
    pub async fn search_candidates(&self, query: &str) -> SyncResult<Vec<Peer>> {
        let result = self.try_search_candidates(query).await;
        self.report(result)
    }

    async fn try_search_candidates(&self, query: &str) -> SyncResult<Vec<Peer>> {
        let session = self.session_ref()?;
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let found = self.api.search_users(query).await?;
        Ok(session
            .roster
            .available_candidates(found, &session.context.local_user))
    }

    /// Wait for the next queued input. Returns `None` when no session is active.
    pub async fn next_input(&mut self) -> Option<SyncInput> {
        let session = self.session.as_mut()?;
        tokio::select! {
            Some(input) = session.inbound.recv() => Some(input),
            Some(expiry) = session.expiries.recv() => Some(SyncInput::TypingExpired(expiry)),
            else => None,
        }
    }

    pub fn apply(&mut self, input: SyncInput) -> Option<SyncUpdate> {
        self.session.as_mut()?.apply(input)
    }

    /// Apply every input that is already queued, without waiting.
    pub fn drain_ready(&mut self) -> Vec<SyncUpdate> {
        let mut updates = Vec::new();
        while let Some(session) = self.session.as_mut() {
            let input = match session.inbound.try_recv() {
                Ok(input) => input,
                Err(_) => match session.expiries.try_recv() {
                    Ok(expiry) => SyncInput::TypingExpired(expiry),
                    Err(_) => break,
                },
            };
            updates.extend(session.apply(input));
        }
        updates
    }

    fn session_ref(&self) -> SyncResult<&Session> {
        self.session.as_ref().ok_or(SyncError::NoSession)
    }

    fn session_mut(&mut self) -> SyncResult<&mut Session> {
        self.session.as_mut().ok_or(SyncError::NoSession)
    }

    fn local_user(&self) -> SyncResult<PeerId> {
        Ok(self.session_ref()?.context.local_user.clone())
    }

    fn report<T>(&self, result: SyncResult<T>) -> SyncResult<T> {
        if let Err(error) = &result {
            warn!(%error, "operation failed");
            let _ = self.notifier.send(Notification::Error(error.to_string()));
        }
        result
    }
}

impl Drop for SyncOrchestrator {
    fn drop(&mut self) {
        self.end_session();
    }
}
