//! Friend protocol engine.
//!
//! The engine owns the friend table, message queues and file transfers.
//! All of that state lives in one actor task; [`ChatEngine`] is a cheap,
//! cloneable handle that marshals calls over an mpsc channel and waits for
//! the answer on a oneshot channel. The actor talks to the network only
//! through a [`TransportHandle`], so it runs unchanged over Tor or over the
//! in-memory hub.
//!
//! Dropping the last handle stops the actor, the transport and any
//! periodic status check.

use super::file_transfer::{
    build_bundle, BuiltBundle, IncomingTransfer, OutgoingTransfer, TransferState,
    DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_WINDOW, DEFAULT_MAX_FILE_SIZE, MAX_CHUNK_SIZE,
};
use super::friend::{ConnectionStatus, FriendState, FriendTable, OutboundRequest};
use super::message::{validate_text, Message, MessageIdAllocator, MessageKind, MessageStatus};
use super::state::{SavedFriend, SavedRequest, SavedState, STATE_VERSION};
use crate::error::{Error, Result};
use crate::events::{ChatEvent, EventBus};
use crate::identity::{public_key_from_address, Nospam, OnionIdentity, PeerAddress, PublicKey};
use crate::protocol::{
    FileChunkPayload, FileChunkRequestPayload, FileControl, FileControlPayload, FileOfferPayload,
    FriendAcceptPayload, FriendRequestPayload, MessagePayload, PeerPacket, ReceiptPayload,
    StatusPayload, TypingPayload,
};
use crate::transport::{TransportCommand, TransportEvent, TransportHandle};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Command channel depth.
const COMMAND_QUEUE_DEPTH: usize = 128;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Where received bundles are unpacked.
    pub download_dir: PathBuf,
    /// Where outgoing bundles are built.
    pub temp_dir: PathBuf,
    /// How long a typing flag stays set without a refresh.
    pub typing_timeout: Duration,
    /// Period of the friend status check.
    pub status_interval: Duration,
    /// Period of typing expiry checks.
    pub housekeeping_interval: Duration,
    /// File chunk size served to peers.
    pub chunk_size: u32,
    /// Chunk requests kept in flight per incoming transfer.
    pub chunk_window: u32,
    /// Largest incoming bundle accepted, in bytes.
    pub max_file_size: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let base = std::env::temp_dir().join("onionchat");
        Self {
            download_dir: base.join("downloads"),
            temp_dir: base.join("outgoing"),
            typing_timeout: Duration::from_secs(5),
            status_interval: Duration::from_secs(2),
            housekeeping_interval: Duration::from_secs(1),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_window: DEFAULT_CHUNK_WINDOW,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

/// Callback for the periodic friend status check: hex public key to online.
pub type StatusCallback = Arc<dyn Fn(HashMap<String, bool>) + Send + Sync>;

/// Requests handled by the engine actor.
enum EngineCommand {
    SaveState {
        reply: oneshot::Sender<Result<String>>,
    },
    AddFriend {
        address: String,
        message: String,
        reply: oneshot::Sender<Result<u32>>,
    },
    ConfirmFriendRequest {
        public_key: String,
        reply: oneshot::Sender<Result<String>>,
    },
    DeleteFriend {
        public_key: String,
        reply: oneshot::Sender<bool>,
    },
    FriendNumber {
        public_key: String,
        reply: oneshot::Sender<Option<u32>>,
    },
    FriendConnectionStatus {
        public_key: String,
        reply: oneshot::Sender<Result<ConnectionStatus>>,
    },
    SendMessage {
        to: String,
        text: String,
        kind: MessageKind,
        reply: oneshot::Sender<Result<i32>>,
    },
    SetTyping {
        to: String,
        is_typing: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    SetSelfStatus {
        is_online: bool,
        reply: oneshot::Sender<()>,
    },
    FriendsStatus {
        reply: oneshot::Sender<HashMap<String, bool>>,
    },
    PendingRequests {
        reply: oneshot::Sender<Vec<(String, String)>>,
    },
    SendFile {
        owner: String,
        recipient: String,
        model: serde_json::Value,
        record_model: Option<serde_json::Value>,
        files: Vec<PathBuf>,
        reply: oneshot::Sender<Result<i32>>,
    },
    BundleBuilt {
        recipient: PublicKey,
        message_id: i32,
        result: Result<BuiltBundle>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Handle to a running engine. Cheap to clone.
#[derive(Clone)]
pub struct ChatEngine {
    commands: mpsc::Sender<EngineCommand>,
    address: PeerAddress,
    status_interval: Duration,
    status_check: Arc<TokioMutex<Option<AbortOnDrop>>>,
}

impl ChatEngine {
    /// Build an engine from a saved blob, or a fresh identity when `None`.
    ///
    /// `connect` receives the engine identity and returns the transport the
    /// engine should drive. Must be called inside a tokio runtime.
    pub fn start<F>(
        save_data: Option<&str>,
        config: EngineConfig,
        events: EventBus,
        connect: F,
    ) -> Result<Self>
    where
        F: FnOnce(&OnionIdentity) -> TransportHandle,
    {
        let (identity, nospam, friends, pending_requests) = match save_data {
            Some(blob) => restore(&SavedState::decode(blob)?)?,
            None => (
                OnionIdentity::generate(),
                Nospam::generate(),
                FriendTable::new(),
                BTreeMap::new(),
            ),
        };
        let address = PeerAddress::new(identity.public_key(), nospam);

        let mut config = config;
        config.chunk_size = config.chunk_size.clamp(1, MAX_CHUNK_SIZE);
        config.chunk_window = config.chunk_window.max(1);

        let TransportHandle {
            commands: transport,
            events: transport_events,
        } = connect(&identity);

        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let status_interval = config.status_interval;

        info!(
            public_key = ?address.public_key(),
            friends = friends.len(),
            restored = save_data.is_some(),
            "Starting chat engine"
        );

        let actor = EngineActor {
            public_key: identity.public_key(),
            identity,
            nospam,
            config,
            events,
            transport,
            self_tx: tx.downgrade(),
            friends,
            pending_requests,
            ids: MessageIdAllocator::new(),
            online: false,
            self_online: true,
            files: HashMap::new(),
            incoming: HashMap::new(),
        };
        tokio::spawn(actor.run(rx, transport_events));

        Ok(Self {
            commands: tx,
            address,
            status_interval,
            status_check: Arc::new(TokioMutex::new(None)),
        })
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> EngineCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| Error::EngineStopped)?;
        rx.await.map_err(|_| Error::EngineStopped)
    }

    /// Serialize identity, friends and pending requests to Base64.
    pub async fn tox_state_as_string(&self) -> Result<String> {
        self.request(|reply| EngineCommand::SaveState { reply }).await?
    }

    /// Our 76-character peer address.
    pub fn get_tox_address(&self) -> String {
        self.address.to_hex()
    }

    /// Our 64-character public key.
    pub fn get_tox_public_key(&self) -> String {
        self.address.public_key().to_hex()
    }

    /// Public key part of a valid peer address.
    pub fn get_tox_public_key_from(address: &str) -> Option<String> {
        public_key_from_address(address)
    }

    /// Send a friend request. Returns the friend number; repeated calls
    /// for the same key return the existing number without resending.
    pub async fn add_friend(&self, address: &str, message: &str) -> Result<u32> {
        self.request(|reply| EngineCommand::AddFriend {
            address: address.to_string(),
            message: message.to_string(),
            reply,
        })
        .await?
    }

    /// Accept a pending inbound request. Returns the requester's key.
    pub async fn confirm_friend_request(&self, public_key: &str) -> Result<String> {
        self.request(|reply| EngineCommand::ConfirmFriendRequest {
            public_key: public_key.to_string(),
            reply,
        })
        .await?
    }

    /// Remove a friend. `false` if the key was not a friend.
    pub async fn delete_friend(&self, public_key: &str) -> Result<bool> {
        self.request(|reply| EngineCommand::DeleteFriend {
            public_key: public_key.to_string(),
            reply,
        })
        .await
    }

    /// Friend number for a key.
    pub async fn friend_number(&self, public_key: &str) -> Result<Option<u32>> {
        self.request(|reply| EngineCommand::FriendNumber {
            public_key: public_key.to_string(),
            reply,
        })
        .await
    }

    /// Transport-level status of a friend; `None` when the friend is absent
    /// or offline.
    pub async fn friend_connection_status(&self, public_key: &str) -> Result<ConnectionStatus> {
        self.request(|reply| EngineCommand::FriendConnectionStatus {
            public_key: public_key.to_string(),
            reply,
        })
        .await?
    }

    /// Queue a message. Returns its id immediately; delivery progress is
    /// published as `didUpdateMessageStatus`.
    pub async fn send_message(&self, to: &str, text: &str, kind: MessageKind) -> Result<i32> {
        self.request(|reply| EngineCommand::SendMessage {
            to: to.to_string(),
            text: text.to_string(),
            kind,
            reply,
        })
        .await?
    }

    /// Tell a friend whether we are typing.
    pub async fn set_user_is_typing(&self, is_typing: bool, to: &str) -> Result<()> {
        self.request(|reply| EngineCommand::SetTyping {
            to: to.to_string(),
            is_typing,
            reply,
        })
        .await?
    }

    /// Announce our presence to every friend.
    pub async fn set_self_status(&self, is_online: bool) -> Result<()> {
        self.request(|reply| EngineCommand::SetSelfStatus { is_online, reply })
            .await
    }

    /// Online flag of every friend, keyed by hex public key.
    pub async fn friends_status(&self) -> Result<HashMap<String, bool>> {
        self.request(|reply| EngineCommand::FriendsStatus { reply }).await
    }

    /// Inbound friend requests awaiting confirmation, as `(key, message)`.
    pub async fn pending_requests(&self) -> Result<Vec<(String, String)>> {
        self.request(|reply| EngineCommand::PendingRequests { reply })
            .await
    }

    /// Report friend presence to `callback` now and then every status
    /// interval. Replaces a running check.
    pub async fn start_periodic_friend_status_check<F>(&self, callback: F)
    where
        F: Fn(HashMap<String, bool>) + Send + Sync + 'static,
    {
        let callback: StatusCallback = Arc::new(callback);
        let commands = self.commands.downgrade();
        let period = self.status_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(commands) = commands.upgrade() else {
                    break;
                };
                let (reply, rx) = oneshot::channel();
                if commands.send(EngineCommand::FriendsStatus { reply }).await.is_err() {
                    break;
                }
                drop(commands);
                match rx.await {
                    Ok(status) => callback(status),
                    Err(_) => break,
                }
            }
            debug!("Friend status check ended");
        });

        *self.status_check.lock().await = Some(AbortOnDrop(task));
    }

    /// Stop the periodic status check. No-op when none is running.
    pub async fn stop_periodic_friend_status_check(&self) {
        self.status_check.lock().await.take();
    }

    /// Bundle `files` with the models and send them to `recipient`.
    ///
    /// Returns the message id used in `didUpdateFileSend` and
    /// `didUpdateFileErrorSend`. Transfers to one friend run one at a time.
    pub async fn send_file(
        &self,
        owner_public_key: &str,
        recipient_public_key: &str,
        model: serde_json::Value,
        record_model: Option<serde_json::Value>,
        files: Vec<PathBuf>,
    ) -> Result<i32> {
        self.request(|reply| EngineCommand::SendFile {
            owner: owner_public_key.to_string(),
            recipient: recipient_public_key.to_string(),
            model,
            record_model,
            files,
            reply,
        })
        .await?
    }

    /// Stop the engine and its transport. Later calls fail with
    /// [`Error::EngineStopped`].
    pub async fn shutdown(&self) {
        self.status_check.lock().await.take();
        let _ = self.request(|reply| EngineCommand::Shutdown { reply }).await;
    }
}

impl std::fmt::Debug for ChatEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatEngine")
            .field("public_key", &self.address.public_key())
            .finish()
    }
}

type Restored = (OnionIdentity, Nospam, FriendTable, BTreeMap<PublicKey, String>);

fn restore(state: &SavedState) -> Result<Restored> {
    if state.version != STATE_VERSION {
        return Err(Error::InvalidState(format!("unsupported state version {}", state.version)));
    }
    let identity = OnionIdentity::from_secret_bytes(&state.secret_key)?;

    let mut friends = FriendTable::new();
    for saved in &state.friends {
        let key = PublicKey::from_bytes(saved.public_key);
        let friend_state = if saved.established {
            FriendState::Established
        } else {
            FriendState::PendingOutbound
        };
        friends.insert_with_number(key, saved.friend_number, friend_state);
        if let (Some(friend), Some((nospam, message))) = (friends.get_mut(&key), &saved.request) {
            friend.request = Some(OutboundRequest {
                nospam: Nospam::from_bytes(*nospam),
                message: message.clone(),
            });
        }
    }

    let pending = state
        .pending_requests
        .iter()
        .map(|r| (PublicKey::from_bytes(r.public_key), r.message.clone()))
        .collect();

    Ok((identity, Nospam::from_bytes(state.nospam), friends, pending))
}

/// Queued or running outgoing transfer.
enum FileJob {
    Building(i32),
    Ready(OutgoingTransfer),
}

impl FileJob {
    fn message_id(&self) -> i32 {
        match self {
            FileJob::Building(id) => *id,
            FileJob::Ready(t) => t.message_id,
        }
    }
}

struct EngineActor {
    identity: OnionIdentity,
    public_key: PublicKey,
    nospam: Nospam,
    config: EngineConfig,
    events: EventBus,
    transport: mpsc::UnboundedSender<TransportCommand>,
    self_tx: mpsc::WeakSender<EngineCommand>,
    friends: FriendTable,
    pending_requests: BTreeMap<PublicKey, String>,
    ids: MessageIdAllocator,
    /// Whether the transport is up.
    online: bool,
    /// Presence we announce to friends.
    self_online: bool,
    files: HashMap<PublicKey, VecDeque<FileJob>>,
    incoming: HashMap<[u8; 16], IncomingTransfer>,
}

impl EngineActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<EngineCommand>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let known: Vec<PublicKey> = self.friends.iter().map(|f| f.public_key).collect();
        for key in known {
            self.transport_command(TransportCommand::Connect(key));
        }

        let mut housekeeping = tokio::time::interval(self.config.housekeeping_interval);
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut transport_open = true;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    None => break,
                    Some(EngineCommand::Shutdown { reply }) => {
                        self.close().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command).await,
                },
                event = transport_events.recv(), if transport_open => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => {
                        transport_open = false;
                        self.on_transport_stopped().await;
                    }
                },
                _ = housekeeping.tick() => self.expire_typing(),
            }
        }

        self.close().await;
    }

    async fn close(&mut self) {
        self.transport_command(TransportCommand::Shutdown);
        for (_, queue) in self.files.drain() {
            for job in queue {
                if let FileJob::Ready(transfer) = job {
                    transfer.discard().await;
                }
            }
        }
        for (_, transfer) in self.incoming.drain() {
            transfer.abandon().await;
        }
        info!("Chat engine stopped");
    }

    fn publish(&self, event: ChatEvent) {
        self.events.publish(event);
    }

    fn transport_command(&self, command: TransportCommand) -> bool {
        self.transport.send(command).is_ok()
    }

    fn send_packet(&self, to: PublicKey, packet: PeerPacket) -> bool {
        self.transport_command(TransportCommand::Send { to, packet })
    }

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::SaveState { reply } => {
                let _ = reply.send(self.saved_state().encode());
            }
            EngineCommand::AddFriend {
                address,
                message,
                reply,
            } => {
                let result = self.add_friend(&address, message);
                let _ = reply.send(result);
            }
            EngineCommand::ConfirmFriendRequest { public_key, reply } => {
                let result = self.confirm_friend_request(&public_key);
                let _ = reply.send(result);
            }
            EngineCommand::DeleteFriend { public_key, reply } => {
                let removed = self.delete_friend(&public_key).await;
                let _ = reply.send(removed);
            }
            EngineCommand::FriendNumber { public_key, reply } => {
                let number = PublicKey::from_hex(&public_key)
                    .ok()
                    .and_then(|key| self.friends.get(&key).map(|f| f.friend_number));
                let _ = reply.send(number);
            }
            EngineCommand::FriendConnectionStatus { public_key, reply } => {
                let status = PublicKey::from_hex(&public_key).map(|key| {
                    self.friends
                        .get(&key)
                        .map_or(ConnectionStatus::None, |f| f.connection_status())
                });
                let _ = reply.send(status);
            }
            EngineCommand::SendMessage {
                to,
                text,
                kind,
                reply,
            } => {
                let result = self.send_message(&to, text, kind);
                let _ = reply.send(result);
            }
            EngineCommand::SetTyping {
                to,
                is_typing,
                reply,
            } => {
                let result = self.set_typing(&to, is_typing);
                let _ = reply.send(result);
            }
            EngineCommand::SetSelfStatus { is_online, reply } => {
                self.set_self_status(is_online);
                let _ = reply.send(());
            }
            EngineCommand::FriendsStatus { reply } => {
                let status = self
                    .friends
                    .iter()
                    .map(|f| (f.public_key.to_hex(), f.is_online()))
                    .collect();
                let _ = reply.send(status);
            }
            EngineCommand::PendingRequests { reply } => {
                let pending = self
                    .pending_requests
                    .iter()
                    .map(|(key, message)| (key.to_hex(), message.clone()))
                    .collect();
                let _ = reply.send(pending);
            }
            EngineCommand::SendFile {
                owner,
                recipient,
                model,
                record_model,
                files,
                reply,
            } => {
                let result = self.send_file(&owner, &recipient, model, record_model, files);
                let _ = reply.send(result);
            }
            EngineCommand::BundleBuilt {
                recipient,
                message_id,
                result,
            } => self.on_bundle_built(recipient, message_id, result).await,
            EngineCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn saved_state(&self) -> SavedState {
        SavedState {
            version: STATE_VERSION,
            secret_key: *self.identity.secret_key_bytes(),
            nospam: *self.nospam.as_bytes(),
            friends: self
                .friends
                .iter()
                .map(|f| SavedFriend {
                    public_key: *f.public_key.as_bytes(),
                    friend_number: f.friend_number,
                    established: f.state == FriendState::Established,
                    request: f
                        .request
                        .as_ref()
                        .map(|r| (*r.nospam.as_bytes(), r.message.clone())),
                })
                .collect(),
            pending_requests: self
                .pending_requests
                .iter()
                .map(|(key, message)| SavedRequest {
                    public_key: *key.as_bytes(),
                    message: message.clone(),
                })
                .collect(),
        }
    }

    // Friends

    fn add_friend(&mut self, address: &str, message: String) -> Result<u32> {
        let address = PeerAddress::parse(address)?;
        let key = *address.public_key();
        if key == self.public_key {
            return Err(Error::OwnKey);
        }
        validate_text(&message)?;

        let (number, created) = self.friends.insert(key, FriendState::PendingOutbound);
        if !created {
            debug!(peer = ?key, "Friend already added");
            return Ok(number);
        }
        if let Some(friend) = self.friends.get_mut(&key) {
            friend.request = Some(OutboundRequest {
                nospam: *address.nospam(),
                message,
            });
        }
        info!(peer = ?key, friend_number = number, "Friend request queued");
        self.transport_command(TransportCommand::Connect(key));
        Ok(number)
    }

    fn confirm_friend_request(&mut self, public_key: &str) -> Result<String> {
        let key = PublicKey::from_hex(public_key)?;
        if self.pending_requests.remove(&key).is_none() {
            return Err(Error::RequestNotFound);
        }

        let (number, created) = self.friends.insert(key, FriendState::Established);
        if let Some(friend) = self.friends.get_mut(&key) {
            friend.state = FriendState::Established;
            friend.request = None;
        }
        info!(peer = ?key, friend_number = number, created, "Friend request confirmed");

        self.transport_command(TransportCommand::Connect(key));
        self.send_packet(
            key,
            PeerPacket::FriendAccept(FriendAcceptPayload {
                is_online: self.self_online,
            }),
        );
        Ok(key.to_hex())
    }

    async fn delete_friend(&mut self, public_key: &str) -> bool {
        let Ok(key) = PublicKey::from_hex(public_key) else {
            return false;
        };
        let Some(friend) = self.friends.remove(&key) else {
            return false;
        };
        info!(peer = ?key, friend_number = friend.friend_number, "Friend deleted");

        self.transport_command(TransportCommand::Disconnect(key));
        if let Some(queue) = self.files.remove(&key) {
            for job in queue {
                if let FileJob::Ready(transfer) = job {
                    transfer.discard().await;
                }
            }
        }
        let abandoned: Vec<[u8; 16]> = self
            .incoming
            .iter()
            .filter(|(_, t)| t.sender == key)
            .map(|(id, _)| *id)
            .collect();
        for id in abandoned {
            if let Some(transfer) = self.incoming.remove(&id) {
                transfer.abandon().await;
            }
        }
        true
    }

    /// Emit `didUpdateFriendOnlineStatus` if the derived flag changed.
    fn report_presence(&mut self, key: &PublicKey) {
        let Some(friend) = self.friends.get_mut(key) else {
            return;
        };
        let online = friend.is_online();
        if online != friend.reported_online {
            friend.reported_online = online;
            self.events.publish(ChatEvent::DidUpdateFriendOnlineStatus {
                public_key: key.to_hex(),
                is_online: online,
            });
        }
    }

    fn set_self_status(&mut self, is_online: bool) {
        self.self_online = is_online;
        let reachable: Vec<PublicKey> = self
            .friends
            .iter()
            .filter(|f| f.can_deliver())
            .map(|f| f.public_key)
            .collect();
        for key in reachable {
            self.send_packet(key, PeerPacket::Status(StatusPayload { is_online }));
        }
    }

    fn set_typing(&mut self, to: &str, is_typing: bool) -> Result<()> {
        let key = PublicKey::from_hex(to)?;
        let friend = self.friends.get(&key).ok_or(Error::FriendNotFound)?;
        if friend.can_deliver() {
            self.send_packet(key, PeerPacket::Typing(TypingPayload { is_typing }));
        }
        Ok(())
    }

    fn expire_typing(&mut self) {
        let now = Instant::now();
        for friend in self.friends.iter_mut() {
            if matches!(friend.typing_until, Some(until) if until <= now) {
                friend.typing_until = None;
                self.events.publish(ChatEvent::IsTyping {
                    public_key: friend.public_key.to_hex(),
                    is_typing: false,
                });
            }
        }
    }

    // Messages

    fn send_message(&mut self, to: &str, text: String, kind: MessageKind) -> Result<i32> {
        let key = PublicKey::from_hex(to)?;
        if !self.friends.contains(&key) {
            return Err(Error::FriendNotFound);
        }
        validate_text(&text)?;

        let id = self.ids.allocate()?;
        if let Some(friend) = self.friends.get_mut(&key) {
            friend.outbox.push_back(Message::outgoing(id, key, kind, text));
        }
        debug!(peer = ?key, message_id = id, "Message queued");
        self.flush_outbox(key);
        Ok(id)
    }

    fn publish_status(&self, message: &Message) {
        self.publish(ChatEvent::DidUpdateMessageStatus {
            public_key: message.peer.to_hex(),
            message_id: message.id,
            status: message.status,
        });
    }

    /// Hand queued messages to the transport, oldest first.
    fn flush_outbox(&mut self, key: PublicKey) {
        loop {
            let mut message = {
                let Some(friend) = self.friends.get_mut(&key) else {
                    return;
                };
                if !friend.can_deliver() {
                    return;
                }
                let Some(message) = friend.outbox.pop_front() else {
                    return;
                };
                message
            };

            let packet = PeerPacket::Message(MessagePayload {
                message_id: message.id,
                kind: message.kind,
                text: message.text().unwrap_or_default().to_string(),
            });
            if self.send_packet(key, packet) {
                message.mark_sent();
            } else {
                message.mark_failed();
            }
            self.publish_status(&message);

            if message.status == MessageStatus::Sent {
                if let Some(friend) = self.friends.get_mut(&key) {
                    friend.awaiting_receipt.insert(message.id, message);
                }
            }
        }
    }

    // Transport events

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Ready => {
                if !self.online {
                    self.online = true;
                    info!("Transport ready");
                    self.publish(ChatEvent::DidUpdateMyOnlineStatus { is_online: true });
                }
            }
            TransportEvent::Stopped => self.on_transport_stopped().await,
            TransportEvent::PeerConnected { peer, status } => {
                self.on_peer_connected(peer, status)
            }
            TransportEvent::PeerDisconnected { peer } => {
                if let Some(friend) = self.friends.get_mut(&peer) {
                    friend.transport_connected = false;
                    debug!(peer = ?peer, "Friend disconnected");
                }
                self.report_presence(&peer);
            }
            TransportEvent::Inbound { from, packet } => self.on_packet(from, packet).await,
            TransportEvent::SendFailed { to, packet, error } => {
                self.on_send_failed(to, packet, error).await
            }
        }
    }

    async fn on_transport_stopped(&mut self) {
        let was_online = std::mem::replace(&mut self.online, false);
        let cancelled = Error::Cancelled.to_string();
        warn!("Transport stopped; cancelling queued deliveries");

        let mut failed = Vec::new();
        let mut typing_cleared = Vec::new();
        let keys: Vec<PublicKey> = self.friends.iter().map(|f| f.public_key).collect();
        for key in &keys {
            if let Some(friend) = self.friends.get_mut(key) {
                friend.transport_connected = false;
                if friend.typing_until.take().is_some() {
                    typing_cleared.push(*key);
                }
                let mut pending: Vec<Message> = friend.outbox.drain(..).collect();
                pending.extend(friend.awaiting_receipt.drain().map(|(_, m)| m));
                pending.sort_by_key(|m| m.id);
                for mut message in pending {
                    if message.mark_failed() {
                        failed.push(message);
                    }
                }
            }
        }

        for message in &failed {
            self.publish_status(message);
        }
        for key in typing_cleared {
            self.publish(ChatEvent::IsTyping {
                public_key: key.to_hex(),
                is_typing: false,
            });
        }
        for key in &keys {
            self.report_presence(key);
        }

        for (key, queue) in std::mem::take(&mut self.files) {
            for job in queue {
                if let FileJob::Ready(transfer) = &job {
                    transfer.discard().await;
                }
                self.publish(ChatEvent::DidUpdateFileErrorSend {
                    public_key: key.to_hex(),
                    message_id: job.message_id(),
                    error: cancelled.clone(),
                });
            }
        }
        for (_, transfer) in self.incoming.drain() {
            transfer.abandon().await;
        }

        if was_online {
            self.publish(ChatEvent::DidUpdateMyOnlineStatus { is_online: false });
        }
    }

    fn on_peer_connected(&mut self, peer: PublicKey, status: ConnectionStatus) {
        let Some(friend) = self.friends.get_mut(&peer) else {
            debug!(peer = ?peer, "Connected to non-friend");
            return;
        };
        friend.transport_connected = status.is_connected();
        debug!(peer = ?peer, ?status, "Friend connected");

        match friend.state {
            FriendState::PendingOutbound => {
                if let Some(request) = friend.request.clone() {
                    self.send_packet(
                        peer,
                        PeerPacket::FriendRequest(FriendRequestPayload {
                            nospam: *request.nospam.as_bytes(),
                            message: request.message,
                        }),
                    );
                }
            }
            FriendState::Established => {
                self.send_packet(
                    peer,
                    PeerPacket::Status(StatusPayload {
                        is_online: self.self_online,
                    }),
                );
                self.flush_outbox(peer);
                self.resume_files(peer);
            }
        }
        self.report_presence(&peer);
    }

    async fn on_send_failed(&mut self, to: PublicKey, packet: PeerPacket, error: String) {
        debug!(peer = ?to, packet = ?packet.packet_type(), error = %error, "Send failed");
        match packet {
            PeerPacket::Message(payload) => {
                let failed = self
                    .friends
                    .get_mut(&to)
                    .and_then(|f| f.awaiting_receipt.remove(&payload.message_id));
                if let Some(mut message) = failed {
                    if message.mark_failed() {
                        self.publish_status(&message);
                    }
                }
            }
            PeerPacket::FileOffer(offer) => {
                self.fail_transfer(to, offer.transfer_id, error).await;
            }
            PeerPacket::FileChunk(chunk) => {
                self.fail_transfer(to, chunk.transfer_id, error).await;
            }
            _ => {}
        }
    }

    async fn on_packet(&mut self, from: PublicKey, packet: PeerPacket) {
        if let PeerPacket::FriendRequest(request) = packet {
            self.on_friend_request(from, request);
            return;
        }

        let Some(friend) = self.friends.get_mut(&from) else {
            debug!(peer = ?from, packet = ?packet.packet_type(), "Dropping packet from non-friend");
            return;
        };

        if let PeerPacket::FriendAccept(accept) = packet {
            if friend.state == FriendState::PendingOutbound {
                friend.state = FriendState::Established;
                friend.request = None;
                friend.announced_online = accept.is_online;
                info!(peer = ?from, "Friend request accepted");
                self.flush_outbox(from);
                self.resume_files(from);
                self.report_presence(&from);
            }
            return;
        }

        if friend.state != FriendState::Established {
            debug!(peer = ?from, packet = ?packet.packet_type(), "Dropping packet from pending friend");
            return;
        }

        match packet {
            PeerPacket::Message(message) => {
                self.publish(ChatEvent::DidReceiveMessage {
                    public_key: from.to_hex(),
                    message_id: message.message_id,
                    text: message.text,
                    kind: message.kind,
                });
                self.send_packet(
                    from,
                    PeerPacket::Receipt(ReceiptPayload {
                        message_id: message.message_id,
                    }),
                );
            }
            PeerPacket::Receipt(receipt) => {
                let read = self
                    .friends
                    .get_mut(&from)
                    .and_then(|f| f.awaiting_receipt.remove(&receipt.message_id));
                if let Some(mut message) = read {
                    if message.mark_read() {
                        self.publish(ChatEvent::DidUpdateFriendReadReceipt {
                            public_key: from.to_hex(),
                            message_id: message.id,
                        });
                        self.publish_status(&message);
                    }
                }
            }
            PeerPacket::Typing(typing) => {
                let now = Instant::now();
                let ttl = self.config.typing_timeout;
                let Some(friend) = self.friends.get_mut(&from) else {
                    return;
                };
                let was_typing = friend.is_typing(now);
                friend.typing_until = typing.is_typing.then(|| now + ttl);
                if was_typing != typing.is_typing {
                    self.publish(ChatEvent::IsTyping {
                        public_key: from.to_hex(),
                        is_typing: typing.is_typing,
                    });
                }
            }
            PeerPacket::Status(status) => {
                if let Some(friend) = self.friends.get_mut(&from) {
                    friend.announced_online = status.is_online;
                }
                self.report_presence(&from);
            }
            PeerPacket::FileOffer(offer) => self.on_file_offer(from, offer).await,
            PeerPacket::FileControl(control) => self.on_file_control(from, control).await,
            PeerPacket::FileChunkRequest(request) => self.on_chunk_request(from, request).await,
            PeerPacket::FileChunk(chunk) => self.on_chunk(from, chunk).await,
            PeerPacket::FriendRequest(_)
            | PeerPacket::FriendAccept(_)
            | PeerPacket::Hello(_)
            | PeerPacket::HelloAck(_) => {}
        }
    }

    fn on_friend_request(&mut self, from: PublicKey, request: FriendRequestPayload) {
        if request.nospam != *self.nospam.as_bytes() {
            debug!(peer = ?from, "Dropping friend request with wrong nospam");
            return;
        }
        if validate_text(&request.message).is_err() {
            debug!(peer = ?from, "Dropping friend request with invalid message");
            return;
        }

        if let Some(friend) = self.friends.get_mut(&from) {
            let newly = friend.state == FriendState::PendingOutbound;
            friend.state = FriendState::Established;
            friend.request = None;
            self.pending_requests.remove(&from);
            if newly {
                info!(peer = ?from, "Mutual friend request; accepting");
            }
            self.send_packet(
                from,
                PeerPacket::FriendAccept(FriendAcceptPayload {
                    is_online: self.self_online,
                }),
            );
            if newly {
                self.flush_outbox(from);
                self.resume_files(from);
                self.report_presence(&from);
            }
            return;
        }

        if self.pending_requests.get(&from) == Some(&request.message) {
            debug!(peer = ?from, "Duplicate friend request");
            return;
        }
        info!(peer = ?from, "Friend request received");
        self.pending_requests.insert(from, request.message.clone());
        self.publish(ChatEvent::DidInitiateChat {
            public_key: from.to_hex(),
            message: request.message,
        });
    }

    // Outgoing files

    fn send_file(
        &mut self,
        owner: &str,
        recipient: &str,
        model: serde_json::Value,
        record_model: Option<serde_json::Value>,
        files: Vec<PathBuf>,
    ) -> Result<i32> {
        let owner = PublicKey::from_hex(owner)?;
        let recipient = PublicKey::from_hex(recipient)?;
        if !self.friends.contains(&recipient) {
            return Err(Error::FriendNotFound);
        }

        let message_id = self.ids.allocate()?;
        self.files
            .entry(recipient)
            .or_default()
            .push_back(FileJob::Building(message_id));

        let commands = self.self_tx.clone();
        let temp_dir = self.config.temp_dir.clone();
        tokio::spawn(async move {
            let result = build_bundle(&temp_dir, &owner, &model, record_model.as_ref(), &files).await;
            match commands.upgrade() {
                Some(commands) => {
                    let _ = commands
                        .send(EngineCommand::BundleBuilt {
                            recipient,
                            message_id,
                            result,
                        })
                        .await;
                }
                None => {
                    if let Ok(bundle) = result {
                        let _ = tokio::fs::remove_file(bundle.path).await;
                    }
                }
            }
        });

        debug!(peer = ?recipient, message_id, "Building file bundle");
        Ok(message_id)
    }

    async fn on_bundle_built(&mut self, recipient: PublicKey, message_id: i32, result: Result<BuiltBundle>) {
        let position = self.files.get(&recipient).and_then(|queue| {
            queue
                .iter()
                .position(|job| matches!(job, FileJob::Building(id) if *id == message_id))
        });
        let Some(position) = position else {
            if let Ok(bundle) = result {
                let _ = tokio::fs::remove_file(bundle.path).await;
            }
            return;
        };

        match result {
            Ok(bundle) => {
                let transfer = OutgoingTransfer::new(message_id, recipient, bundle, self.config.chunk_size);
                if let Some(queue) = self.files.get_mut(&recipient) {
                    queue[position] = FileJob::Ready(transfer);
                }
            }
            Err(e) => {
                warn!(peer = ?recipient, message_id, error = %e, "Failed to build bundle");
                if let Some(queue) = self.files.get_mut(&recipient) {
                    queue.remove(position);
                }
                self.publish(ChatEvent::DidUpdateFileErrorSend {
                    public_key: recipient.to_hex(),
                    message_id,
                    error: e.to_string(),
                });
            }
        }
        self.resume_files(recipient);
    }

    /// Offer the head-of-queue transfer, or re-offer it after a reconnect.
    fn resume_files(&mut self, key: PublicKey) {
        let can_deliver = self.friends.get(&key).map_or(false, |f| f.can_deliver());
        if !can_deliver {
            return;
        }
        let offer = match self.files.get_mut(&key).and_then(|q| q.front_mut()) {
            Some(FileJob::Ready(transfer)) => {
                let first = transfer.state == TransferState::Pending;
                transfer.state = TransferState::Active;
                Some((transfer.offer(), first))
            }
            _ => None,
        };
        let Some((offer, first)) = offer else {
            return;
        };

        if first {
            info!(peer = ?key, message_id = offer.message_id, size = offer.size, "Offering file bundle");
            self.publish(ChatEvent::DidUpdateFileSend {
                public_key: key.to_hex(),
                progress: 0,
                message_id: offer.message_id,
            });
        }
        self.send_packet(key, PeerPacket::FileOffer(offer));
    }

    fn active_transfer(&mut self, key: &PublicKey, transfer_id: &[u8; 16]) -> Option<&mut OutgoingTransfer> {
        match self.files.get_mut(key)?.front_mut()? {
            FileJob::Ready(t) if &t.transfer_id == transfer_id && t.state == TransferState::Active => Some(t),
            _ => None,
        }
    }

    /// Remove the active transfer and start the next one.
    async fn finish_transfer(&mut self, key: PublicKey, transfer_id: [u8; 16], error: Option<String>) {
        if self.active_transfer(&key, &transfer_id).is_none() {
            return;
        }
        let Some(FileJob::Ready(transfer)) = self.files.get_mut(&key).and_then(|q| q.pop_front()) else {
            return;
        };
        transfer.discard().await;

        match error {
            None => {
                info!(peer = ?key, message_id = transfer.message_id, "File bundle delivered");
                self.publish(ChatEvent::DidUpdateFileSend {
                    public_key: key.to_hex(),
                    progress: 100,
                    message_id: transfer.message_id,
                });
            }
            Some(error) => {
                warn!(peer = ?key, message_id = transfer.message_id, error = %error, "File transfer failed");
                self.publish(ChatEvent::DidUpdateFileErrorSend {
                    public_key: key.to_hex(),
                    message_id: transfer.message_id,
                    error,
                });
            }
        }
        if self.files.get(&key).map_or(false, |q| q.is_empty()) {
            self.files.remove(&key);
        }
        self.resume_files(key);
    }

    async fn fail_transfer(&mut self, key: PublicKey, transfer_id: [u8; 16], error: String) {
        if self.active_transfer(&key, &transfer_id).is_some() {
            self.send_packet(
                key,
                PeerPacket::FileControl(FileControlPayload {
                    transfer_id,
                    control: FileControl::Cancel {
                        reason: error.clone(),
                    },
                }),
            );
        }
        self.finish_transfer(key, transfer_id, Some(error)).await;
    }

    async fn on_chunk_request(&mut self, from: PublicKey, request: FileChunkRequestPayload) {
        let Some(transfer) = self.active_transfer(&from, &request.transfer_id) else {
            debug!(peer = ?from, "Chunk request for unknown transfer");
            return;
        };
        match transfer.read_chunk(request.chunk_index).await {
            Ok(data) => {
                let progress = transfer.record_served(request.chunk_index);
                let message_id = transfer.message_id;
                self.send_packet(
                    from,
                    PeerPacket::FileChunk(FileChunkPayload {
                        transfer_id: request.transfer_id,
                        chunk_index: request.chunk_index,
                        data,
                    }),
                );
                if let Some(progress) = progress {
                    self.publish(ChatEvent::DidUpdateFileSend {
                        public_key: from.to_hex(),
                        progress,
                        message_id,
                    });
                }
            }
            Err(e) => self.fail_transfer(from, request.transfer_id, e.to_string()).await,
        }
    }

    async fn on_file_control(&mut self, from: PublicKey, payload: FileControlPayload) {
        match payload.control {
            FileControl::Accept => {
                debug!(peer = ?from, "File offer accepted");
            }
            FileControl::Complete => self.finish_transfer(from, payload.transfer_id, None).await,
            FileControl::Cancel { reason } => {
                if self.active_transfer(&from, &payload.transfer_id).is_some() {
                    self.finish_transfer(from, payload.transfer_id, Some(reason)).await;
                } else if let Some(transfer) = self.incoming.remove(&payload.transfer_id) {
                    if transfer.sender == from {
                        info!(peer = ?from, reason = %reason, "Sender cancelled file transfer");
                        transfer.abandon().await;
                    } else {
                        self.incoming.insert(payload.transfer_id, transfer);
                    }
                }
            }
        }
    }

    // Incoming files

    async fn on_file_offer(&mut self, from: PublicKey, offer: FileOfferPayload) {
        let transfer_id = offer.transfer_id;
        match self.incoming.get_mut(&transfer_id) {
            Some(transfer) if transfer.sender == from => {
                debug!(peer = ?from, "Resuming file transfer");
                transfer.restart_requests();
            }
            Some(_) => {
                debug!(peer = ?from, "Transfer id collision; ignoring offer");
                return;
            }
            None => {
                let created = IncomingTransfer::create(
                    &self.config.download_dir,
                    from,
                    offer,
                    self.config.max_file_size,
                )
                .await;
                match created {
                    Ok(transfer) => {
                        info!(peer = ?from, size = transfer.offer.size, "Receiving file bundle");
                        self.incoming.insert(transfer_id, transfer);
                        self.publish(ChatEvent::DidUpdateFileReceive {
                            public_key: from.to_hex(),
                            progress: 0,
                            file_path: None,
                        });
                    }
                    Err(e) => {
                        warn!(peer = ?from, error = %e, "Cannot receive file bundle");
                        self.send_packet(
                            from,
                            PeerPacket::FileControl(FileControlPayload {
                                transfer_id,
                                control: FileControl::Cancel {
                                    reason: e.to_string(),
                                },
                            }),
                        );
                        return;
                    }
                }
            }
        }

        self.send_packet(
            from,
            PeerPacket::FileControl(FileControlPayload {
                transfer_id,
                control: FileControl::Accept,
            }),
        );
        self.request_chunks(from, transfer_id);
    }

    fn request_chunks(&mut self, from: PublicKey, transfer_id: [u8; 16]) {
        let window = self.config.chunk_window;
        let Some(transfer) = self.incoming.get_mut(&transfer_id) else {
            return;
        };
        for chunk_index in transfer.next_requests(window) {
            self.send_packet(
                from,
                PeerPacket::FileChunkRequest(FileChunkRequestPayload {
                    transfer_id,
                    chunk_index,
                }),
            );
        }
    }

    async fn on_chunk(&mut self, from: PublicKey, chunk: FileChunkPayload) {
        let transfer_id = chunk.transfer_id;
        let Some(transfer) = self.incoming.get_mut(&transfer_id) else {
            return;
        };
        if transfer.sender != from {
            return;
        }

        let written = transfer.write_chunk(chunk.chunk_index, &chunk.data).await;
        let complete = transfer.is_complete();
        match written {
            Ok(Some(progress)) if progress < 100 => self.publish(ChatEvent::DidUpdateFileReceive {
                public_key: from.to_hex(),
                progress,
                file_path: None,
            }),
            Ok(_) => {}
            Err(e) => {
                self.reject_incoming(from, transfer_id, e.to_string()).await;
                return;
            }
        }

        if !complete {
            self.request_chunks(from, transfer_id);
            return;
        }

        let Some(transfer) = self.incoming.remove(&transfer_id) else {
            return;
        };
        match transfer.finish(&self.config.download_dir).await {
            Ok(path) => {
                self.send_packet(
                    from,
                    PeerPacket::FileControl(FileControlPayload {
                        transfer_id,
                        control: FileControl::Complete,
                    }),
                );
                self.publish(ChatEvent::DidUpdateFileReceive {
                    public_key: from.to_hex(),
                    progress: 100,
                    file_path: Some(path),
                });
            }
            Err(e) => {
                warn!(peer = ?from, error = %e, "Received bundle rejected");
                self.send_packet(
                    from,
                    PeerPacket::FileControl(FileControlPayload {
                        transfer_id,
                        control: FileControl::Cancel {
                            reason: e.to_string(),
                        },
                    }),
                );
            }
        }
    }

    async fn reject_incoming(&mut self, from: PublicKey, transfer_id: [u8; 16], reason: String) {
        warn!(peer = ?from, reason = %reason, "Aborting incoming file transfer");
        if let Some(transfer) = self.incoming.remove(&transfer_id) {
            transfer.abandon().await;
        }
        self.send_packet(
            from,
            PeerPacket::FileControl(FileControlPayload {
                transfer_id,
                control: FileControl::Cancel { reason },
            }),
        );
    }
}
