//! Peer transport over Tor hidden services.
//!
//! Each side dials the other's onion service and only ever writes on the
//! stream it dialed; streams accepted by the listener are read-only. A
//! dialed stream starts with a signed HELLO naming the expected responder,
//! answered by a signed HELLO_ACK, so both ends know whose key is on the
//! other side of the circuit.
//!
//! Packets for a peer sit in that peer's worker queue until written. A
//! packet whose write fails is kept and retried after reconnecting, which
//! preserves per-peer ordering across reconnects. Worker queues are
//! unbounded so a burst from the engine never stalls the command loop.

use super::{TransportCommand, TransportEndpoint, TransportEvent, TransportHandle};
use crate::error::{Error, Result};
use crate::identity::{OnionAddress, OnionIdentity, PublicKey};
use crate::messaging::ConnectionStatus;
use crate::protocol::{
    handshake_transcript, read_packet, write_packet, HelloAckPayload, HelloPayload, PeerPacket,
};
use crate::tor::{
    HiddenServiceListener, IncomingConnection, ProxySession, SessionState, TorService,
};
use ed25519_dalek::Signature;
use rand::RngCore;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

const HELLO_ROLE: &str = "hello";
const ACK_ROLE: &str = "ack";

/// Tuning for the onion peer transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Virtual port peers' onion services listen on.
    pub peer_port: u16,
    /// First reconnect delay.
    pub retry_base: Duration,
    /// Reconnect delay cap.
    pub retry_max: Duration,
    /// Time allowed for HELLO/HELLO_ACK.
    pub handshake_timeout: Duration,
    /// Accepted difference between a HELLO timestamp and our clock.
    pub max_clock_skew: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            peer_port: crate::tor::DEFAULT_VIRTUAL_PORT,
            retry_base: Duration::from_secs(2),
            retry_max: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(30),
            max_clock_skew: Duration::from_secs(600),
        }
    }
}

impl TransportConfig {
    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.retry_base.saturating_mul(factor).min(self.retry_max)
    }
}

struct WorkerContext {
    identity: OnionIdentity,
    session: ProxySession,
    config: TransportConfig,
    events: mpsc::UnboundedSender<TransportEvent>,
}

struct PeerWorker {
    queue: mpsc::UnboundedSender<PeerPacket>,
    task: JoinHandle<()>,
}

impl Drop for PeerWorker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Onion peer transport task.
pub struct OnionPeerTransport {
    ctx: Arc<WorkerContext>,
    tor: TorService,
    listener: HiddenServiceListener,
    wanted: HashSet<PublicKey>,
    workers: HashMap<PublicKey, PeerWorker>,
    readers: JoinSet<()>,
    online: bool,
}

impl OnionPeerTransport {
    /// Spawn the transport for `identity` on top of a Tor session and the
    /// listener its hidden service forwards to.
    ///
    /// The service for `identity` is published each time the session
    /// becomes connected. Must be called inside a tokio runtime.
    pub fn spawn(
        identity: OnionIdentity,
        tor: TorService,
        listener: HiddenServiceListener,
        config: TransportConfig,
    ) -> TransportHandle {
        let (handle, endpoint) = TransportHandle::channel();
        let TransportEndpoint { commands, events } = endpoint;

        let ctx = Arc::new(WorkerContext {
            identity,
            session: tor.get_session(),
            config,
            events,
        });
        let transport = Self {
            ctx,
            tor,
            listener,
            wanted: HashSet::new(),
            workers: HashMap::new(),
            readers: JoinSet::new(),
            online: false,
        };
        tokio::spawn(transport.run(commands));
        handle
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<TransportCommand>) {
        let mut state = self.tor.subscribe();
        let mut listening = true;

        let initial = state.borrow_and_update().clone();
        self.on_session_state(initial).await;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    None | Some(TransportCommand::Shutdown) => break,
                    Some(command) => self.handle_command(command),
                },
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = state.borrow_and_update().clone();
                    self.on_session_state(current).await;
                }
                incoming = self.listener.accept(), if listening => match incoming {
                    Some(connection) => {
                        let ctx = self.ctx.clone();
                        self.readers.spawn(serve_inbound(ctx, connection));
                    }
                    None => listening = false,
                },
                Some(_) = self.readers.join_next(), if !self.readers.is_empty() => {}
            }
        }

        self.workers.clear();
        self.readers.shutdown().await;
        debug!("Onion peer transport stopped");
    }

    async fn on_session_state(&mut self, state: SessionState) {
        if state.is_usable() && !self.online {
            self.go_online().await;
        } else if state == SessionState::Stopped && self.online {
            self.online = false;
            self.workers.clear();
            self.readers.abort_all();
            info!("Peer transport offline");
            let _ = self.ctx.events.send(TransportEvent::Stopped);
        }
    }

    async fn go_online(&mut self) {
        match self.listener.local_port() {
            Some(port) => {
                match self
                    .tor
                    .publish_hidden_service(&self.ctx.identity, self.ctx.config.peer_port, port)
                    .await
                {
                    Ok(address) => info!(
                        onion = %crate::logging::RedactedOnion(address.as_str()),
                        "Published peer hidden service"
                    ),
                    Err(e) => warn!(error = %e, "Failed to publish peer hidden service"),
                }
            }
            None => warn!("Listener is not bound; peers cannot reach us"),
        }

        self.online = true;
        info!("Peer transport online");
        let _ = self.ctx.events.send(TransportEvent::Ready);

        let wanted: Vec<PublicKey> = self.wanted.iter().copied().collect();
        for peer in wanted {
            self.ensure_worker(peer);
        }
    }

    fn handle_command(&mut self, command: TransportCommand) {
        match command {
            TransportCommand::Connect(peer) => {
                self.wanted.insert(peer);
                if self.online {
                    self.ensure_worker(peer);
                }
            }
            TransportCommand::Disconnect(peer) => {
                self.wanted.remove(&peer);
                if self.workers.remove(&peer).is_some() {
                    debug!(peer = ?peer, "Dropped peer worker");
                }
            }
            TransportCommand::Send { to, packet } => {
                if !self.online {
                    self.send_failed(to, packet, "transport offline");
                    return;
                }
                self.wanted.insert(to);
                let queue = self.ensure_worker(to);
                if let Err(mpsc::error::SendError(packet)) = queue.send(packet) {
                    self.send_failed(to, packet, "peer worker gone");
                }
            }
            TransportCommand::Shutdown => {}
        }
    }

    fn send_failed(&self, to: PublicKey, packet: PeerPacket, error: &str) {
        let _ = self.ctx.events.send(TransportEvent::SendFailed {
            to,
            packet,
            error: error.to_string(),
        });
    }

    fn ensure_worker(&mut self, peer: PublicKey) -> mpsc::UnboundedSender<PeerPacket> {
        if let Some(worker) = self.workers.get(&peer) {
            if !worker.task.is_finished() {
                return worker.queue.clone();
            }
        }
        let (queue, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(peer_worker(self.ctx.clone(), peer, rx));
        self.workers.insert(
            peer,
            PeerWorker {
                queue: queue.clone(),
                task,
            },
        );
        queue
    }
}

enum PumpEnd {
    QueueClosed,
    Disconnected(String),
}

async fn peer_worker(ctx: Arc<WorkerContext>, peer: PublicKey, mut queue: mpsc::UnboundedReceiver<PeerPacket>) {
    let mut pending: Option<PeerPacket> = None;
    let mut attempt = 0u32;

    loop {
        let stream = match dial(&ctx, &peer).await {
            Ok(stream) => stream,
            Err(Error::Cancelled) => return,
            Err(e) => {
                let delay = ctx.config.backoff(attempt);
                attempt = attempt.saturating_add(1);
                debug!(peer = ?peer, error = %e, ?delay, "Dial failed, retrying");
                tokio::time::sleep(delay).await;
                continue;
            }
        };
        attempt = 0;

        if ctx
            .events
            .send(TransportEvent::PeerConnected {
                peer,
                status: ConnectionStatus::Tcp,
            })
            .is_err()
        {
            return;
        }

        let (reader, writer) = stream.into_split();
        match pump(&ctx, &peer, &mut pending, &mut queue, reader, writer).await {
            PumpEnd::QueueClosed => return,
            PumpEnd::Disconnected(reason) => {
                debug!(peer = ?peer, reason = %reason, "Peer stream closed");
                if ctx
                    .events
                    .send(TransportEvent::PeerDisconnected { peer })
                    .is_err()
                {
                    return;
                }
                tokio::time::sleep(ctx.config.backoff(0)).await;
            }
        }
    }
}

async fn pump(
    ctx: &WorkerContext,
    peer: &PublicKey,
    pending: &mut Option<PeerPacket>,
    queue: &mut mpsc::UnboundedReceiver<PeerPacket>,
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
) -> PumpEnd {
    let mut peek = [0u8; 1];
    loop {
        let packet = match pending.take() {
            Some(packet) => packet,
            None => tokio::select! {
                next = queue.recv() => match next {
                    Some(packet) => packet,
                    None => return PumpEnd::QueueClosed,
                },
                // Nothing is expected on our dialed stream after the ack;
                // any read result means the peer hung up or misbehaved.
                _ = reader.read(&mut peek) => {
                    return PumpEnd::Disconnected("peer closed stream".into());
                }
            },
        };

        let framed = match packet.to_packet() {
            Ok(framed) => framed,
            Err(e) => {
                warn!(peer = ?peer, error = %e, "Dropping unencodable packet");
                let _ = ctx.events.send(TransportEvent::SendFailed {
                    to: *peer,
                    packet,
                    error: e.to_string(),
                });
                continue;
            }
        };

        if let Err(e) = write_packet(&mut writer, &framed).await {
            *pending = Some(packet);
            return PumpEnd::Disconnected(e.to_string());
        }
    }
}

fn random_nonce() -> [u8; 32] {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Dial `peer`'s onion service and complete the handshake.
async fn dial(ctx: &WorkerContext, peer: &PublicKey) -> Result<TcpStream> {
    let target = OnionAddress::for_peer(peer);
    let mut stream = ctx.session.connect(&target, ctx.config.peer_port).await?;

    let me = ctx.identity.public_key();
    let nonce = random_nonce();
    let timestamp = chrono::Utc::now().timestamp();
    let transcript = handshake_transcript(HELLO_ROLE, me.as_bytes(), peer.as_bytes(), &nonce, timestamp);
    let hello = PeerPacket::Hello(HelloPayload {
        public_key: *me.as_bytes(),
        target: *peer.as_bytes(),
        nonce,
        timestamp,
        signature: ctx.identity.sign(&transcript).to_bytes(),
    });

    let exchange = async {
        write_packet(&mut stream, &hello.to_packet()?).await?;
        let reply = read_packet(&mut stream).await?;
        match PeerPacket::from_packet(&reply)? {
            PeerPacket::HelloAck(ack) => verify_ack(&ack, &me, peer, &nonce, timestamp)?,
            other => {
                return Err(Error::Protocol(format!(
                    "expected HELLO_ACK, got {:?}",
                    other.packet_type()
                )))
            }
        }
        Ok::<(), Error>(())
    };

    tokio::time::timeout(ctx.config.handshake_timeout, exchange)
        .await
        .map_err(|_| Error::Timeout)??;

    debug!(peer = ?peer, "Outbound peer handshake complete");
    Ok(stream)
}

fn verify_ack(
    ack: &HelloAckPayload,
    me: &PublicKey,
    peer: &PublicKey,
    nonce: &[u8; 32],
    timestamp: i64,
) -> Result<()> {
    if &ack.public_key != peer.as_bytes() {
        return Err(Error::Protocol("HELLO_ACK from unexpected key".into()));
    }
    let transcript = handshake_transcript(ACK_ROLE, me.as_bytes(), peer.as_bytes(), nonce, timestamp);
    OnionIdentity::verify(peer, &transcript, &Signature::from_bytes(&ack.signature))
}

/// Check a HELLO addressed to `me`; returns the initiator's key.
fn verify_hello(hello: &HelloPayload, me: &PublicKey, max_skew: Duration) -> Result<PublicKey> {
    if &hello.target != me.as_bytes() {
        return Err(Error::Protocol("HELLO for another key".into()));
    }
    let skew = (chrono::Utc::now().timestamp() - hello.timestamp).unsigned_abs();
    if skew > max_skew.as_secs() {
        return Err(Error::Protocol(format!("HELLO timestamp off by {}s", skew)));
    }
    let initiator = PublicKey::from_bytes(hello.public_key);
    let transcript = handshake_transcript(
        HELLO_ROLE,
        &hello.public_key,
        &hello.target,
        &hello.nonce,
        hello.timestamp,
    );
    OnionIdentity::verify(&initiator, &transcript, &Signature::from_bytes(&hello.signature))?;
    Ok(initiator)
}

/// Authenticate an accepted stream, then forward its packets.
async fn serve_inbound(ctx: Arc<WorkerContext>, connection: IncomingConnection) {
    let IncomingConnection {
        mut stream,
        reporter,
        ..
    } = connection;
    let me = ctx.identity.public_key();

    let hello = match tokio::time::timeout(ctx.config.handshake_timeout, read_packet(&mut stream)).await {
        Ok(Ok(packet)) => packet,
        Ok(Err(e)) => {
            debug!(error = %e, "Dropping inbound stream before HELLO");
            return;
        }
        Err(_) => {
            debug!("Inbound HELLO timed out");
            return;
        }
    };

    let hello = match PeerPacket::from_packet(&hello) {
        Ok(PeerPacket::Hello(hello)) => hello,
        _ => {
            debug!("Inbound stream did not open with HELLO");
            return;
        }
    };

    let peer = match verify_hello(&hello, &me, ctx.config.max_clock_skew) {
        Ok(peer) => peer,
        Err(e) => {
            debug!(error = %e, "Rejected inbound HELLO");
            return;
        }
    };

    let transcript = handshake_transcript(ACK_ROLE, peer.as_bytes(), me.as_bytes(), &hello.nonce, hello.timestamp);
    let ack = PeerPacket::HelloAck(HelloAckPayload {
        public_key: *me.as_bytes(),
        signature: ctx.identity.sign(&transcript).to_bytes(),
    });
    let written = match ack.to_packet() {
        Ok(framed) => write_packet(&mut stream, &framed).await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        debug!(peer = ?peer, error = %e, "Failed to answer HELLO");
        return;
    }
    reporter.response_sent();
    debug!(peer = ?peer, "Inbound peer handshake complete");

    loop {
        let framed = match read_packet(&mut stream).await {
            Ok(framed) => framed,
            Err(e) => {
                debug!(peer = ?peer, error = %e, "Inbound stream ended");
                break;
            }
        };
        let packet = match PeerPacket::from_packet(&framed) {
            Ok(packet) if !packet.is_handshake() => packet,
            Ok(_) => continue,
            Err(e) => {
                debug!(peer = ?peer, error = %e, "Dropping malformed packet");
                continue;
            }
        };
        if ctx
            .events
            .send(TransportEvent::Inbound { from: peer, packet })
            .is_err()
        {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_hello(from: &OnionIdentity, to: &PublicKey, timestamp: i64) -> HelloPayload {
        let nonce = random_nonce();
        let me = from.public_key();
        let transcript = handshake_transcript(HELLO_ROLE, me.as_bytes(), to.as_bytes(), &nonce, timestamp);
        HelloPayload {
            public_key: *me.as_bytes(),
            target: *to.as_bytes(),
            nonce,
            timestamp,
            signature: from.sign(&transcript).to_bytes(),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = TransportConfig::default();
        assert_eq!(config.backoff(0), Duration::from_secs(2));
        assert_eq!(config.backoff(1), Duration::from_secs(4));
        assert_eq!(config.backoff(4), Duration::from_secs(32));
        assert_eq!(config.backoff(5), Duration::from_secs(60));
        assert_eq!(config.backoff(40), Duration::from_secs(60));
    }

    #[test]
    fn test_hello_verification() {
        let alice = OnionIdentity::generate();
        let bob = OnionIdentity::generate();
        let skew = Duration::from_secs(600);
        let now = chrono::Utc::now().timestamp();

        let hello = signed_hello(&alice, &bob.public_key(), now);
        assert_eq!(verify_hello(&hello, &bob.public_key(), skew).expect("valid"), alice.public_key());

        // Addressed to someone else.
        let carol = OnionIdentity::generate();
        assert!(verify_hello(&hello, &carol.public_key(), skew).is_err());

        // Stale.
        let stale = signed_hello(&alice, &bob.public_key(), now - 3600);
        assert!(verify_hello(&stale, &bob.public_key(), skew).is_err());

        // Tampered.
        let mut forged = signed_hello(&alice, &bob.public_key(), now);
        forged.nonce[0] ^= 1;
        assert!(verify_hello(&forged, &bob.public_key(), skew).is_err());
    }

    #[test]
    fn test_ack_verification() {
        let alice = OnionIdentity::generate();
        let bob = OnionIdentity::generate();
        let nonce = random_nonce();
        let ts = chrono::Utc::now().timestamp();
        let (a, b) = (alice.public_key(), bob.public_key());

        let transcript = handshake_transcript(ACK_ROLE, a.as_bytes(), b.as_bytes(), &nonce, ts);
        let ack = HelloAckPayload {
            public_key: *b.as_bytes(),
            signature: bob.sign(&transcript).to_bytes(),
        };
        assert!(verify_ack(&ack, &a, &b, &nonce, ts).is_ok());

        // A HELLO signature cannot stand in for the ack.
        let hello_sig = bob.sign(&handshake_transcript(HELLO_ROLE, a.as_bytes(), b.as_bytes(), &nonce, ts));
        let replayed = HelloAckPayload {
            public_key: *b.as_bytes(),
            signature: hello_sig.to_bytes(),
        };
        assert!(verify_ack(&replayed, &a, &b, &nonce, ts).is_err());
    }
}
