//! Peer transport seam between the engine and the network.
//!
//! The engine talks to a transport through a pair of channels: it sends
//! [`TransportCommand`]s and receives [`TransportEvent`]s. Two
//! implementations exist:
//!
//! - [`OnionPeerTransport`]: authenticated peer streams over Tor
//! - [`MemoryHub`]: an in-process loopback used for tests and demos
//!
//! Contract for every implementation: packets sent to the same peer are
//! delivered in the order they were sent.
//!
//! Both directions are unbounded. The engine and a transport each wait on
//! the other's queue, so a bounded pair can wedge once both fill up.

mod memory;
mod onion;

pub use memory::MemoryHub;
pub use onion::{OnionPeerTransport, TransportConfig};

use crate::identity::PublicKey;
use crate::messaging::ConnectionStatus;
use crate::protocol::PeerPacket;
use tokio::sync::mpsc;

/// Requests from the engine.
#[derive(Debug, Clone)]
pub enum TransportCommand {
    /// Keep trying to reach this peer.
    Connect(PublicKey),
    /// Stop reaching this peer and drop its queue.
    Disconnect(PublicKey),
    /// Deliver a packet, connecting first if needed.
    Send {
        /// Recipient.
        to: PublicKey,
        /// Packet.
        packet: PeerPacket,
    },
    /// Tear everything down.
    Shutdown,
}

/// Notifications to the engine.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The network is usable.
    Ready,
    /// The network went away; queued deliveries are cancelled.
    Stopped,
    /// An authenticated stream to the peer is up.
    PeerConnected {
        /// Peer.
        peer: PublicKey,
        /// How it is reached.
        status: ConnectionStatus,
    },
    /// The stream to the peer closed.
    PeerDisconnected {
        /// Peer.
        peer: PublicKey,
    },
    /// A packet arrived from an authenticated peer.
    Inbound {
        /// Sender.
        from: PublicKey,
        /// Packet.
        packet: PeerPacket,
    },
    /// A packet could not be delivered.
    SendFailed {
        /// Intended recipient.
        to: PublicKey,
        /// The packet.
        packet: PeerPacket,
        /// Why.
        error: String,
    },
}

/// Engine side of a transport.
#[derive(Debug)]
pub struct TransportHandle {
    /// Command sink.
    pub commands: mpsc::UnboundedSender<TransportCommand>,
    /// Event source.
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Transport side of a transport.
#[derive(Debug)]
pub struct TransportEndpoint {
    /// Command source.
    pub commands: mpsc::UnboundedReceiver<TransportCommand>,
    /// Event sink.
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportHandle {
    /// Create a connected handle/endpoint pair.
    pub fn channel() -> (TransportHandle, TransportEndpoint) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            TransportHandle {
                commands: cmd_tx,
                events: event_rx,
            },
            TransportEndpoint {
                commands: cmd_rx,
                events: event_tx,
            },
        )
    }
}
