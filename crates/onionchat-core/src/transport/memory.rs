//! In-process loopback transport.
//!
//! Every endpoint attached to the same [`MemoryHub`] can reach every other
//! online endpoint. Connection state is tracked per direction, like the
//! onion transport: `a` seeing `b` as connected says nothing about `b`'s
//! view of `a`.

use super::{TransportCommand, TransportEndpoint, TransportEvent, TransportHandle};
use crate::identity::PublicKey;
use crate::messaging::ConnectionStatus;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, trace};

type Deliveries = Vec<(mpsc::UnboundedSender<TransportEvent>, TransportEvent)>;

struct Endpoint {
    events: mpsc::UnboundedSender<TransportEvent>,
    online: bool,
    wanted: HashSet<PublicKey>,
    connected: HashSet<PublicKey>,
}

#[derive(Default)]
struct HubState {
    endpoints: HashMap<PublicKey, Endpoint>,
}

impl HubState {
    fn is_online(&self, key: &PublicKey) -> bool {
        self.endpoints.get(key).map_or(false, |e| e.online)
    }

    /// Mark `to` connected in `from`'s view.
    fn link(&mut self, from: PublicKey, to: PublicKey, out: &mut Deliveries) {
        if from == to || !self.is_online(&from) || !self.is_online(&to) {
            return;
        }
        if let Some(endpoint) = self.endpoints.get_mut(&from) {
            if endpoint.connected.insert(to) {
                out.push((
                    endpoint.events.clone(),
                    TransportEvent::PeerConnected {
                        peer: to,
                        status: ConnectionStatus::Tcp,
                    },
                ));
            }
        }
    }

    fn unlink(&mut self, from: PublicKey, to: PublicKey, out: &mut Deliveries) {
        if let Some(endpoint) = self.endpoints.get_mut(&from) {
            if endpoint.connected.remove(&to) {
                out.push((
                    endpoint.events.clone(),
                    TransportEvent::PeerDisconnected { peer: to },
                ));
            }
        }
    }

    /// Connect everything that was waiting on `key`, and everything `key`
    /// was waiting on.
    fn relink(&mut self, key: PublicKey, out: &mut Deliveries) {
        let waiting: Vec<PublicKey> = self
            .endpoints
            .iter()
            .filter(|(_, e)| e.wanted.contains(&key))
            .map(|(k, _)| *k)
            .collect();
        for other in waiting {
            self.link(other, key, out);
        }
        let wanted: Vec<PublicKey> = self
            .endpoints
            .get(&key)
            .map(|e| e.wanted.iter().copied().collect())
            .unwrap_or_default();
        for other in wanted {
            self.link(key, other, out);
        }
    }

    fn take_offline(&mut self, key: PublicKey, out: &mut Deliveries) {
        let others: Vec<PublicKey> = self.endpoints.keys().copied().collect();
        for other in others {
            self.unlink(other, key, out);
        }
        if let Some(endpoint) = self.endpoints.get_mut(&key) {
            endpoint.online = false;
            endpoint.connected.clear();
            out.push((endpoint.events.clone(), TransportEvent::Stopped));
        }
    }
}

/// Loopback network shared by any number of engines. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    /// Empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        // A panic while holding the lock leaves the maps consistent enough
        // for a test network.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach an endpoint for `key`. It starts online and reports `Ready`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn attach(&self, key: PublicKey) -> TransportHandle {
        let (handle, endpoint) = TransportHandle::channel();
        let TransportEndpoint { commands, events } = endpoint;

        let mut out = Deliveries::new();
        {
            let mut state = self.lock();
            state.endpoints.insert(
                key,
                Endpoint {
                    events: events.clone(),
                    online: true,
                    wanted: HashSet::new(),
                    connected: HashSet::new(),
                },
            );
            out.push((events, TransportEvent::Ready));
            state.relink(key, &mut out);
        }
        debug!(peer = ?key, "Attached loopback endpoint");

        let hub = self.clone();
        deliver(out);
        tokio::spawn(async move { hub.command_loop(key, commands).await });
        handle
    }

    /// Take an endpoint offline: it sees `Stopped`, its peers see it
    /// disconnect, and packets to it fail until [`MemoryHub::set_online`].
    pub fn set_offline(&self, key: PublicKey) {
        let mut out = Deliveries::new();
        self.lock().take_offline(key, &mut out);
        deliver(out);
    }

    /// Bring an endpoint back: it sees `Ready` and pending connects resume.
    pub fn set_online(&self, key: PublicKey) {
        let mut out = Deliveries::new();
        {
            let mut state = self.lock();
            let Some(endpoint) = state.endpoints.get_mut(&key) else {
                return;
            };
            if endpoint.online {
                return;
            }
            endpoint.online = true;
            out.push((endpoint.events.clone(), TransportEvent::Ready));
            state.relink(key, &mut out);
        }
        deliver(out);
    }

    /// Whether `from` currently sees `to` as connected.
    pub fn is_connected(&self, from: &PublicKey, to: &PublicKey) -> bool {
        self.lock()
            .endpoints
            .get(from)
            .map_or(false, |e| e.connected.contains(to))
    }

    async fn command_loop(&self, key: PublicKey, mut commands: mpsc::UnboundedReceiver<TransportCommand>) {
        while let Some(command) = commands.recv().await {
            trace!(peer = ?key, ?command, "Loopback command");
            let mut out = Deliveries::new();
            let mut shutdown = false;
            {
                let mut state = self.lock();
                match command {
                    TransportCommand::Connect(peer) => {
                        if let Some(endpoint) = state.endpoints.get_mut(&key) {
                            endpoint.wanted.insert(peer);
                        }
                        state.link(key, peer, &mut out);
                    }
                    TransportCommand::Disconnect(peer) => {
                        if let Some(endpoint) = state.endpoints.get_mut(&key) {
                            endpoint.wanted.remove(&peer);
                        }
                        state.unlink(key, peer, &mut out);
                    }
                    TransportCommand::Send { to, packet } => {
                        if state.is_online(&key) && state.is_online(&to) {
                            state.link(key, to, &mut out);
                            if let Some(target) = state.endpoints.get(&to) {
                                out.push((
                                    target.events.clone(),
                                    TransportEvent::Inbound { from: key, packet },
                                ));
                            }
                        } else if let Some(endpoint) = state.endpoints.get(&key) {
                            out.push((
                                endpoint.events.clone(),
                                TransportEvent::SendFailed {
                                    to,
                                    packet,
                                    error: "peer unreachable".into(),
                                },
                            ));
                        }
                    }
                    TransportCommand::Shutdown => {
                        state.take_offline(key, &mut out);
                        shutdown = true;
                    }
                }
            }
            deliver(out);
            if shutdown {
                break;
            }
        }

        let mut out = Deliveries::new();
        {
            let mut state = self.lock();
            let others: Vec<PublicKey> = state.endpoints.keys().copied().collect();
            for other in others {
                state.unlink(other, key, &mut out);
            }
            state.endpoints.remove(&key);
        }
        deliver(out);
        debug!(peer = ?key, "Detached loopback endpoint");
    }
}

impl std::fmt::Debug for MemoryHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHub")
            .field("endpoints", &self.lock().endpoints.len())
            .finish()
    }
}

fn deliver(out: Deliveries) {
    for (tx, event) in out {
        let _ = tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PeerPacket, TypingPayload};
    use std::time::Duration;

    fn key(b: u8) -> PublicKey {
        PublicKey::from_bytes([b; 32])
    }

    async fn next(handle: &mut TransportHandle) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(2), handle.events.recv())
            .await
            .expect("timely event")
            .expect("open channel")
    }

    fn typing(is_typing: bool) -> PeerPacket {
        PeerPacket::Typing(TypingPayload { is_typing })
    }

    #[tokio::test]
    async fn test_connect_and_deliver_in_order() {
        let hub = MemoryHub::new();
        let mut a = hub.attach(key(1));
        let mut b = hub.attach(key(2));
        assert!(matches!(next(&mut a).await, TransportEvent::Ready));
        assert!(matches!(next(&mut b).await, TransportEvent::Ready));

        a.commands.send(TransportCommand::Connect(key(2))).expect("send");
        match next(&mut a).await {
            TransportEvent::PeerConnected { peer, status } => {
                assert_eq!(peer, key(2));
                assert_eq!(status, ConnectionStatus::Tcp);
            }
            other => panic!("unexpected {:?}", other),
        }

        for flag in [true, false] {
            a.commands
                .send(TransportCommand::Send {
                    to: key(2),
                    packet: typing(flag),
                })
                .expect("send");
        }
        for flag in [true, false] {
            match next(&mut b).await {
                TransportEvent::Inbound { from, packet } => {
                    assert_eq!(from, key(1));
                    assert_eq!(packet, typing(flag));
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(hub.is_connected(&key(1), &key(2)));
        assert!(!hub.is_connected(&key(2), &key(1)));
    }

    #[tokio::test]
    async fn test_send_to_missing_peer_fails() {
        let hub = MemoryHub::new();
        let mut a = hub.attach(key(1));
        next(&mut a).await;

        a.commands
            .send(TransportCommand::Send {
                to: key(9),
                packet: typing(true),
            })
            .expect("send");
        assert!(matches!(next(&mut a).await, TransportEvent::SendFailed { .. }));
    }

    #[tokio::test]
    async fn test_offline_and_back() {
        let hub = MemoryHub::new();
        let mut a = hub.attach(key(1));
        let mut b = hub.attach(key(2));
        next(&mut a).await;
        next(&mut b).await;

        a.commands.send(TransportCommand::Connect(key(2))).expect("send");
        assert!(matches!(next(&mut a).await, TransportEvent::PeerConnected { .. }));

        hub.set_offline(key(2));
        assert!(matches!(next(&mut a).await, TransportEvent::PeerDisconnected { .. }));
        assert!(matches!(next(&mut b).await, TransportEvent::Stopped));

        hub.set_online(key(2));
        assert!(matches!(next(&mut b).await, TransportEvent::Ready));
        assert!(matches!(next(&mut a).await, TransportEvent::PeerConnected { .. }));
    }
}
