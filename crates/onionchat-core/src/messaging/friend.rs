//! Friend table.
//!
//! Keyed by public key; friend numbers are small integers handed out from 0,
//! reusing the lowest free slot after a deletion.

use super::message::Message;
use crate::identity::{Nospam, PublicKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Instant;

/// Transport-level reachability of a friend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// Not reachable.
    None,
    /// Reachable over a TCP (Tor) stream.
    Tcp,
    /// Reachable over UDP. Never produced over Tor.
    Udp,
}

impl ConnectionStatus {
    /// `none` maps to offline, anything else to online.
    pub fn is_connected(self) -> bool {
        !matches!(self, ConnectionStatus::None)
    }
}

/// Relationship state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FriendState {
    /// We sent a request and wait for the accept.
    PendingOutbound,
    /// Both sides agreed.
    Established,
}

/// One friend entry.
#[derive(Debug)]
pub struct Friend {
    /// Long-term identity.
    pub public_key: PublicKey,
    /// Engine-local handle.
    pub friend_number: u32,
    /// Relationship state.
    pub state: FriendState,
    /// Request to (re)send while pending.
    pub request: Option<OutboundRequest>,
    /// Whether the transport currently reaches this friend.
    pub transport_connected: bool,
    /// Presence the friend last announced.
    pub announced_online: bool,
    /// Typing flag with its expiry.
    pub typing_until: Option<Instant>,
    /// Own messages not yet handed to the transport, oldest first.
    pub outbox: VecDeque<Message>,
    /// Own messages handed to the transport and awaiting a receipt.
    pub awaiting_receipt: HashMap<i32, Message>,
    /// Last online value reported to subscribers.
    pub reported_online: bool,
}

/// A friend request we keep resending until it is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    /// Nospam from the address we were given.
    pub nospam: Nospam,
    /// Greeting.
    pub message: String,
}

impl Friend {
    fn new(public_key: PublicKey, friend_number: u32, state: FriendState) -> Self {
        Self {
            public_key,
            friend_number,
            state,
            request: None,
            transport_connected: false,
            announced_online: true,
            typing_until: None,
            outbox: VecDeque::new(),
            awaiting_receipt: HashMap::new(),
            reported_online: false,
        }
    }

    /// Connection status as the engine reports it.
    pub fn connection_status(&self) -> ConnectionStatus {
        if self.transport_connected && self.state == FriendState::Established {
            ConnectionStatus::Tcp
        } else {
            ConnectionStatus::None
        }
    }

    /// Online means connected and not announced away.
    pub fn is_online(&self) -> bool {
        self.connection_status().is_connected() && self.announced_online
    }

    /// Whether queued messages may be handed to the transport.
    pub fn can_deliver(&self) -> bool {
        self.connection_status().is_connected()
    }

    /// Current typing flag.
    pub fn is_typing(&self, now: Instant) -> bool {
        self.typing_until.map_or(false, |until| until > now)
    }
}

/// All friends, by key and by number.
#[derive(Debug, Default)]
pub struct FriendTable {
    friends: HashMap<PublicKey, Friend>,
    used_numbers: BTreeSet<u32>,
}

impl FriendTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn lowest_free_number(&self) -> u32 {
        let mut candidate = 0;
        for &used in &self.used_numbers {
            if used != candidate {
                break;
            }
            candidate += 1;
        }
        candidate
    }

    /// Insert a friend, or return the existing number if already present.
    ///
    /// The boolean is `true` when a new entry was created.
    pub fn insert(&mut self, public_key: PublicKey, state: FriendState) -> (u32, bool) {
        if let Some(existing) = self.friends.get(&public_key) {
            return (existing.friend_number, false);
        }
        let number = self.lowest_free_number();
        self.insert_with_number(public_key, number, state);
        (number, true)
    }

    /// Insert with a known number (restoring saved state).
    pub fn insert_with_number(&mut self, public_key: PublicKey, number: u32, state: FriendState) {
        self.used_numbers.insert(number);
        self.friends
            .insert(public_key, Friend::new(public_key, number, state));
    }

    /// Remove a friend, freeing its number.
    pub fn remove(&mut self, public_key: &PublicKey) -> Option<Friend> {
        let friend = self.friends.remove(public_key)?;
        self.used_numbers.remove(&friend.friend_number);
        Some(friend)
    }

    /// Look up by key.
    pub fn get(&self, public_key: &PublicKey) -> Option<&Friend> {
        self.friends.get(public_key)
    }

    /// Look up by key, mutably.
    pub fn get_mut(&mut self, public_key: &PublicKey) -> Option<&mut Friend> {
        self.friends.get_mut(public_key)
    }

    /// Whether a number is taken.
    pub fn number_in_use(&self, number: u32) -> bool {
        self.used_numbers.contains(&number)
    }

    /// Whether the key is a friend.
    pub fn contains(&self, public_key: &PublicKey) -> bool {
        self.friends.contains_key(public_key)
    }

    /// All friends, in friend-number order.
    pub fn iter(&self) -> impl Iterator<Item = &Friend> {
        let mut all: Vec<&Friend> = self.friends.values().collect();
        all.sort_by_key(|f| f.friend_number);
        all.into_iter()
    }

    /// All friends, mutably, in arbitrary order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Friend> {
        self.friends.values_mut()
    }

    /// Number of friends.
    pub fn len(&self) -> usize {
        self.friends.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.friends.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> PublicKey {
        PublicKey::from_bytes([b; 32])
    }

    #[test]
    fn test_numbers_start_at_zero_and_insert_is_idempotent() {
        let mut table = FriendTable::new();
        assert_eq!(table.insert(key(1), FriendState::Established), (0, true));
        assert_eq!(table.insert(key(2), FriendState::PendingOutbound), (1, true));
        assert_eq!(table.insert(key(1), FriendState::PendingOutbound), (0, false));
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.get(&key(1)).expect("friend").state,
            FriendState::Established
        );
    }

    #[test]
    fn test_lowest_free_number_reused() {
        let mut table = FriendTable::new();
        table.insert(key(1), FriendState::Established);
        table.insert(key(2), FriendState::Established);
        table.insert(key(3), FriendState::Established);

        assert!(table.remove(&key(2)).is_some());
        assert!(!table.number_in_use(1));
        assert_eq!(table.insert(key(4), FriendState::Established), (1, true));
        assert_eq!(table.insert(key(5), FriendState::Established), (3, true));
        assert!(table.remove(&key(9)).is_none());
    }

    #[test]
    fn test_connection_status_requires_established() {
        let mut table = FriendTable::new();
        table.insert(key(1), FriendState::PendingOutbound);
        let friend = table.get_mut(&key(1)).expect("friend");

        friend.transport_connected = true;
        assert_eq!(friend.connection_status(), ConnectionStatus::None);

        friend.state = FriendState::Established;
        assert_eq!(friend.connection_status(), ConnectionStatus::Tcp);
        assert!(friend.is_online());

        friend.announced_online = false;
        assert!(!friend.is_online());
        assert!(friend.can_deliver());
    }

    #[test]
    fn test_typing_expiry() {
        let mut table = FriendTable::new();
        table.insert(key(1), FriendState::Established);
        let friend = table.get_mut(&key(1)).expect("friend");
        let now = Instant::now();

        friend.typing_until = Some(now + std::time::Duration::from_secs(5));
        assert!(friend.is_typing(now));
        assert!(!friend.is_typing(now + std::time::Duration::from_secs(6)));
    }
}
