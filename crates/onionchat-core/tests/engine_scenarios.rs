//! End-to-end engine scenarios over the in-memory transport.
//!
//! Every engine gets its own endpoint on a shared [`MemoryHub`], so the
//! friend protocol runs exactly as it would over Tor, minus the latency.

use onionchat_core::events::{ChatEvent, EventBus};
use onionchat_core::messaging::{
    ChatEngine, ConnectionStatus, EngineConfig, MessageKind, MessageStatus, MODEL_FILE_NAME,
    RECORD_MODEL_FILE_NAME,
};
use onionchat_core::transport::MemoryHub;
use onionchat_core::Error;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(5);

struct Node {
    engine: ChatEngine,
    events: broadcast::Receiver<ChatEvent>,
    _dir: TempDir,
}

impl Node {
    fn start(hub: &MemoryHub, save_data: Option<&str>) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let config = EngineConfig {
            download_dir: dir.path().join("downloads"),
            temp_dir: dir.path().join("outgoing"),
            status_interval: Duration::from_millis(50),
            typing_timeout: Duration::from_millis(300),
            housekeeping_interval: Duration::from_millis(50),
            chunk_size: 1024,
            chunk_window: 4,
            ..EngineConfig::default()
        };
        let bus = EventBus::default();
        let events = bus.subscribe();
        let hub = hub.clone();
        let engine = ChatEngine::start(save_data, config, bus, move |identity| {
            hub.attach(identity.public_key())
        })
        .expect("engine");
        Self {
            engine,
            events,
            _dir: dir,
        }
    }

    fn key(&self) -> String {
        self.engine.get_tox_public_key()
    }

    /// Wait for the first event `pick` maps to `Some`, skipping the rest.
    async fn expect<T>(&mut self, mut pick: impl FnMut(&ChatEvent) -> Option<T>) -> T {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .expect("event before deadline")
                .expect("bus open");
            if let Some(found) = pick(&event) {
                return found;
            }
        }
    }

    async fn expect_friend_online(&mut self, friend: &str, online: bool) {
        self.expect(|e| match e {
            ChatEvent::DidUpdateFriendOnlineStatus {
                public_key,
                is_online,
            } if public_key == friend && *is_online == online => Some(()),
            _ => None,
        })
        .await
    }

    async fn expect_status(&mut self, id: i32, status: MessageStatus) {
        self.expect(|e| match e {
            ChatEvent::DidUpdateMessageStatus {
                message_id,
                status: s,
                ..
            } if *message_id == id && *s == status => Some(()),
            _ => None,
        })
        .await
    }
}

/// Start two engines and make them friends.
async fn befriended_pair(hub: &MemoryHub) -> (Node, Node) {
    let mut alice = Node::start(hub, None);
    let mut bob = Node::start(hub, None);

    let number = alice
        .engine
        .add_friend(&bob.engine.get_tox_address(), "{\"name\":\"alice\"}")
        .await
        .expect("add friend");
    assert_eq!(number, 0);

    let alice_key = alice.key();
    let message = bob
        .expect(|e| match e {
            ChatEvent::DidInitiateChat {
                public_key,
                message,
            } if *public_key == alice_key => Some(message.clone()),
            _ => None,
        })
        .await;
    assert_eq!(message, "{\"name\":\"alice\"}");

    let confirmed = bob
        .engine
        .confirm_friend_request(&alice.key())
        .await
        .expect("confirm");
    assert_eq!(confirmed, alice.key());

    let bob_key = bob.key();
    alice.expect_friend_online(&bob_key, true).await;
    bob.expect_friend_online(&alice_key, true).await;
    (alice, bob)
}

#[tokio::test]
async fn test_add_send_delete_lifecycle() {
    let hub = MemoryHub::new();
    let alice = Node::start(&hub, None);
    let bob_address = onionchat_core::identity::PeerAddress::new(
        onionchat_core::identity::OnionIdentity::generate().public_key(),
        onionchat_core::identity::Nospam::generate(),
    )
    .to_hex();
    let bob_key = ChatEngine::get_tox_public_key_from(&bob_address).expect("valid address");

    assert_eq!(alice.engine.add_friend(&bob_address, "hi").await.expect("add"), 0);
    assert_eq!(alice.engine.add_friend(&bob_address, "hi").await.expect("add"), 0);
    assert_eq!(alice.engine.friend_number(&bob_key).await.expect("call"), Some(0));
    assert_eq!(
        alice.engine.friend_connection_status(&bob_key).await.expect("status"),
        ConnectionStatus::None
    );

    let id = alice
        .engine
        .send_message(&bob_key, "queued until accepted", MessageKind::Normal)
        .await
        .expect("send");
    assert_eq!(id, 1);

    assert!(alice.engine.delete_friend(&bob_key).await.expect("delete"));
    assert!(!alice.engine.delete_friend(&bob_key).await.expect("delete"));
    assert_eq!(alice.engine.friend_number(&bob_key).await.expect("call"), None);
    assert_eq!(
        alice.engine.friend_connection_status(&bob_key).await.expect("status"),
        ConnectionStatus::None
    );
}

#[tokio::test]
async fn test_request_accept_message_receipt() {
    let hub = MemoryHub::new();
    let (mut alice, mut bob) = befriended_pair(&hub).await;

    assert_eq!(
        alice.engine.friend_connection_status(&bob.key()).await.expect("status"),
        ConnectionStatus::Tcp
    );

    let id = alice
        .engine
        .send_message(&bob.key(), "hello bob", MessageKind::Normal)
        .await
        .expect("send");

    let alice_key = alice.key();
    let (text, kind) = bob
        .expect(|e| match e {
            ChatEvent::DidReceiveMessage {
                public_key,
                text,
                kind,
                ..
            } if *public_key == alice_key => Some((text.clone(), *kind)),
            _ => None,
        })
        .await;
    assert_eq!(text, "hello bob");
    assert_eq!(kind, MessageKind::Normal);

    alice.expect_status(id, MessageStatus::Sent).await;
    let bob_key = bob.key();
    alice
        .expect(|e| match e {
            ChatEvent::DidUpdateFriendReadReceipt {
                public_key,
                message_id,
            } if *public_key == bob_key && *message_id == id => Some(()),
            _ => None,
        })
        .await;
    alice.expect_status(id, MessageStatus::Read).await;
}

#[tokio::test]
async fn test_messages_arrive_in_send_order() {
    let hub = MemoryHub::new();
    let (alice, mut bob) = befriended_pair(&hub).await;

    let texts: Vec<String> = (0..10).map(|i| format!("message {}", i)).collect();
    let mut ids = Vec::new();
    for text in &texts {
        ids.push(
            alice
                .engine
                .send_message(&bob.key(), text, MessageKind::Action)
                .await
                .expect("send"),
        );
    }
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    let mut received = Vec::new();
    while received.len() < texts.len() {
        let text = bob
            .expect(|e| match e {
                ChatEvent::DidReceiveMessage { text, .. } => Some(text.clone()),
                _ => None,
            })
            .await;
        received.push(text);
    }
    assert_eq!(received, texts);
}

#[tokio::test]
async fn test_large_backlog_flushes_without_stalling() {
    let hub = MemoryHub::new();
    let (mut alice, bob) = befriended_pair(&hub).await;
    let bob_key = bob.key();
    let bob_public = onionchat_core::identity::PublicKey::from_hex(&bob_key).expect("key");

    hub.set_offline(bob_public);
    alice.expect_friend_online(&bob_key, false).await;

    let mut last = 0;
    for i in 0..1500 {
        last = alice
            .engine
            .send_message(&bob_key, &format!("backlog {}", i), MessageKind::Normal)
            .await
            .expect("queue");
    }

    hub.set_online(bob_public);

    // Thousands of status events overflow the bus; only the final read matters.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        match tokio::time::timeout_at(deadline, alice.events.recv())
            .await
            .expect("last message read before deadline")
        {
            Ok(ChatEvent::DidUpdateMessageStatus {
                message_id,
                status: MessageStatus::Read,
                ..
            }) if message_id == last => break,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => panic!("bus closed"),
        }
    }

    let status = tokio::time::timeout(Duration::from_secs(3), alice.engine.friends_status())
        .await
        .expect("engine still answers")
        .expect("status");
    assert_eq!(status.get(&bob_key), Some(&true));
}

#[tokio::test]
async fn test_pending_request_needs_confirmation() {
    let hub = MemoryHub::new();
    let alice = Node::start(&hub, None);
    let mut bob = Node::start(&hub, None);

    alice
        .engine
        .add_friend(&bob.engine.get_tox_address(), "hello")
        .await
        .expect("add");
    bob.expect(|e| matches!(e, ChatEvent::DidInitiateChat { .. }).then_some(()))
        .await;

    assert_eq!(
        bob.engine.pending_requests().await.expect("pending"),
        vec![(alice.key(), "hello".to_string())]
    );
    assert_eq!(bob.engine.friend_number(&alice.key()).await.expect("call"), None);
    assert!(matches!(
        bob.engine
            .send_message(&alice.key(), "too early", MessageKind::Normal)
            .await,
        Err(Error::FriendNotFound)
    ));
}

#[tokio::test]
async fn test_wrong_nospam_is_dropped() {
    let hub = MemoryHub::new();
    let alice = Node::start(&hub, None);
    let bob = Node::start(&hub, None);

    // Same key, different nospam.
    let real = bob.engine.get_tox_address();
    let key = onionchat_core::identity::PublicKey::from_hex(&real[..64]).expect("key");
    let forged = onionchat_core::identity::PeerAddress::new(
        key,
        onionchat_core::identity::Nospam::from_bytes([0xde, 0xad, 0xbe, 0xef]),
    );
    assert_ne!(forged.to_hex(), real);

    alice.engine.add_friend(&forged.to_hex(), "hi").await.expect("add");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(bob.engine.pending_requests().await.expect("pending").is_empty());
}

#[tokio::test]
async fn test_state_blob_restores_identity_and_friends() {
    let hub = MemoryHub::new();
    let (alice, bob) = befriended_pair(&hub).await;

    let blob = alice.engine.tox_state_as_string().await.expect("save");
    let address = alice.engine.get_tox_address();
    alice.engine.shutdown().await;

    let restored = Node::start(&MemoryHub::new(), Some(&blob));
    assert_eq!(restored.engine.get_tox_address(), address);
    assert_eq!(
        restored.engine.friend_number(&bob.key()).await.expect("call"),
        Some(0)
    );
    assert_eq!(
        restored.engine.tox_state_as_string().await.expect("save"),
        blob
    );
}

#[tokio::test]
async fn test_periodic_status_check() {
    let hub = MemoryHub::new();
    let (alice, bob) = befriended_pair(&hub).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<HashMap<String, bool>>();
    alice
        .engine
        .start_periodic_friend_status_check(move |status| {
            let _ = tx.send(status);
        })
        .await;

    for _ in 0..2 {
        let status = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("status before deadline")
            .expect("callback alive");
        assert_eq!(status.get(&bob.key()), Some(&true));
    }

    alice.engine.stop_periodic_friend_status_check().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    while rx.try_recv().is_ok() {}
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_transport_stop_fails_queued_messages() {
    let hub = MemoryHub::new();
    let (mut alice, bob) = befriended_pair(&hub).await;
    let bob_key = bob.key();

    hub.set_offline(onionchat_core::identity::PublicKey::from_hex(&bob_key).expect("key"));
    alice.expect_friend_online(&bob_key, false).await;

    let id = alice
        .engine
        .send_message(&bob_key, "stuck", MessageKind::Normal)
        .await
        .expect("send");

    let alice_key = onionchat_core::identity::PublicKey::from_hex(&alice.key()).expect("key");
    hub.set_offline(alice_key);
    alice.expect_status(id, MessageStatus::Error).await;
    alice
        .expect(|e| {
            matches!(e, ChatEvent::DidUpdateMyOnlineStatus { is_online: false }).then_some(())
        })
        .await;

    hub.set_online(alice_key);
    alice
        .expect(|e| {
            matches!(e, ChatEvent::DidUpdateMyOnlineStatus { is_online: true }).then_some(())
        })
        .await;
}

#[tokio::test]
async fn test_typing_indicator_expires() {
    let hub = MemoryHub::new();
    let (alice, mut bob) = befriended_pair(&hub).await;

    alice
        .engine
        .set_user_is_typing(true, &bob.key())
        .await
        .expect("typing");
    let alice_key = alice.key();
    bob.expect(|e| match e {
        ChatEvent::IsTyping {
            public_key,
            is_typing: true,
        } if *public_key == alice_key => Some(()),
        _ => None,
    })
    .await;

    // Never cleared by alice; bob's timeout clears it.
    bob.expect(|e| match e {
        ChatEvent::IsTyping {
            public_key,
            is_typing: false,
        } if *public_key == alice_key => Some(()),
        _ => None,
    })
    .await;
}

#[tokio::test]
async fn test_presence_follows_self_status() {
    let hub = MemoryHub::new();
    let (alice, mut bob) = befriended_pair(&hub).await;
    let alice_key = alice.key();

    alice.engine.set_self_status(false).await.expect("status");
    bob.expect_friend_online(&alice_key, false).await;
    assert_eq!(
        bob.engine.friends_status().await.expect("status").get(&alice_key),
        Some(&false)
    );

    alice.engine.set_self_status(true).await.expect("status");
    bob.expect_friend_online(&alice_key, true).await;
}

#[tokio::test]
async fn test_file_bundle_transfer() {
    let hub = MemoryHub::new();
    let (mut alice, mut bob) = befriended_pair(&hub).await;

    let source = TempDir::new().expect("tempdir");
    let photo = source.path().join("photo.jpg");
    let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&photo, &data).expect("write");

    let model = serde_json::json!({ "id": "record-1", "kind": "photo" });
    let record_model = serde_json::json!({ "title": "holiday" });
    let id = alice
        .engine
        .send_file(
            &alice.key(),
            &bob.key(),
            model.clone(),
            Some(record_model.clone()),
            vec![photo],
        )
        .await
        .expect("send file");

    let alice_key = alice.key();
    let dir: PathBuf = bob
        .expect(|e| match e {
            ChatEvent::DidUpdateFileReceive {
                public_key,
                progress: 100,
                file_path: Some(path),
            } if *public_key == alice_key => Some(path.clone()),
            _ => None,
        })
        .await;

    assert_eq!(std::fs::read(dir.join("photo.jpg")).expect("photo"), data);
    let received_model: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.join(MODEL_FILE_NAME)).expect("model"))
            .expect("json");
    assert_eq!(received_model, model);
    let received_record: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.join(RECORD_MODEL_FILE_NAME)).expect("record"))
            .expect("json");
    assert_eq!(received_record, record_model);

    alice
        .expect(|e| match e {
            ChatEvent::DidUpdateFileSend {
                progress: 100,
                message_id,
                ..
            } if *message_id == id => Some(()),
            _ => None,
        })
        .await;
}

#[tokio::test]
async fn test_file_with_missing_source_reports_error() {
    let hub = MemoryHub::new();
    let (mut alice, bob) = befriended_pair(&hub).await;

    let id = alice
        .engine
        .send_file(
            &alice.key(),
            &bob.key(),
            serde_json::json!({}),
            None,
            vec![PathBuf::from("/nonexistent/onionchat/file.bin")],
        )
        .await
        .expect("send file");

    alice
        .expect(|e| match e {
            ChatEvent::DidUpdateFileErrorSend { message_id, .. } if *message_id == id => Some(()),
            _ => None,
        })
        .await;
}
