//! CLI command implementations.

use anyhow::{bail, Context, Result};
use onionchat_core::{
    events::{ChatEvent, EventBus},
    identity::PublicKey,
    messaging::{ChatEngine, EngineConfig, MessageKind},
    tor::{HiddenServiceListener, ListenerConfig, TorConfig, TorService},
    transport::{OnionPeerTransport, TransportConfig, TransportHandle},
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Engine blob file inside the data directory.
const STATE_FILE: &str = "engine.state";

const HELP: &str = "\
Commands:
  /add <address> [message]     send a friend request
  /accept <public_key>         accept a friend request
  /requests                    list pending friend requests
  /friends                     list friends and their presence
  /msg <public_key> <text>     send a message
  /me <public_key> <text>      send an action
  /typing <public_key> on|off  tell a friend you are typing
  /status online|offline       set your presence
  /file <public_key> <path>... send files as one bundle
  /delete <public_key>         remove a friend
  /save                        write the engine state now
  /help                        show this help
  /quit                        save and exit";

/// Options for [`run`].
pub struct RunOptions {
    pub socks_port: u16,
    pub control_port: u16,
    pub service_port: u16,
    pub tor_binary: Option<String>,
}

fn state_path(data_dir: &str) -> PathBuf {
    Path::new(data_dir).join(STATE_FILE)
}

/// Read the saved engine blob, if any.
async fn load_state(data_dir: &str) -> Result<Option<String>> {
    let path = state_path(data_dir);
    match tokio::fs::read_to_string(&path).await {
        Ok(blob) => Ok(Some(blob)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Write the engine blob. It contains the secret key.
async fn save_state(engine: &ChatEngine, data_dir: &str) -> Result<()> {
    let blob = engine
        .tox_state_as_string()
        .await
        .context("Failed to serialize engine state")?;
    let path = state_path(data_dir);
    tokio::fs::write(&path, blob)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .await
            .context("Failed to restrict state file permissions")?;
    }
    Ok(())
}

/// Show our peer address, creating an identity on first run.
pub async fn show_address(data_dir: &str) -> Result<()> {
    tokio::fs::create_dir_all(data_dir)
        .await
        .context("Failed to create data directory")?;

    let saved = load_state(data_dir).await?;
    // No network here; the endpoint is dropped so the engine sees a dead transport.
    let (handle, _) = TransportHandle::channel();
    let engine = ChatEngine::start(
        saved.as_deref(),
        EngineConfig::default(),
        EventBus::default(),
        |_| handle,
    )
    .context("Failed to load engine state")?;

    if saved.is_none() {
        save_state(&engine, data_dir).await?;
        println!("\nGenerated new identity.");
    }

    println!("\nYour onionchat identity:");
    println!("  Address:    {}", engine.get_tox_address());
    println!("  Public key: {}", engine.get_tox_public_key());
    println!("\nShare the address with people who want to add you.");

    engine.shutdown().await;
    Ok(())
}

/// Print the public key embedded in a peer address.
pub fn parse_address(address: &str) -> Result<()> {
    match ChatEngine::get_tox_public_key_from(address) {
        Some(key) => {
            println!("{}", key);
            Ok(())
        }
        None => bail!("Not a valid peer address"),
    }
}

/// Connect to Tor and run the interactive session.
/// Bring the session up, then the engine on top of it.
///
/// The listener must already be bound. The engine is only started, and its
/// state only written, once Tor reports a usable session.
async fn start_node(
    data_dir: &str,
    saved: Option<&str>,
    tor: &TorService,
    listener: HiddenServiceListener,
    bus: EventBus,
) -> Result<ChatEngine> {
    tor.start().await.context("Failed to start Tor session")?;

    let engine_config = EngineConfig {
        download_dir: Path::new(data_dir).join("downloads"),
        temp_dir: Path::new(data_dir).join("outgoing"),
        ..EngineConfig::default()
    };
    let transport_tor = tor.clone();
    let engine = ChatEngine::start(saved, engine_config, bus, |identity| {
        OnionPeerTransport::spawn(
            identity.clone(),
            transport_tor,
            listener,
            TransportConfig::default(),
        )
    })
    .context("Failed to load engine state")?;
    save_state(&engine, data_dir).await?;
    Ok(engine)
}

pub async fn run(data_dir: &str, options: RunOptions) -> Result<()> {
    tokio::fs::create_dir_all(data_dir)
        .await
        .context("Failed to create data directory")?;
    let saved = load_state(data_dir).await?;

    let bus = EventBus::default();
    let printer = tokio::spawn(print_events(bus.subscribe()));

    let tor_config = TorConfig {
        working_dir: Path::new(data_dir).join("tor"),
        control_addr: format!("127.0.0.1:{}", options.control_port),
        socks_addr: SocketAddr::from(([127, 0, 0, 1], options.socks_port)),
        tor_binary: options.tor_binary.map(PathBuf::from),
        service_port: options.service_port,
        ..TorConfig::default()
    };
    let session_bus = bus.clone();
    let tor = TorService::with_state_action(tor_config, move |state| {
        session_bus.publish(ChatEvent::SessionState(state));
    });

    let server_bus = bus.clone();
    let listener = HiddenServiceListener::start(
        ListenerConfig {
            port: options.service_port,
            ..ListenerConfig::default()
        },
        move |state| {
            server_bus.publish(ChatEvent::ServerState(state));
        },
    )
    .await;

    println!("\nConnecting to Tor...");
    let engine = start_node(data_dir, saved.as_deref(), &tor, listener, bus.clone()).await?;
    println!("Your address: {}", engine.get_tox_address());
    println!("Connected. Type /help for commands.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read input")? else {
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match parse_input(line) {
                    Ok(Input::Quit) => break,
                    Ok(input) => {
                        if let Err(e) = execute(&engine, input, data_dir).await {
                            eprintln!("[ERROR] {:#}", e);
                        }
                    }
                    Err(e) => eprintln!("[ERROR] {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!("\nShutting down...");
    save_state(&engine, data_dir).await?;
    engine.shutdown().await;
    if let Err(e) = tor.stop().await {
        warn!(error = %e, "Tor session did not stop cleanly");
    }
    printer.abort();
    info!("Bye");
    Ok(())
}

/// A parsed interactive command.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Add { address: String, message: String },
    Accept(String),
    Requests,
    Friends,
    Message { to: String, text: String, kind: MessageKind },
    Typing { to: String, is_typing: bool },
    Status(bool),
    File { to: String, paths: Vec<PathBuf> },
    Delete(String),
    Save,
    Help,
    Quit,
}

fn parse_input(line: &str) -> Result<Input> {
    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };
    let (first, tail) = match rest.split_once(char::is_whitespace) {
        Some((first, tail)) => (first, tail.trim()),
        None => (rest, ""),
    };

    let input = match command {
        "/add" if !first.is_empty() => Input::Add {
            address: first.to_string(),
            message: if tail.is_empty() { "Hi!".to_string() } else { tail.to_string() },
        },
        "/accept" if !first.is_empty() => Input::Accept(first.to_string()),
        "/requests" => Input::Requests,
        "/friends" => Input::Friends,
        "/msg" | "/me" if !first.is_empty() && !tail.is_empty() => Input::Message {
            to: first.to_string(),
            text: tail.to_string(),
            kind: if command == "/me" { MessageKind::Action } else { MessageKind::Normal },
        },
        "/typing" if matches!(tail, "on" | "off") => Input::Typing {
            to: first.to_string(),
            is_typing: tail == "on",
        },
        "/status" if matches!(first, "online" | "offline") => Input::Status(first == "online"),
        "/file" if !first.is_empty() && !tail.is_empty() => Input::File {
            to: first.to_string(),
            paths: tail
                .split_whitespace()
                .map(|p| PathBuf::from(shellexpand::tilde(p).to_string()))
                .collect(),
        },
        "/delete" if !first.is_empty() => Input::Delete(first.to_string()),
        "/save" => Input::Save,
        "/help" => Input::Help,
        "/quit" | "/exit" => Input::Quit,
        _ => bail!("Unrecognized command, try /help"),
    };
    Ok(input)
}

/// Run one interactive command.
async fn execute(engine: &ChatEngine, input: Input, data_dir: &str) -> Result<()> {
    match input {
        Input::Add { address, message } => {
            let number = engine.add_friend(&address, &message).await?;
            save_state(engine, data_dir).await?;
            println!("Friend request queued (friend #{})", number);
        }
        Input::Accept(key) => {
            let key = engine.confirm_friend_request(&key).await?;
            save_state(engine, data_dir).await?;
            println!("Accepted {}", key);
        }
        Input::Requests => {
            let pending = engine.pending_requests().await?;
            if pending.is_empty() {
                println!("No pending requests");
            }
            for (key, message) in pending {
                println!("  {}  {}", key, message);
            }
        }
        Input::Friends => {
            let mut friends: Vec<(String, bool)> = engine.friends_status().await?.into_iter().collect();
            friends.sort();
            if friends.is_empty() {
                println!("No friends yet");
            }
            for (key, online) in friends {
                let number = engine.friend_number(&key).await?.unwrap_or_default();
                let presence = if online { "online" } else { "offline" };
                println!("  #{:<3} {}  {}", number, key, presence);
            }
        }
        Input::Message { to, text, kind } => {
            let id = engine.send_message(&to, &text, kind).await?;
            println!("Queued message {}", id);
        }
        Input::Typing { to, is_typing } => {
            engine.set_user_is_typing(is_typing, &to).await?;
        }
        Input::Status(is_online) => {
            engine.set_self_status(is_online).await?;
        }
        Input::File { to, paths } => {
            let names: Vec<String> = paths
                .iter()
                .filter_map(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .collect();
            let model = serde_json::json!({ "files": names });
            let id = engine
                .send_file(&engine.get_tox_public_key(), &to, model, None, paths)
                .await?;
            println!("Queued file transfer {}", id);
        }
        Input::Delete(key) => {
            if engine.delete_friend(&key).await? {
                save_state(engine, data_dir).await?;
                println!("Deleted {}", key);
            } else {
                println!("Not a friend: {}", key);
            }
        }
        Input::Save => {
            save_state(engine, data_dir).await?;
            println!("Saved");
        }
        Input::Help => println!("{}", HELP),
        Input::Quit => {}
    }
    Ok(())
}

/// Print bus events until the bus closes.
async fn print_events(mut events: broadcast::Receiver<ChatEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Some(line) = describe(&event) {
                    println!("{}", line);
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Event printer fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn short(key: &str) -> String {
    match key.parse::<PublicKey>() {
        Ok(key) => format!("{:?}", key),
        Err(_) => key.to_string(),
    }
}

/// One-line rendering of an event; `None` for events not worth printing.
fn describe(event: &ChatEvent) -> Option<String> {
    let line = match event {
        ChatEvent::DidReceiveMessage {
            public_key,
            text,
            kind,
            ..
        } => match kind {
            MessageKind::Normal => format!("<{}> {}", short(public_key), text),
            MessageKind::Action => format!("* {} {}", short(public_key), text),
        },
        ChatEvent::DidInitiateChat {
            public_key,
            message,
        } => format!(
            "[REQUEST] {} says: {}\n          /accept {}",
            short(public_key),
            message,
            public_key
        ),
        ChatEvent::DidUpdateMyOnlineStatus { is_online } => {
            format!("[INFO] You are {}", if *is_online { "online" } else { "offline" })
        }
        ChatEvent::SessionState(state) => format!("[TOR] {}", state),
        ChatEvent::DidUpdateFriendOnlineStatus {
            public_key,
            is_online,
        } => format!(
            "[INFO] {} is {}",
            short(public_key),
            if *is_online { "online" } else { "offline" }
        ),
        ChatEvent::IsTyping {
            public_key,
            is_typing: true,
        } => format!("[INFO] {} is typing...", short(public_key)),
        ChatEvent::IsTyping { .. } => return None,
        ChatEvent::DidUpdateFriendReadReceipt {
            public_key,
            message_id,
        } => format!("[INFO] {} read message {}", short(public_key), message_id),
        ChatEvent::DidUpdateMessageStatus { .. } => return None,
        ChatEvent::DidUpdateFileSend {
            public_key,
            progress,
            message_id,
        } => format!(
            "[FILE] transfer {} to {}: {}%",
            message_id,
            short(public_key),
            progress
        ),
        ChatEvent::DidUpdateFileErrorSend {
            public_key,
            message_id,
            error,
        } => format!(
            "[FILE] transfer {} to {} failed: {}",
            message_id,
            short(public_key),
            error
        ),
        ChatEvent::DidUpdateFileReceive {
            public_key,
            file_path: Some(path),
            ..
        } => format!("[FILE] received from {}: {}", short(public_key), path.display()),
        ChatEvent::DidUpdateFileReceive {
            public_key,
            progress,
            ..
        } => format!("[FILE] receiving from {}: {}%", short(public_key), progress),
        ChatEvent::ServerState(_) => return None,
    };
    Some(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_messages() {
        assert_eq!(
            parse_input("/msg ABCD hello there").expect("parse"),
            Input::Message {
                to: "ABCD".into(),
                text: "hello there".into(),
                kind: MessageKind::Normal,
            }
        );
        assert_eq!(
            parse_input("/me ABCD waves").expect("parse"),
            Input::Message {
                to: "ABCD".into(),
                text: "waves".into(),
                kind: MessageKind::Action,
            }
        );
        assert!(parse_input("/msg ABCD").is_err());
    }

    #[test]
    fn test_parse_add_defaults_greeting() {
        assert_eq!(
            parse_input("/add 1234").expect("parse"),
            Input::Add {
                address: "1234".into(),
                message: "Hi!".into(),
            }
        );
        assert!(parse_input("/add").is_err());
    }

    #[test]
    fn test_parse_flags() {
        assert_eq!(
            parse_input("/typing ABCD on").expect("parse"),
            Input::Typing {
                to: "ABCD".into(),
                is_typing: true,
            }
        );
        assert_eq!(parse_input("/status offline").expect("parse"), Input::Status(false));
        assert!(parse_input("/status away").is_err());
        assert!(parse_input("/typing ABCD maybe").is_err());
    }

    #[test]
    fn test_parse_file_paths() {
        assert_eq!(
            parse_input("/file ABCD a.txt b.txt").expect("parse"),
            Input::File {
                to: "ABCD".into(),
                paths: vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")],
            }
        );
    }

    #[test]
    fn test_unknown_command() {
        assert!(parse_input("hello").is_err());
        assert_eq!(parse_input("/quit").expect("parse"), Input::Quit);
    }

    #[test]
    fn test_describe_hides_noise() {
        assert!(describe(&ChatEvent::IsTyping {
            public_key: "AB".into(),
            is_typing: false,
        })
        .is_none());
        let line = describe(&ChatEvent::DidUpdateMyOnlineStatus { is_online: true }).expect("line");
        assert!(line.contains("online"));
    }

    #[tokio::test]
    async fn test_engine_waits_for_tor() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let data_dir = dir.path().to_str().expect("utf-8 path");
        let tor = TorService::new(TorConfig {
            working_dir: dir.path().join("tor"),
            control_addr: "127.0.0.1:1".into(),
            bootstrap_timeout: std::time::Duration::from_millis(200),
            poll_interval: std::time::Duration::from_millis(10),
            ..TorConfig::default()
        });
        let listener = HiddenServiceListener::start(
            ListenerConfig {
                port: 0,
                ..ListenerConfig::default()
            },
            |_| {},
        )
        .await;

        let result = start_node(data_dir, None, &tor, listener, EventBus::default()).await;

        assert!(result.is_err());
        assert!(!state_path(data_dir).exists());
    }
}
