//! Tor ControlPort client implementation.
//!
//! Communicates with Tor via the ControlPort protocol (control-spec.txt).
//! A background reader splits synchronous replies from asynchronous `650`
//! events so that subscribing to `CIRC` does not corrupt command replies.

use crate::error::{Error, Result};
use crate::logging::sanitize_for_log;
use std::fmt;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Status code Tor uses for asynchronous events.
const ASYNC_EVENT_CODE: u16 = 650;

/// Authentication method for Tor ControlPort.
#[derive(Clone)]
pub enum TorAuth {
    /// No authentication required.
    None,
    /// Cookie authentication (reads from file).
    Cookie(String),
    /// Password authentication.
    Password(String),
}

impl fmt::Debug for TorAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorAuth::None => write!(f, "None"),
            TorAuth::Cookie(path) => f.debug_tuple("Cookie").field(path).finish(),
            TorAuth::Password(_) => write!(f, "Password([REDACTED])"),
        }
    }
}

/// A complete synchronous reply.
#[derive(Debug)]
struct Reply {
    status: u16,
    lines: Vec<String>,
}

/// An asynchronous `650` event, e.g. `CIRC 12 BUILT ...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlEvent {
    /// Event keyword (`CIRC`, `STATUS_CLIENT`, ...).
    pub kind: String,
    /// All lines of the event, keyword included on the first.
    pub lines: Vec<String>,
}

impl ControlEvent {
    fn from_lines(lines: Vec<String>) -> Self {
        let kind = lines
            .first()
            .and_then(|l| l.split_whitespace().next())
            .unwrap_or_default()
            .to_string();
        Self { kind, lines }
    }

    /// Event body joined into one line.
    pub fn detail(&self) -> String {
        self.lines.join(" ")
    }
}

/// Tor ControlPort client.
pub struct TorController {
    writer: OwnedWriteHalf,
    replies: mpsc::Receiver<Reply>,
    events: Option<mpsc::Receiver<ControlEvent>>,
    reader_task: JoinHandle<()>,
    authenticated: bool,
}

impl TorController {
    /// Connect to Tor ControlPort.
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::Tor(format!("failed to connect to control port: {}", e)))?;

        let (read_half, write_half) = stream.into_split();
        let (reply_tx, reply_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(64);

        let reader_task = tokio::spawn(read_loop(BufReader::new(read_half), reply_tx, event_tx));

        Ok(Self {
            writer: write_half,
            replies: reply_rx,
            events: Some(event_rx),
            reader_task,
            authenticated: false,
        })
    }

    /// Take the asynchronous event stream. Only the first call returns it.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<ControlEvent>> {
        self.events.take()
    }

    /// Send a command and read the response.
    async fn command(&mut self, cmd: &str) -> Result<Vec<String>> {
        debug!(command = %sanitize_for_log(cmd), "Control command");

        self.writer
            .write_all(format!("{}\r\n", cmd).as_bytes())
            .await
            .map_err(|e| Error::Tor(format!("failed to send command: {}", e)))?;
        self.writer
            .flush()
            .await
            .map_err(|e| Error::Tor(format!("failed to flush: {}", e)))?;

        let reply = self
            .replies
            .recv()
            .await
            .ok_or_else(|| Error::Tor("control connection closed".into()))?;

        if (200..300).contains(&reply.status) {
            Ok(reply.lines)
        } else {
            Err(Error::Tor(format!(
                "control port error: {} {}",
                reply.status,
                reply.lines.join(" ")
            )))
        }
    }

    /// Get protocol info to determine authentication method.
    pub async fn get_protocol_info(&mut self) -> Result<ProtocolInfo> {
        let lines = self.command("PROTOCOLINFO 1").await?;

        let mut auth_methods = Vec::new();
        let mut cookie_file = None;

        for line in lines {
            // AUTH METHODS=COOKIE,SAFECOOKIE COOKIEFILE="/path"
            if let Some(auth_part) = line.strip_prefix("AUTH ") {
                if let Some(methods_start) = auth_part.find("METHODS=") {
                    let after_methods = &auth_part[methods_start + 8..];
                    let methods_end = after_methods.find(' ').unwrap_or(after_methods.len());
                    auth_methods = after_methods[..methods_end]
                        .split(',')
                        .map(String::from)
                        .collect();
                }
                if let Some(cookie_start) = auth_part.find("COOKIEFILE=\"") {
                    let after_cookie = &auth_part[cookie_start + 12..];
                    if let Some(quote_end) = after_cookie.find('"') {
                        cookie_file = Some(after_cookie[..quote_end].to_string());
                    }
                }
            }
        }

        Ok(ProtocolInfo {
            auth_methods,
            cookie_file,
        })
    }

    /// Authenticate with the control port.
    pub async fn authenticate(&mut self, auth: TorAuth) -> Result<()> {
        let cmd = match auth {
            TorAuth::None => "AUTHENTICATE".to_string(),
            TorAuth::Cookie(path) => {
                let cookie = tokio::fs::read(&path)
                    .await
                    .map_err(|e| Error::Tor(format!("failed to read cookie file: {}", e)))?;
                format!("AUTHENTICATE {}", hex::encode(cookie))
            }
            TorAuth::Password(password) => {
                format!("AUTHENTICATE \"{}\"", escape_tor_string(&password))
            }
        };

        self.command(&cmd).await?;
        self.authenticated = true;

        info!("Authenticated with Tor control port");
        Ok(())
    }

    /// Auto-authenticate using available methods.
    ///
    /// Tries the cookie from PROTOCOLINFO, then `extra_cookie` (for a Tor we
    /// launched ourselves), then null auth.
    pub async fn authenticate_auto(&mut self, extra_cookie: Option<&Path>) -> Result<()> {
        let info = self.get_protocol_info().await?;

        debug!(methods = ?info.auth_methods, cookie_file = ?info.cookie_file, "Tor auth methods");

        if info.supports("COOKIE") || info.supports("SAFECOOKIE") {
            let candidates = info
                .cookie_file
                .iter()
                .map(String::as_str)
                .chain(extra_cookie.and_then(Path::to_str));
            for path in candidates {
                match self.authenticate(TorAuth::Cookie(path.to_string())).await {
                    Ok(()) => return Ok(()),
                    Err(e) => warn!(cookie = %path, error = %e, "Cookie auth failed"),
                }
            }
        }

        if info.supports("NULL") {
            return self.authenticate(TorAuth::None).await;
        }

        Err(Error::Tor("no usable control port authentication method".into()))
    }

    /// Whether `AUTHENTICATE` has succeeded on this connection.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    fn require_auth(&self) -> Result<()> {
        if self.authenticated {
            Ok(())
        } else {
            Err(Error::Tor("not authenticated".into()))
        }
    }

    /// Add an ephemeral onion service.
    ///
    /// `key_blob` is `ED25519-V3:<base64 expanded secret key>`. Returns the
    /// service id (hostname without `.onion`).
    pub async fn add_onion(
        &mut self,
        key_blob: &str,
        virtual_port: u16,
        target_port: u16,
    ) -> Result<String> {
        self.require_auth()?;

        let cmd = format!(
            "ADD_ONION {} Flags=DiscardPK Port={},127.0.0.1:{}",
            key_blob, virtual_port, target_port
        );

        let response = self.command(&cmd).await?;

        let service_id = response
            .iter()
            .find_map(|line| line.strip_prefix("ServiceID="))
            .map(str::to_string)
            .ok_or_else(|| Error::Tor("no ServiceID in response".into()))?;

        info!(
            service_id = %service_id,
            virtual_port = virtual_port,
            target_port = target_port,
            "Created onion service"
        );

        Ok(service_id)
    }

    /// Remove an onion service.
    pub async fn del_onion(&mut self, service_id: &str) -> Result<()> {
        self.require_auth()?;
        self.command(&format!("DEL_ONION {}", service_id)).await?;
        info!(service_id = %service_id, "Removed onion service");
        Ok(())
    }

    /// Get a single `GETINFO` value.
    pub async fn get_info(&mut self, key: &str) -> Result<String> {
        let lines = self.command(&format!("GETINFO {}", key)).await?;
        let prefix = format!("{}=", key);
        lines
            .iter()
            .find_map(|line| line.strip_prefix(prefix.as_str()))
            .map(str::to_string)
            .ok_or_else(|| Error::Tor(format!("{} not found in response", key)))
    }

    /// Get Tor version.
    pub async fn get_version(&mut self) -> Result<String> {
        self.get_info("version").await
    }

    /// Current bootstrap percentage from `status/bootstrap-phase`.
    pub async fn bootstrap_progress(&mut self) -> Result<u8> {
        let phase = self.get_info("status/bootstrap-phase").await?;
        parse_bootstrap_progress(&phase)
            .ok_or_else(|| Error::Tor(format!("unparsable bootstrap phase: {}", phase)))
    }

    /// Check if Tor has established circuits (is ready for connections).
    pub async fn is_ready(&mut self) -> Result<bool> {
        Ok(self.get_info("status/circuit-established").await? == "1")
    }

    /// Subscribe to asynchronous events.
    pub async fn set_events(&mut self, events: &[&str]) -> Result<()> {
        self.require_auth()?;
        self.command(&format!("SETEVENTS {}", events.join(" "))).await?;
        Ok(())
    }

    /// Signal Tor (e.g., NEWNYM for new circuit).
    pub async fn signal(&mut self, signal: &str) -> Result<()> {
        self.require_auth()?;
        self.command(&format!("SIGNAL {}", signal)).await?;
        Ok(())
    }
}

impl Drop for TorController {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Split the control stream into replies and `650` events.
async fn read_loop(
    mut reader: BufReader<OwnedReadHalf>,
    replies: mpsc::Sender<Reply>,
    events: mpsc::Sender<ControlEvent>,
) {
    let mut pending: Vec<String> = Vec::new();
    let mut in_data = false;
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "Control connection read failed");
                break;
            }
        }

        let text = line.trim_end_matches(['\r', '\n']);

        // "250+key=" starts a data block that ends with a lone "."
        if in_data {
            if text == "." {
                in_data = false;
            } else {
                pending.push(text.to_string());
            }
            continue;
        }

        if text.len() < 4 || !text.is_char_boundary(3) || !text.is_char_boundary(4) {
            if !text.is_empty() {
                warn!(line = %sanitize_for_log(text), "Malformed control line");
            }
            continue;
        }

        let Ok(status) = text[..3].parse::<u16>() else {
            warn!(line = %sanitize_for_log(text), "Malformed control status");
            continue;
        };

        pending.push(text[4..].to_string());

        match &text[3..4] {
            "+" => in_data = true,
            "-" => {}
            _ => {
                let lines = std::mem::take(&mut pending);
                if status == ASYNC_EVENT_CODE {
                    if events.try_send(ControlEvent::from_lines(lines)).is_err() {
                        debug!("Dropped control event, no consumer");
                    }
                } else if replies.send(Reply { status, lines }).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Information from PROTOCOLINFO response.
#[derive(Debug)]
pub struct ProtocolInfo {
    /// Available authentication methods.
    pub auth_methods: Vec<String>,
    /// Path to control port cookie file for authentication.
    pub cookie_file: Option<String>,
}

impl ProtocolInfo {
    fn supports(&self, method: &str) -> bool {
        self.auth_methods.iter().any(|m| m == method)
    }
}

/// Extract `PROGRESS=<n>` from a bootstrap phase or status event.
pub fn parse_bootstrap_progress(phase: &str) -> Option<u8> {
    phase
        .split_whitespace()
        .find_map(|token| token.strip_prefix("PROGRESS="))
        .and_then(|value| value.parse::<u8>().ok())
        .map(|p| p.min(100))
}

/// Escape a string for Tor control protocol.
fn escape_tor_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
