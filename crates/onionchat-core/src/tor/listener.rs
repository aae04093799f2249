//! Local listener behind the hidden service.
//!
//! Tor forwards inbound onion connections to a local port. The listener
//! accepts them and hands each socket to the peer transport with a
//! [`ConnectionReporter`] that reports the socket's lifecycle.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Listener lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerState {
    /// Bound and accepting on this port.
    ServerIsRunning(u16),
    /// Binding failed.
    ErrorStartingServer(String),
    /// A peer socket was accepted.
    DidAcceptNewSocket,
    /// A response was written to a peer socket.
    DidSentResponse,
    /// A peer socket closed.
    SocketDidDisconnect,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerState::ServerIsRunning(port) => write!(f, "running on port {}", port),
            ServerState::ErrorStartingServer(e) => write!(f, "failed to start: {}", e),
            ServerState::DidAcceptNewSocket => write!(f, "accepted socket"),
            ServerState::DidSentResponse => write!(f, "sent response"),
            ServerState::SocketDidDisconnect => write!(f, "socket disconnected"),
        }
    }
}

/// Callback receiving every [`ServerState`].
pub type ServerCallback = Arc<dyn Fn(ServerState) + Send + Sync>;

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind. Tor connects over loopback.
    pub bind_addr: IpAddr,
    /// Port to bind; 0 picks an ephemeral port.
    pub port: u16,
    /// Accepted sockets buffered before accept applies backpressure.
    pub queue_depth: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 9878,
            queue_depth: 32,
        }
    }
}

/// Reports `DidSentResponse` on demand and `SocketDidDisconnect` on drop.
pub struct ConnectionReporter {
    callback: ServerCallback,
}

impl ConnectionReporter {
    /// Wrap a callback.
    pub fn new(callback: ServerCallback) -> Self {
        Self { callback }
    }

    /// Record that a response was written.
    pub fn response_sent(&self) {
        (self.callback)(ServerState::DidSentResponse);
    }
}

impl Drop for ConnectionReporter {
    fn drop(&mut self) {
        (self.callback)(ServerState::SocketDidDisconnect);
    }
}

/// An accepted peer socket.
pub struct IncomingConnection {
    /// The socket.
    pub stream: TcpStream,
    /// Local-side peer address (Tor's loopback end).
    pub peer_addr: SocketAddr,
    /// Lifecycle reporter; drop it when the socket closes.
    pub reporter: ConnectionReporter,
}

/// Accept loop for the hidden-service port. Stops when dropped.
pub struct HiddenServiceListener {
    local_port: Option<u16>,
    incoming: mpsc::Receiver<IncomingConnection>,
    task: Option<JoinHandle<()>>,
}

impl HiddenServiceListener {
    /// Bind and begin accepting.
    ///
    /// Bind failures are reported through `callback` as
    /// `ErrorStartingServer`; the returned listener then yields nothing.
    pub async fn start<F>(config: ListenerConfig, callback: F) -> Self
    where
        F: Fn(ServerState) + Send + Sync + 'static,
    {
        let callback: ServerCallback = Arc::new(callback);
        let (tx, incoming) = mpsc::channel(config.queue_depth.max(1));
        let addr = SocketAddr::new(config.bind_addr, config.port);

        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(%addr, error = %e, "Failed to bind hidden service listener");
                callback(ServerState::ErrorStartingServer(e.to_string()));
                return Self {
                    local_port: None,
                    incoming,
                    task: None,
                };
            }
        };

        let port = listener.local_addr().map(|a| a.port()).unwrap_or(config.port);
        info!(port = port, "Hidden service listener running");
        callback(ServerState::ServerIsRunning(port));

        let task = tokio::spawn(accept_loop(listener, tx, callback));

        Self {
            local_port: Some(port),
            incoming,
            task: Some(task),
        }
    }

    /// Bound port, if binding succeeded.
    pub fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    /// Next accepted connection; `None` once the accept loop has ended.
    pub async fn accept(&mut self) -> Option<IncomingConnection> {
        self.incoming.recv().await
    }
}

impl Drop for HiddenServiceListener {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: mpsc::Sender<IncomingConnection>,
    callback: ServerCallback,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                debug!(?peer_addr, "Accepted incoming connection");
                callback(ServerState::DidAcceptNewSocket);
                let connection = IncomingConnection {
                    stream,
                    peer_addr,
                    reporter: ConnectionReporter::new(callback.clone()),
                };
                if tx.send(connection).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                error!(error = %e, "Accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
    debug!("Hidden service accept loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<ServerState>>>, impl Fn(ServerState) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |s| sink.lock().expect("lock").push(s))
    }

    fn ephemeral() -> ListenerConfig {
        ListenerConfig {
            port: 0,
            ..ListenerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_lifecycle_events() {
        let (seen, callback) = recorder();
        let mut listener = HiddenServiceListener::start(ephemeral(), callback).await;
        let port = listener.local_port().expect("bound");

        let _client = TcpStream::connect(("127.0.0.1", port)).await.expect("connect");
        let incoming = listener.accept().await.expect("accepted");
        incoming.reporter.response_sent();
        drop(incoming);

        assert_eq!(
            *seen.lock().expect("lock"),
            vec![
                ServerState::ServerIsRunning(port),
                ServerState::DidAcceptNewSocket,
                ServerState::DidSentResponse,
                ServerState::SocketDidDisconnect,
            ]
        );
    }

    #[tokio::test]
    async fn test_bind_failure_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = taken.local_addr().expect("addr").port();

        let (seen, callback) = recorder();
        let listener = HiddenServiceListener::start(
            ListenerConfig {
                port,
                ..ListenerConfig::default()
            },
            callback,
        )
        .await;

        assert_eq!(listener.local_port(), None);
        let seen = seen.lock().expect("lock");
        assert!(matches!(seen.as_slice(), [ServerState::ErrorStartingServer(_)]));
    }
}
