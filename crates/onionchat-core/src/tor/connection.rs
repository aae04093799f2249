//! Outbound connections through Tor's SOCKS5 proxy.

use super::session::SessionState;
use crate::error::{Error, Result};
use crate::identity::OnionAddress;
use rand::RngCore;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::debug;

/// Proxied network session handle.
///
/// Safe to obtain in any session state. Each connection waits until the
/// session is connected and fails with [`Error::Cancelled`] once it stops,
/// including connections already in flight.
#[derive(Clone)]
pub struct ProxySession {
    socks_addr: SocketAddr,
    timeout: Duration,
    stream_isolation: bool,
    state: watch::Receiver<SessionState>,
}

impl ProxySession {
    /// Create a session handle bound to a state watch.
    pub fn new(
        socks_addr: SocketAddr,
        timeout: Duration,
        stream_isolation: bool,
        state: watch::Receiver<SessionState>,
    ) -> Self {
        Self {
            socks_addr,
            timeout,
            stream_isolation,
            state,
        }
    }

    /// SOCKS5 proxy address.
    pub fn socks_addr(&self) -> SocketAddr {
        self.socks_addr
    }

    /// Wait until the session is usable.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut state = self.state.clone();
        loop {
            let current = state.borrow_and_update().clone();
            if current.is_usable() {
                return Ok(());
            }
            if current == SessionState::Stopped {
                return Err(Error::Cancelled);
            }
            state.changed().await.map_err(|_| Error::Cancelled)?;
        }
    }

    /// Resolve once the session is stopped (or dropped).
    async fn stopped(&self) {
        let mut state = self.state.clone();
        loop {
            if *state.borrow_and_update() == SessionState::Stopped {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    /// Connect to `target:port` through Tor.
    pub async fn connect(&self, target: &OnionAddress, port: u16) -> Result<TcpStream> {
        tokio::select! {
            result = self.connect_when_ready(target, port) => result,
            _ = self.stopped() => Err(Error::Cancelled),
        }
    }

    async fn connect_when_ready(&self, target: &OnionAddress, port: u16) -> Result<TcpStream> {
        self.wait_ready().await?;

        let mut stream = tokio::time::timeout(self.timeout, TcpStream::connect(self.socks_addr))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|e| Error::Tor(format!("failed to connect to SOCKS proxy: {}", e)))?;

        let credentials = self.stream_isolation.then(isolation_credentials);

        tokio::time::timeout(
            self.timeout,
            socks5_handshake(&mut stream, target.as_str(), port, credentials.as_ref()),
        )
        .await
        .map_err(|_| Error::Timeout)??;

        debug!(port = port, "SOCKS5 stream established");
        Ok(stream)
    }
}

/// Random SOCKS username/password; Tor keeps differently-authenticated
/// streams on different circuits.
fn isolation_credentials() -> (String, String) {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    (hex::encode(bytes), "x".to_string())
}

/// Perform the SOCKS5 greeting and CONNECT.
pub async fn socks5_handshake(
    stream: &mut TcpStream,
    host: &str,
    port: u16,
    credentials: Option<&(String, String)>,
) -> Result<()> {
    // Version 5, one method: no auth (0x00) or username/password (0x02).
    let method = if credentials.is_some() { 0x02 } else { 0x00 };
    stream
        .write_all(&[0x05, 0x01, method])
        .await
        .map_err(|e| Error::Tor(format!("SOCKS5 greeting failed: {}", e)))?;

    let mut response = [0u8; 2];
    stream
        .read_exact(&mut response)
        .await
        .map_err(|e| Error::Tor(format!("SOCKS5 response failed: {}", e)))?;

    if response[0] != 0x05 || response[1] != method {
        return Err(Error::Tor("SOCKS5 authentication method rejected".into()));
    }

    if let Some((user, pass)) = credentials {
        let mut auth = Vec::with_capacity(3 + user.len() + pass.len());
        auth.push(0x01);
        auth.push(user.len() as u8);
        auth.extend_from_slice(user.as_bytes());
        auth.push(pass.len() as u8);
        auth.extend_from_slice(pass.as_bytes());
        stream
            .write_all(&auth)
            .await
            .map_err(|e| Error::Tor(format!("SOCKS5 auth failed: {}", e)))?;

        let mut status = [0u8; 2];
        stream
            .read_exact(&mut status)
            .await
            .map_err(|e| Error::Tor(format!("SOCKS5 auth response failed: {}", e)))?;
        if status[1] != 0x00 {
            return Err(Error::Tor("SOCKS5 authentication failed".into()));
        }
    }

    let hostname_bytes = host.as_bytes();
    if hostname_bytes.len() > 255 {
        return Err(Error::Tor("hostname too long".into()));
    }

    // Version 5, CMD connect, RSV, ATYP domain
    let mut request = Vec::with_capacity(7 + hostname_bytes.len());
    request.extend_from_slice(&[0x05, 0x01, 0x00, 0x03]);
    request.push(hostname_bytes.len() as u8);
    request.extend_from_slice(hostname_bytes);
    request.extend_from_slice(&port.to_be_bytes());

    stream
        .write_all(&request)
        .await
        .map_err(|e| Error::Tor(format!("SOCKS5 connect failed: {}", e)))?;

    let mut response = [0u8; 4];
    stream
        .read_exact(&mut response)
        .await
        .map_err(|e| Error::Tor(format!("SOCKS5 connect response failed: {}", e)))?;

    if response[0] != 0x05 {
        return Err(Error::Tor("invalid SOCKS5 version in response".into()));
    }

    if response[1] != 0x00 {
        return Err(Error::Tor(format!(
            "SOCKS5 connect failed: error code {}",
            response[1]
        )));
    }

    // Bound address is ignored but must be consumed.
    let remaining = match response[3] {
        0x01 => 4 + 2,
        0x04 => 16 + 2,
        0x03 => {
            let mut len = [0u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .map_err(|e| Error::Tor(e.to_string()))?;
            len[0] as usize + 2
        }
        _ => return Err(Error::Tor("invalid SOCKS5 address type".into())),
    };
    let mut buf = vec![0u8; remaining];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| Error::Tor(e.to_string()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::OnionIdentity;
    use tokio::net::TcpListener;

    /// Minimal SOCKS5 server that accepts one CONNECT and then echoes.
    async fn fake_socks(expect_auth: bool) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.expect("accept");
            let mut greeting = [0u8; 3];
            s.read_exact(&mut greeting).await.expect("greeting");
            s.write_all(&[0x05, greeting[2]]).await.expect("method");
            if expect_auth {
                let mut head = [0u8; 2];
                s.read_exact(&mut head).await.expect("auth head");
                let mut user = vec![0u8; head[1] as usize + 1];
                s.read_exact(&mut user).await.expect("user");
                let mut pass = vec![0u8; user[user.len() - 1] as usize];
                s.read_exact(&mut pass).await.expect("pass");
                s.write_all(&[0x01, 0x00]).await.expect("auth ok");
            }
            let mut head = [0u8; 5];
            s.read_exact(&mut head).await.expect("connect head");
            let mut rest = vec![0u8; head[4] as usize + 2];
            s.read_exact(&mut rest).await.expect("connect rest");
            s.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .expect("reply");
            let mut buf = [0u8; 4];
            let n = s.read(&mut buf).await.expect("read");
            s.write_all(&buf[..n]).await.expect("echo");
        });
        addr
    }

    #[tokio::test]
    async fn test_connect_through_proxy() {
        for isolate in [false, true] {
            let socks = fake_socks(isolate).await;
            let (_tx, rx) = watch::channel(SessionState::Connected);
            let session = ProxySession::new(socks, Duration::from_secs(5), isolate, rx);
            let target = OnionIdentity::generate().onion_address().clone();

            let mut stream = session.connect(&target, 80).await.expect("connect");
            stream.write_all(b"ping").await.expect("write");
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.expect("read");
            assert_eq!(&buf, b"ping");
        }
    }

    #[tokio::test]
    async fn test_waits_for_connected() {
        let socks = fake_socks(false).await;
        let (tx, rx) = watch::channel(SessionState::ConnectingProgress(10));
        let session = ProxySession::new(socks, Duration::from_secs(5), false, rx);
        let target = OnionIdentity::generate().onion_address().clone();

        let pending = tokio::spawn(async move { session.connect(&target, 80).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        tx.send_replace(SessionState::Connected);
        assert!(pending.await.expect("join").is_ok());
    }

    #[tokio::test]
    async fn test_stop_cancels_waiters() {
        let (tx, rx) = watch::channel(SessionState::Started);
        let session = ProxySession::new(
            SocketAddr::from(([127, 0, 0, 1], 1)),
            Duration::from_secs(5),
            false,
            rx,
        );
        let target = OnionIdentity::generate().onion_address().clone();

        let pending = tokio::spawn(async move { session.connect(&target, 80).await });
        tx.send_replace(SessionState::Stopped);

        let err = pending.await.expect("join").expect_err("cancelled");
        assert!(err.is_cancellation());
    }
}
