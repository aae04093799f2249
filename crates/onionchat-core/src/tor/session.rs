//! Onion transport session.
//!
//! [`TorService`] owns the Tor lifecycle: it prepares the working directory
//! and the hidden-service key, optionally launches a Tor binary with a
//! generated `torrc`, drives the control port through bootstrap and
//! publishes the hidden service. Progress is observable through a watch
//! channel and an optional state callback.
//!
//! ```text
//! none -> started -> connectingProgress(n)... -> connected
//!                                                 |  ^
//!                                         refresh v  |
//!                                              refreshing
//! any -> stopped
//! ```

use super::connection::ProxySession;
use super::controller::{ControlEvent, TorController};
use crate::error::{Error, TorServiceError};
use crate::identity::{OnionAddress, OnionIdentity};
use crate::logging::RedactedOnion;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Result alias for session operations.
pub type SessionResult<T> = std::result::Result<T, TorServiceError>;

/// Hidden-service directory name inside the working directory.
const HIDDEN_SERVICE_DIR: &str = "hidden_service";

/// Client onion-auth key directory inside the working directory.
const ONION_AUTH_DIR: &str = "onion_auth";

/// Tor data directory inside the working directory.
const TOR_DATA_DIR: &str = "data";

/// File holding the hex-encoded Ed25519 seed.
const PRIVATE_KEY_FILE: &str = "private_key";

/// File holding the onion hostname.
const HOSTNAME_FILE: &str = "hostname";

/// Generated Tor configuration file.
const TORRC_FILE: &str = "torrc";

/// Cookie file written by a Tor we launch ourselves.
const CONTROL_COOKIE_FILE: &str = "control_auth_cookie";

/// Session state, rebuilt from `None` on every process start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing has happened yet.
    None,
    /// `start()` was called.
    Started,
    /// Bootstrap progress, monotonic.
    ConnectingProgress(u8),
    /// Circuits are up and the hidden service is published.
    Connected,
    /// New circuits were requested.
    Refreshing,
    /// Session was stopped or failed.
    Stopped,
    /// Circuit status side channel, never stored as the primary state.
    CircuitsUpdated(String),
}

impl SessionState {
    /// Whether outbound connections may proceed.
    pub fn is_usable(&self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Refreshing)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::None => write!(f, "none"),
            SessionState::Started => write!(f, "started"),
            SessionState::ConnectingProgress(p) => write!(f, "connecting {}%", p),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Refreshing => write!(f, "refreshing"),
            SessionState::Stopped => write!(f, "stopped"),
            SessionState::CircuitsUpdated(detail) => write!(f, "circuits: {}", detail),
        }
    }
}

/// Callback fired on every state transition.
pub type StateAction = Arc<dyn Fn(SessionState) + Send + Sync>;

/// Configuration for the onion transport session.
#[derive(Debug, Clone)]
pub struct TorConfig {
    /// Working directory holding keys, torrc and Tor data.
    pub working_dir: PathBuf,
    /// Tor control port address.
    pub control_addr: String,
    /// Tor SOCKS5 proxy address.
    pub socks_addr: SocketAddr,
    /// Launch this Tor binary with the generated torrc instead of using a
    /// system Tor.
    pub tor_binary: Option<PathBuf>,
    /// Virtual port exposed on the onion service.
    pub virtual_port: u16,
    /// Local port the hidden service forwards to.
    pub service_port: u16,
    /// Give up on bootstrap after this long.
    pub bootstrap_timeout: Duration,
    /// Control port polling interval during bootstrap.
    pub poll_interval: Duration,
    /// Timeout for a single outbound connection.
    pub connect_timeout: Duration,
    /// Unique SOCKS credentials per connection so Tor isolates circuits.
    pub stream_isolation: bool,
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("tor"),
            control_addr: format!("127.0.0.1:{}", super::DEFAULT_CONTROL_PORT),
            socks_addr: SocketAddr::from(([127, 0, 0, 1], super::DEFAULT_SOCKS_PORT)),
            tor_binary: None,
            virtual_port: super::DEFAULT_VIRTUAL_PORT,
            service_port: 9878,
            bootstrap_timeout: Duration::from_secs(super::CIRCUIT_TIMEOUT_SECS),
            poll_interval: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(super::CIRCUIT_TIMEOUT_SECS),
            stream_isolation: true,
        }
    }
}

impl TorConfig {
    /// `<working_dir>/hidden_service`.
    pub fn hidden_service_dir(&self) -> PathBuf {
        self.working_dir.join(HIDDEN_SERVICE_DIR)
    }

    /// `<working_dir>/onion_auth`.
    pub fn onion_auth_dir(&self) -> PathBuf {
        self.working_dir.join(ONION_AUTH_DIR)
    }

    /// `<working_dir>/torrc`.
    pub fn torrc_path(&self) -> PathBuf {
        self.working_dir.join(TORRC_FILE)
    }

    /// Render the torrc for a Tor process we launch.
    pub fn render_torrc(&self) -> String {
        let control_port = self
            .control_addr
            .rsplit(':')
            .next()
            .unwrap_or_default()
            .to_string();
        format!(
            "DataDirectory {data}\n\
             SocksPort {socks}\n\
             ControlPort {control}\n\
             CookieAuthentication 1\n\
             CookieAuthFile {cookie}\n\
             ClientOnionAuthDir {auth}\n\
             AvoidDiskWrites 1\n",
            data = self.working_dir.join(TOR_DATA_DIR).display(),
            socks = self.socks_addr.port(),
            control = control_port,
            cookie = self.working_dir.join(CONTROL_COOKIE_FILE).display(),
            auth = self.onion_auth_dir().display(),
        )
    }
}

/// Live control-port state while the session is up.
struct Running {
    controller: Arc<Mutex<TorController>>,
    service_ids: Vec<String>,
    events_task: JoinHandle<()>,
    child: Option<Child>,
}

struct Inner {
    config: TorConfig,
    state: watch::Sender<SessionState>,
    state_action: Option<StateAction>,
    running: Mutex<Option<Running>>,
}

/// Handle to the onion transport session. Cheap to clone.
#[derive(Clone)]
pub struct TorService {
    inner: Arc<Inner>,
}

impl TorService {
    /// Create a session in state `None`.
    pub fn new(config: TorConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a session that reports every transition to `action`.
    pub fn with_state_action<F>(config: TorConfig, action: F) -> Self
    where
        F: Fn(SessionState) + Send + Sync + 'static,
    {
        Self::build(config, Some(Arc::new(action)))
    }

    fn build(config: TorConfig, state_action: Option<StateAction>) -> Self {
        let (state, _) = watch::channel(SessionState::None);
        Self {
            inner: Arc::new(Inner {
                config,
                state,
                state_action,
                running: Mutex::new(None),
            }),
        }
    }

    /// The session configuration.
    pub fn config(&self) -> &TorConfig {
        &self.inner.config
    }

    /// Current primary state.
    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    /// Watch primary state changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    fn transition(&self, next: SessionState) {
        transition(&self.inner, next);
    }

    /// Bring the session up. Idempotent while running.
    pub async fn start(&self) -> SessionResult<()> {
        let mut running = self.inner.running.lock().await;
        if running.is_some() {
            debug!("Tor session already running");
            return Ok(());
        }

        info!("Starting Tor session");
        self.transition(SessionState::Started);

        match self.bring_up().await {
            Ok(up) => {
                *running = Some(up);
                self.transition(SessionState::Connected);
                info!("Tor session connected");
                Ok(())
            }
            Err(e) => {
                warn!(error = ?e, "Tor session failed to start");
                self.transition(SessionState::Stopped);
                Err(e)
            }
        }
    }

    async fn bring_up(&self) -> SessionResult<Running> {
        let config = &self.inner.config;

        prepare_directories(config).await?;
        let identity = load_or_create_identity(&config.hidden_service_dir()).await?;

        tokio::fs::write(config.torrc_path(), config.render_torrc())
            .await
            .map_err(|e| TorServiceError::FailedToWriteTorrc(e.to_string()))?;

        let mut child = match &config.tor_binary {
            Some(binary) => Some(launch_tor(binary, &config.torrc_path())?),
            None => None,
        };

        let mut controller = connect_controller(config, child.as_mut()).await?;

        let cookie = config.working_dir.join(CONTROL_COOKIE_FILE);
        controller
            .authenticate_auto(Some(&cookie))
            .await
            .map_err(control_failure)?;

        match controller.get_version().await {
            Ok(version) => info!(version = %version, "Connected to Tor"),
            Err(e) => debug!(error = %e, "Could not get Tor version"),
        }

        self.await_bootstrap(&mut controller).await?;

        let events = controller.take_events();
        controller
            .set_events(&["CIRC"])
            .await
            .map_err(control_failure)?;

        let service_id = controller
            .add_onion(
                &identity.tor_private_key(),
                config.virtual_port,
                config.service_port,
            )
            .await
            .map_err(control_failure)?;

        if service_id != identity.onion_address().hostname() {
            warn!(
                expected = %RedactedOnion(identity.onion_address().as_str()),
                "Tor published a different onion address than the stored key"
            );
        }

        info!(
            onion = %RedactedOnion(identity.onion_address().as_str()),
            service_port = config.service_port,
            "Hidden service published"
        );

        let events_task = match events {
            Some(rx) => spawn_event_forwarder(Arc::downgrade(&self.inner), rx),
            None => tokio::spawn(async {}),
        };

        Ok(Running {
            controller: Arc::new(Mutex::new(controller)),
            service_ids: vec![service_id],
            events_task,
            child,
        })
    }

    /// Poll bootstrap progress until circuits are established.
    async fn await_bootstrap(&self, controller: &mut TorController) -> SessionResult<()> {
        let config = &self.inner.config;
        let deadline = tokio::time::Instant::now() + config.bootstrap_timeout;
        let mut last: Option<u8> = None;

        loop {
            let progress = controller
                .bootstrap_progress()
                .await
                .map_err(control_failure)?;

            if last.map_or(true, |l| progress > l) {
                self.transition(SessionState::ConnectingProgress(progress));
                last = Some(progress);
            }

            if progress >= 100 && controller.is_ready().await.map_err(control_failure)? {
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(TorServiceError::SomethingWentWrong(format!(
                    "bootstrap stalled at {}%",
                    last.unwrap_or(0)
                )));
            }

            tokio::time::sleep(config.poll_interval).await;
        }
    }

    /// Tear the session down and clear client onion-auth keys. Idempotent.
    pub async fn stop(&self) -> SessionResult<()> {
        let running = self.inner.running.lock().await.take();

        if let Some(mut running) = running {
            {
                let mut controller = running.controller.lock().await;
                for service_id in &running.service_ids {
                    if let Err(e) = controller.del_onion(service_id).await {
                        debug!(error = %e, "Failed to remove onion service");
                    }
                }
            }
            running.events_task.abort();
            if let Some(child) = running.child.as_mut() {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to stop Tor process");
                }
            }
            info!("Tor session stopped");
        }

        let cleared = clear_onion_auth(&self.inner.config.onion_auth_dir()).await;

        if *self.inner.state.borrow() != SessionState::Stopped {
            self.transition(SessionState::Stopped);
        }

        cleared
    }

    /// Ask Tor for new circuits.
    pub async fn refresh(&self) -> SessionResult<()> {
        let controller = self.controller().await.ok_or_else(|| {
            TorServiceError::SomethingWentWrong("session is not running".into())
        })?;

        self.transition(SessionState::Refreshing);

        let result = controller.lock().await.signal("NEWNYM").await;
        match result {
            Ok(()) => {
                self.transition(SessionState::Connected);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Circuit refresh failed");
                self.transition(SessionState::Stopped);
                Err(control_failure(e))
            }
        }
    }

    /// The onion address of this session's hidden service.
    pub async fn get_onion_address(&self) -> SessionResult<String> {
        let path = self.inner.config.hidden_service_dir().join(HOSTNAME_FILE);
        let hostname = tokio::fs::read_to_string(&path)
            .await
            .map_err(|_| TorServiceError::OnionAddressCouldNotBeLoaded)?;
        let address = OnionAddress::from_string(hostname.trim())
            .map_err(|_| TorServiceError::OnionAddressCouldNotBeLoaded)?;
        Ok(address.to_string())
    }

    /// The hidden-service key in Tor's `ED25519-V3:<base64>` form.
    pub async fn get_private_key(&self) -> SessionResult<String> {
        let identity = read_identity(&self.inner.config.hidden_service_dir()).await?;
        Ok(identity.tor_private_key().to_string())
    }

    /// A proxied connection factory. Connections wait until `Connected`.
    pub fn get_session(&self) -> ProxySession {
        let config = &self.inner.config;
        ProxySession::new(
            config.socks_addr,
            config.connect_timeout,
            config.stream_isolation,
            self.inner.state.subscribe(),
        )
    }

    /// Publish another onion service on the running Tor.
    pub async fn publish_hidden_service(
        &self,
        identity: &OnionIdentity,
        virtual_port: u16,
        target_port: u16,
    ) -> SessionResult<OnionAddress> {
        let mut running = self.inner.running.lock().await;
        let running = running.as_mut().ok_or_else(|| {
            TorServiceError::SomethingWentWrong("session is not running".into())
        })?;

        let service_id = running
            .controller
            .lock()
            .await
            .add_onion(&identity.tor_private_key(), virtual_port, target_port)
            .await
            .map_err(control_failure)?;

        running.service_ids.push(service_id);
        Ok(identity.onion_address().clone())
    }

    async fn controller(&self) -> Option<Arc<Mutex<TorController>>> {
        self.inner
            .running
            .lock()
            .await
            .as_ref()
            .map(|r| r.controller.clone())
    }
}

impl fmt::Debug for TorService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TorService")
            .field("working_dir", &self.inner.config.working_dir)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

fn transition(inner: &Inner, next: SessionState) {
    debug!(state = %next, "Tor session state");
    if !matches!(next, SessionState::CircuitsUpdated(_)) {
        inner.state.send_replace(next.clone());
    }
    if let Some(action) = &inner.state_action {
        action(next);
    }
}

/// Forward `CIRC` events as `CircuitsUpdated` until the session goes away.
fn spawn_event_forwarder(
    inner: std::sync::Weak<Inner>,
    mut events: mpsc::Receiver<ControlEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            if event.kind == "CIRC" {
                transition(&inner, SessionState::CircuitsUpdated(event.detail()));
            }
        }
    })
}

fn control_failure(e: Error) -> TorServiceError {
    match e {
        Error::Tor(detail) => TorServiceError::SomethingWentWrong(detail),
        Error::Transport(inner) => inner,
        other => TorServiceError::SomethingWentWrong(other.to_string()),
    }
}

async fn prepare_directories(config: &TorConfig) -> SessionResult<()> {
    if let Some(parent) = config.working_dir.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::metadata(parent)
            .await
            .map_err(|_| TorServiceError::UnableToAccessCachesDirectory)?;
    }

    for dir in [
        config.working_dir.clone(),
        config.working_dir.join(TOR_DATA_DIR),
        config.hidden_service_dir(),
    ] {
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| TorServiceError::FailedToCreateDirectory(format!("{}: {}", dir.display(), e)))?;
        restrict_permissions(&dir, 0o700).await?;
    }

    let auth = config.onion_auth_dir();
    tokio::fs::create_dir_all(&auth)
        .await
        .map_err(|e| TorServiceError::AuthDirectory(e.to_string()))?;
    restrict_permissions(&auth, 0o700).await?;

    Ok(())
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path, mode: u32) -> SessionResult<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|_| TorServiceError::FailedToSetPermissions)
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path, _mode: u32) -> SessionResult<()> {
    Ok(())
}

/// Load the hidden-service key, generating it on first run.
async fn load_or_create_identity(dir: &Path) -> SessionResult<OnionIdentity> {
    let key_path = dir.join(PRIVATE_KEY_FILE);
    if tokio::fs::try_exists(&key_path).await.unwrap_or(false) {
        let identity = read_identity(dir).await?;
        write_hostname(dir, &identity).await?;
        return Ok(identity);
    }

    let identity = OnionIdentity::generate();
    let seed = zeroize::Zeroizing::new(hex::encode(&identity.secret_key_bytes()[..]));
    tokio::fs::write(&key_path, seed.as_bytes())
        .await
        .map_err(|e| TorServiceError::KeyGeneration(e.to_string()))?;
    restrict_permissions(&key_path, 0o600).await?;
    write_hostname(dir, &identity).await?;

    info!(
        onion = %RedactedOnion(identity.onion_address().as_str()),
        "Generated hidden service key"
    );
    Ok(identity)
}

async fn read_identity(dir: &Path) -> SessionResult<OnionIdentity> {
    let contents = tokio::fs::read_to_string(dir.join(PRIVATE_KEY_FILE))
        .await
        .map_err(|_| TorServiceError::ErrorLoadingPrivateKey)?;
    let seed = zeroize::Zeroizing::new(
        hex::decode(contents.trim()).map_err(|_| TorServiceError::ErrorLoadingPrivateKey)?,
    );
    OnionIdentity::from_secret_bytes(&seed).map_err(|_| TorServiceError::ErrorLoadingPrivateKey)
}

async fn write_hostname(dir: &Path, identity: &OnionIdentity) -> SessionResult<()> {
    tokio::fs::write(
        dir.join(HOSTNAME_FILE),
        format!("{}\n", identity.onion_address()),
    )
    .await
    .map_err(|e| TorServiceError::KeyGeneration(e.to_string()))
}

async fn clear_onion_auth(dir: &Path) -> SessionResult<()> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(TorServiceError::ErrorWhenDeletingKeys(e.to_string())),
    };

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| TorServiceError::ErrorWhenDeletingKeys(e.to_string()))?
    {
        tokio::fs::remove_file(entry.path())
            .await
            .map_err(|e| TorServiceError::ErrorWhenDeletingKeys(e.to_string()))?;
    }
    Ok(())
}

fn launch_tor(binary: &Path, torrc: &Path) -> SessionResult<Child> {
    info!(binary = %binary.display(), "Launching Tor");
    Command::new(binary)
        .arg("-f")
        .arg(torrc)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| TorServiceError::SomethingWentWrong(format!("failed to launch tor: {}", e)))
}

/// Connect to the control port, retrying while a launched Tor starts up.
async fn connect_controller(
    config: &TorConfig,
    mut child: Option<&mut Child>,
) -> SessionResult<TorController> {
    let deadline = tokio::time::Instant::now() + config.bootstrap_timeout;
    loop {
        match TorController::connect(&config.control_addr).await {
            Ok(controller) => return Ok(controller),
            Err(e) => {
                let Some(child) = child.as_deref_mut() else {
                    return Err(control_failure(e));
                };
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(TorServiceError::CorruptTorrc(format!(
                        "tor exited with {}",
                        status
                    )));
                }
                if tokio::time::Instant::now() >= deadline {
                    return Err(control_failure(e));
                }
                tokio::time::sleep(config.poll_interval).await;
            }
        }
    }
}
