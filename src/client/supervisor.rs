//! Keeps one logical gateway connection alive across physical reconnects.

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The server refused the credential. Nothing is retried until a new token
    /// is supplied and a reconnect is requested.
    AuthError,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::AuthError => "auth_error",
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("credential rejected")]
    Unauthorized,
    #[error("handshake timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug + 'static {
    fn is_connected(&self) -> bool;
    async fn close(&self);
}

#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug + 'static {
    type Transport: Transport;

    async fn connect(&self, token: &str) -> Result<Self::Transport, ConnectError>;
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Failed attempts tolerated before giving up until the next probe or command.
    pub max_retries: usize,
    pub handshake_timeout: Duration,
    pub probe_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: 5,
            handshake_timeout: Duration::from_secs(10),
            probe_interval: Duration::from_secs(15),
        }
    }
}

#[derive(Debug)]
enum Command {
    SetToken(Option<String>),
    Reconnect,
}

/// Owner's handle on a running supervisor. Dropping it closes the transport and
/// cancels any pending retry.
#[derive(Debug)]
pub struct SupervisorHandle<T: Transport> {
    commands: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    transport_rx: watch::Receiver<Option<Arc<T>>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<T: Transport> SupervisorHandle<T> {
    /// Supplies a credential. Connects right away unless the supervisor is
    /// parked in `AuthError`, which needs an explicit [`Self::reconnect`].
    pub fn set_token(&self, token: Option<String>) {
        let _ = self.commands.send(Command::SetToken(token));
    }

    /// Drops the current transport and starts over with a fresh backoff.
    pub fn reconnect(&self) {
        let _ = self.commands.send(Command::Reconnect);
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn transport(&self) -> Option<Arc<T>> {
        self.transport_rx.borrow().clone()
    }

    /// Stops the supervisor and waits for the transport to close.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl<T: Transport> Drop for SupervisorHandle<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Supervisor<C: Connector> {
    connector: C,
    config: SupervisorConfig,
    token: Option<String>,
    /// Set when a token arrives, cleared when the server rejects one.
    token_fresh: bool,
    backoff: Option<ExponentialBackoff>,
    retry_at: Option<Instant>,
    attempts: usize,
    transport: Option<Arc<C::Transport>>,
    state_tx: watch::Sender<ConnectionState>,
    transport_tx: watch::Sender<Option<Arc<C::Transport>>>,
}

/// Starts supervising a connection. With a token it connects immediately.
pub fn spawn<C: Connector>(
    connector: C,
    config: SupervisorConfig,
    token: Option<String>,
) -> SupervisorHandle<C::Transport> {
    let (commands, command_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let (transport_tx, transport_rx) = watch::channel(None);
    let cancel = CancellationToken::new();

    let supervisor = Supervisor {
        connector,
        config,
        retry_at: token.is_some().then(Instant::now),
        token_fresh: token.is_some(),
        token,
        backoff: None,
        attempts: 0,
        transport: None,
        state_tx,
        transport_tx,
    };

    let task = tokio::spawn(
        supervisor.run(command_rx, cancel.clone()).instrument(tracing::info_span!("connection_supervisor")),
    );

    SupervisorHandle { commands, state_rx, transport_rx, cancel, task: Some(task) }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl<C: Connector> Supervisor<C> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, cancel: CancellationToken) {
        let mut probe = tokio::time::interval(self.config.probe_interval);
        probe.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break,

                cmd = commands.recv() => match cmd {
                    Some(Command::SetToken(token)) => self.on_token(token).await,
                    Some(Command::Reconnect) => self.on_reconnect().await,
                    None => break,
                },

                () = wait_until(self.retry_at) => {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = self.attempt() => {}
                    }
                }

                _ = probe.tick() => self.probe().await,
            }
        }

        self.teardown().await;
        self.set_state(ConnectionState::Disconnected);
        tracing::info!("Connection supervisor stopped");
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        if self.state_tx.send_replace(state) != state {
            tracing::debug!(%state, "Connection state changed");
        }
    }

    async fn on_token(&mut self, token: Option<String>) {
        self.token_fresh = token.is_some();
        self.token = token;

        if self.token.is_none() {
            self.teardown().await;
            self.retry_at = None;
            if self.state() != ConnectionState::AuthError {
                self.set_state(ConnectionState::Disconnected);
            }
        } else if self.state() == ConnectionState::Disconnected && self.retry_at.is_none() {
            self.restart();
        }
    }

    async fn on_reconnect(&mut self) {
        if self.token.is_none() {
            tracing::debug!("Reconnect requested without a token");
            return;
        }
        if self.state() == ConnectionState::AuthError && !self.token_fresh {
            tracing::warn!("Reconnect ignored: credential was rejected and has not been replaced");
            return;
        }
        self.teardown().await;
        self.set_state(ConnectionState::Disconnected);
        self.restart();
    }

    async fn probe(&mut self) {
        if self.state() == ConnectionState::AuthError || self.token.is_none() || self.retry_at.is_some() {
            return;
        }
        let alive = self.transport.as_ref().is_some_and(|t| t.is_connected());
        if !alive {
            if self.state() == ConnectionState::Connected {
                tracing::warn!("Liveness probe found the transport down");
            }
            self.teardown().await;
            self.set_state(ConnectionState::Disconnected);
            self.restart();
        }
    }

    fn restart(&mut self) {
        self.backoff = None;
        self.attempts = 0;
        self.retry_at = Some(Instant::now());
    }

    async fn attempt(&mut self) {
        self.retry_at = None;
        let Some(token) = self.token.clone() else { return };

        self.attempts += 1;
        self.set_state(ConnectionState::Connecting);

        let result = match tokio::time::timeout(self.config.handshake_timeout, self.connector.connect(&token)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Timeout),
        };

        match result {
            Ok(transport) => {
                tracing::info!(attempts = self.attempts, "Connected");
                let transport = Arc::new(transport);
                self.transport = Some(Arc::clone(&transport));
                self.transport_tx.send_replace(Some(transport));
                self.backoff = None;
                self.attempts = 0;
                self.set_state(ConnectionState::Connected);
            }
            Err(ConnectError::Unauthorized) => {
                tracing::warn!("Credential rejected, suspending reconnection");
                self.token_fresh = false;
                self.backoff = None;
                self.set_state(ConnectionState::AuthError);
            }
            Err(e) => {
                let config = &self.config;
                let backoff = self.backoff.get_or_insert_with(|| {
                    ExponentialBuilder::default()
                        .with_min_delay(config.base_delay)
                        .with_max_delay(config.max_delay)
                        .with_max_times(config.max_retries)
                        .build()
                });
                if let Some(delay) = backoff.next() {
                    tracing::warn!(error = %e, attempt = self.attempts, delay_ms = delay.as_millis(), "Connect failed, retrying");
                    self.retry_at = Some(Instant::now() + delay);
                } else {
                    tracing::error!(error = %e, attempts = self.attempts, "Connect failed, retries exhausted");
                    self.backoff = None;
                }
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    async fn teardown(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        self.transport_tx.send_replace(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct FakeTransport {
        connected: AtomicBool,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.connected.store(false, Ordering::SeqCst);
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Debug, Clone, Copy)]
    enum Script {
        Ok,
        Fail,
        Unauthorized,
        Hang,
    }

    #[derive(Debug, Default)]
    struct FakeConnector {
        script: Mutex<VecDeque<Script>>,
        calls: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    impl FakeConnector {
        fn with(script: &[Script]) -> Self {
            Self { script: Mutex::new(script.iter().copied().collect()), ..Default::default() }
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        type Transport = FakeTransport;

        async fn connect(&self, _token: &str) -> Result<FakeTransport, ConnectError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front().unwrap_or(Script::Ok);
            match next {
                Script::Ok => Ok(FakeTransport { connected: AtomicBool::new(true), closed: Arc::clone(&self.closed) }),
                Script::Fail => Err(ConnectError::Transport("refused".into())),
                Script::Unauthorized => Err(ConnectError::Unauthorized),
                Script::Hang => std::future::pending().await,
            }
        }
    }

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_retries: 3,
            handshake_timeout: Duration::from_secs(10),
            probe_interval: Duration::from_secs(60),
        }
    }

    async fn wait_for(handle: &SupervisorHandle<FakeTransport>, state: ConnectionState) {
        let mut rx = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(300), rx.wait_for(|s| *s == state)).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_backoff_then_connects() {
        let connector = FakeConnector::with(&[Script::Fail, Script::Fail, Script::Ok]);
        let calls = Arc::clone(&connector.calls);
        let handle = spawn(connector, config(), Some("token".into()));

        wait_for(&handle, ConnectionState::Connected).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(handle.transport().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_token_means_no_attempt() {
        let connector = FakeConnector::with(&[]);
        let calls = Arc::clone(&connector.calls);
        let handle = spawn(connector, config(), None);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        handle.set_token(Some("token".into()));
        wait_for(&handle, ConnectionState::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_error_is_terminal_until_new_token_and_reconnect() {
        let connector = FakeConnector::with(&[Script::Unauthorized]);
        let calls = Arc::clone(&connector.calls);
        let handle = spawn(connector, config(), Some("expired".into()));

        wait_for(&handle, ConnectionState::AuthError).await;

        // Neither probes nor a bare reconnect retry a rejected credential.
        tokio::time::sleep(Duration::from_secs(300)).await;
        handle.reconnect();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handle.state(), ConnectionState::AuthError);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        handle.set_token(Some("fresh".into()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handle.state(), ConnectionState::AuthError);

        handle.reconnect();
        wait_for(&handle, ConnectionState::Connected).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_counts_as_failure() {
        let connector = FakeConnector::with(&[Script::Hang, Script::Ok]);
        let calls = Arc::clone(&connector.calls);
        let handle = spawn(connector, config(), Some("token".into()));

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(handle.state(), ConnectionState::Connecting);

        wait_for(&handle, ConnectionState::Connected).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_retry_ceiling() {
        let connector = FakeConnector::with(&[Script::Fail; 10]);
        let calls = Arc::clone(&connector.calls);
        let handle = spawn(connector, config(), Some("token".into()));

        // One initial attempt plus three retries, well before the first probe.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_reconnects_dropped_transport() {
        let connector = FakeConnector::with(&[]);
        let calls = Arc::clone(&connector.calls);
        let handle = spawn(connector, config(), Some("token".into()));
        wait_for(&handle, ConnectionState::Connected).await;

        handle.transport().unwrap().connected.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(61)).await;

        wait_for(&handle, ConnectionState::Connected).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_transport() {
        let connector = FakeConnector::with(&[]);
        let closed = Arc::clone(&connector.closed);
        let handle = spawn(connector, config(), Some("token".into()));
        wait_for(&handle, ConnectionState::Connected).await;

        handle.shutdown().await;
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
