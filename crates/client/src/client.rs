//! Relay client: connection lifecycle and encrypted message transport.
//!
//! A [`RelayClient`] owns one WebSocket connection to
//! `{ws|wss}://{endpoint}/ws/client/{pairing_code}`. While connected a single
//! session task owns the socket:
//! - outbound frames arrive over an mpsc channel and are written in order
//! - inbound text frames are parsed into [`Envelope`]s and fanned out on a
//!   broadcast channel; consumers decrypt on demand
//! - heartbeat pings detect a dead link
//!
//! When the connection drops unexpectedly and auto-reconnect is enabled, the
//! same task retries with exponential backoff (see [`ReconnectPolicy`]).

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{future, SinkExt, Stream, StreamExt};
use protocol::messages::{
    PairingRequest, Resize, TerminalInput, VoiceAction, VoiceAudioFrame, VoiceControl,
};
use protocol::{Envelope, ErrorKind, KeyPair, MessageType, Payload, ProtocolError, PublicKey, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message as WsMessage},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::reconnect::ReconnectPolicy;
use crate::state::{lock, ConnectionState, ConnectionStateManager};

/// Capacity of the inbound envelope broadcast channel.
const MESSAGE_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the error-event broadcast channel.
const ERROR_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the outbound frame queue.
const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

/// How long to wait for the close handshake when shutting a socket down.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a stopping session task may take before it is aborted.
const SESSION_STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Length of a pairing code.
const PAIRING_CODE_LENGTH: usize = 6;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Stream of envelopes of one message type.
pub type MessageStream = Pin<Box<dyn Stream<Item = Envelope> + Send>>;

/// Stream of connection and dispatch errors.
pub type ErrorStream = Pin<Box<dyn Stream<Item = ErrorEvent> + Send>>;

/// Configuration for the relay client.
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// Use `wss://` instead of `ws://`.
    pub secure: bool,
    /// Whether to automatically reconnect after an unexpected close.
    pub auto_reconnect: bool,
    /// Backoff between reconnect attempts.
    pub reconnect: ReconnectPolicy,
    /// Timeout for the WebSocket handshake.
    pub connect_timeout: Duration,
    /// Interval between heartbeat pings.
    pub heartbeat_interval: Duration,
    /// Additional time allowed for a pong before the link is considered dead.
    pub heartbeat_timeout: Duration,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            secure: false,
            auto_reconnect: true,
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
        }
    }
}

impl RelayClientConfig {
    /// Sets whether to use TLS (`wss://`).
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Sets whether to automatically reconnect on disconnect.
    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    /// Sets the reconnect backoff policy.
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Sets the handshake timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the heartbeat interval and pong timeout.
    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }
}

/// A connection or dispatch failure reported on [`RelayClient::errors`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    /// Category of the failure.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// When the failure was observed.
    pub at: DateTime<Utc>,
}

/// Where the client last connected to.
#[derive(Debug, Clone)]
struct RelayTarget {
    endpoint: String,
    pairing_code: String,
}

/// A frame queued for the session task, with a completion signal.
struct OutboundFrame {
    text: String,
    done: oneshot::Sender<Result<()>>,
}

/// Handle to the running session task.
struct Session {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Why a served connection stopped.
enum SessionEnd {
    /// Disconnect or dispose was requested.
    Cancelled,
    /// The transport closed or failed on its own.
    Lost(String),
}

/// Checks that a pairing code is exactly six ASCII letters or digits.
pub fn validate_pairing_code(code: &str) -> Result<()> {
    if code.len() == PAIRING_CODE_LENGTH && code.bytes().all(|b| b.is_ascii_alphanumeric()) {
        Ok(())
    } else {
        Err(ProtocolError::InvalidArgument(format!(
            "pairing code must be {} ASCII letters or digits, got {:?}",
            PAIRING_CODE_LENGTH, code
        )))
    }
}

/// Builds `{ws|wss}://{endpoint}/ws/client/{pairing_code}`.
fn build_relay_url(endpoint: &str, pairing_code: &str, secure: bool) -> Result<Url> {
    let malformed = |detail: String| {
        ProtocolError::ConnectionFailed(format!("malformed relay endpoint {:?}: {}", endpoint, detail))
    };

    if endpoint.is_empty() || endpoint.contains("://") || endpoint.contains('/') {
        return Err(malformed("expected host:port".to_string()));
    }

    let scheme = if secure { "wss" } else { "ws" };
    let url = Url::parse(&format!("{}://{}/ws/client/{}", scheme, endpoint, pairing_code))
        .map_err(|e| malformed(e.to_string()))?;
    if url.host_str().is_none() {
        return Err(malformed("missing host".to_string()));
    }
    Ok(url)
}

/// Maps a handshake failure to a connection error with distinguishing text.
fn describe_handshake_error(err: WsError) -> ProtocolError {
    match err {
        WsError::Http(response) => {
            let status = response.status();
            match status.as_u16() {
                403 | 404 => ProtocolError::ConnectionFailed(format!(
                    "relay rejected pairing code (HTTP {})",
                    status
                )),
                _ => ProtocolError::ConnectionFailed(format!(
                    "relay refused upgrade (HTTP {})",
                    status
                )),
            }
        }
        WsError::Io(io_err) => {
            ProtocolError::ConnectionFailed(format!("could not reach relay: {}", io_err))
        }
        WsError::Url(url_err) => {
            ProtocolError::ConnectionFailed(format!("malformed relay endpoint: {}", url_err))
        }
        other => ProtocolError::ConnectionFailed(format!("websocket upgrade failed: {}", other)),
    }
}

/// Closes an outbound queue and fails every frame still waiting in it.
fn fail_pending(outbound: &mut mpsc::Receiver<OutboundFrame>, reason: &str) {
    outbound.close();
    while let Ok(OutboundFrame { done, .. }) = outbound.try_recv() {
        let _ = done.send(Err(ProtocolError::ConnectionClosed(reason.to_string())));
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Inner {
    config: RelayClientConfig,
    state: Arc<ConnectionStateManager>,
    /// Local key pair and the pinned remote public key.
    keys: RwLock<Option<(KeyPair, PublicKey)>>,
    auto_reconnect: AtomicBool,
    disposed: AtomicBool,
    /// Present only while a transport is open.
    outbound: Mutex<Option<mpsc::Sender<OutboundFrame>>>,
    target: Mutex<Option<RelayTarget>>,
    /// Serializes connect, disconnect, reconnect and dispose.
    session: tokio::sync::Mutex<Option<Session>>,
    messages: Mutex<Option<broadcast::Sender<Envelope>>>,
    errors: Mutex<Option<broadcast::Sender<ErrorEvent>>>,
    shutdown: CancellationToken,
}

impl Inner {
    fn publish_error(&self, kind: ErrorKind, message: String) {
        if let Some(tx) = lock(&self.errors).as_ref() {
            let _ = tx.send(ErrorEvent {
                kind,
                message,
                at: Utc::now(),
            });
        }
    }

    /// Moves to the error state and reports the failure.
    fn record_failure(&self, err: &ProtocolError) {
        tracing::warn!(error = %err, "relay connection failed");
        self.state
            .transition(ConnectionState::Error, Some(err.to_string()));
        self.publish_error(err.kind(), err.to_string());
    }

    fn install_outbound(&self) -> mpsc::Receiver<OutboundFrame> {
        let (tx, rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        *lock(&self.outbound) = Some(tx);
        rx
    }

    fn clear_outbound(&self) {
        lock(&self.outbound).take();
    }

    /// Performs the WebSocket handshake for `target`.
    async fn open_transport(&self, target: &RelayTarget) -> Result<WsStream> {
        let url = build_relay_url(&target.endpoint, &target.pairing_code, self.config.secure)?;
        tracing::info!(endpoint = %target.endpoint, secure = self.config.secure, "connecting to relay");

        let (ws, response) = tokio::time::timeout(self.config.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                ProtocolError::Timeout(format!(
                    "relay handshake did not complete within {:?}",
                    self.config.connect_timeout
                ))
            })?
            .map_err(describe_handshake_error)?;

        tracing::debug!(status = %response.status(), "relay handshake complete");
        Ok(ws)
    }

    /// Connects to `target` and starts the session task.
    async fn establish(self: &Arc<Self>, session: &mut Option<Session>, target: RelayTarget) -> Result<()> {
        self.state.transition(ConnectionState::Connecting, None);

        let opened = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(ProtocolError::Disposed),
            opened = self.open_transport(&target) => opened,
        };
        let ws = match opened {
            Ok(ws) => ws,
            Err(e) => {
                self.record_failure(&e);
                return Err(e);
            }
        };

        let outbound = self.install_outbound();
        self.state.transition(ConnectionState::Connected, None);
        tracing::info!(endpoint = %target.endpoint, "connected to relay");

        let cancel = self.shutdown.child_token();
        let task = tokio::spawn(Arc::clone(self).run_session(ws, outbound, cancel.clone()));
        *session = Some(Session { cancel, task });
        Ok(())
    }

    /// Cancels the session task, if any, and waits for it to finish.
    async fn stop_session(&self, session: &mut Option<Session>) {
        if let Some(Session { cancel, mut task }) = session.take() {
            cancel.cancel();
            match tokio::time::timeout(SESSION_STOP_TIMEOUT, &mut task).await {
                Ok(Err(e)) if e.is_panic() => {
                    tracing::error!(error = %e, "relay session task panicked");
                }
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!("relay session task did not stop in time, aborting");
                    task.abort();
                }
            }
        }
        self.clear_outbound();
    }

    /// Serves connections until cancelled, reconnecting after losses.
    async fn run_session(
        self: Arc<Self>,
        mut ws: WsStream,
        mut outbound: mpsc::Receiver<OutboundFrame>,
        cancel: CancellationToken,
    ) {
        loop {
            let reason = match self.serve(ws, &mut outbound, &cancel).await {
                SessionEnd::Cancelled => return,
                SessionEnd::Lost(reason) => reason,
            };
            self.clear_outbound();
            fail_pending(&mut outbound, &reason);
            tracing::warn!(%reason, "relay connection lost");
            self.publish_error(ErrorKind::Connection, format!("connection lost: {}", reason));

            if !self.auto_reconnect.load(Ordering::SeqCst) {
                self.state
                    .transition(ConnectionState::Disconnected, Some(reason));
                return;
            }

            self.state
                .transition(ConnectionState::Reconnecting, Some(reason.clone()));
            match self.reconnect_with_backoff(reason, &cancel).await {
                Some((new_ws, new_outbound)) => {
                    ws = new_ws;
                    outbound = new_outbound;
                }
                None => return,
            }
        }
    }

    /// Retries the stored target with exponential backoff.
    ///
    /// Returns `None` when cancelled, when auto-reconnect was switched off,
    /// or after the policy's attempts are exhausted.
    async fn reconnect_with_backoff(
        &self,
        mut last_error: String,
        cancel: &CancellationToken,
    ) -> Option<(WsStream, mpsc::Receiver<OutboundFrame>)> {
        let Some(target) = lock(&self.target).clone() else {
            self.state.transition(
                ConnectionState::Error,
                Some("no relay target to reconnect to".to_string()),
            );
            return None;
        };
        let policy = self.config.reconnect;

        for attempt in 1..=policy.max_attempts {
            let delay = policy.delay_for_attempt(attempt);
            tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            if !self.auto_reconnect.load(Ordering::SeqCst) {
                tracing::info!("auto-reconnect disabled, giving up");
                self.state
                    .transition(ConnectionState::Disconnected, Some(last_error));
                return None;
            }

            self.state.transition(ConnectionState::Connecting, None);
            let opened = tokio::select! {
                _ = cancel.cancelled() => return None,
                opened = self.open_transport(&target) => opened,
            };

            match opened {
                Ok(ws) => {
                    let outbound = self.install_outbound();
                    self.state.transition(ConnectionState::Connected, None);
                    tracing::info!(attempt, "reconnected to relay");
                    return Some((ws, outbound));
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "reconnect attempt failed");
                    self.publish_error(e.kind(), e.to_string());
                    last_error = e.to_string();
                    if policy.allows(attempt) {
                        self.state
                            .transition(ConnectionState::Reconnecting, Some(last_error.clone()));
                    }
                }
            }
        }

        let message = format!(
            "reconnect failed after {} attempts: {}",
            policy.max_attempts, last_error
        );
        tracing::error!(attempts = policy.max_attempts, error = %last_error, "giving up on relay");
        self.state
            .transition(ConnectionState::Error, Some(message.clone()));
        self.publish_error(ErrorKind::Connection, message);
        None
    }

    /// Pumps one open connection until it is cancelled or lost.
    async fn serve(
        &self,
        ws: WsStream,
        outbound: &mut mpsc::Receiver<OutboundFrame>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();

        // interval_at panics on a zero period
        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_pong = Instant::now();
        // A write that cannot finish within one heartbeat budget means the
        // peer has stopped reading.
        let write_budget = self.config.heartbeat_interval + self.config.heartbeat_timeout;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
                    return SessionEnd::Cancelled;
                }

                frame = outbound.recv() => {
                    let Some(OutboundFrame { text, done }) = frame else {
                        let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
                        return SessionEnd::Cancelled;
                    };
                    let written = tokio::select! {
                        _ = cancel.cancelled() => {
                            let _ = done.send(Err(ProtocolError::ConnectionClosed(
                                "client disconnected before the frame was written".to_string(),
                            )));
                            return SessionEnd::Cancelled;
                        }
                        written = tokio::time::timeout(write_budget, sink.send(WsMessage::Text(text))) => written,
                    };
                    let reason = match written {
                        Ok(Ok(())) => {
                            let _ = done.send(Ok(()));
                            continue;
                        }
                        Ok(Err(e)) => format!("write failed: {}", e),
                        Err(_) => format!("write stalled for {:?}", write_budget),
                    };
                    let _ = done.send(Err(ProtocolError::ConnectionClosed(reason.clone())));
                    return SessionEnd::Lost(reason);
                }

                _ = heartbeat.tick() => {
                    if last_pong.elapsed() > self.config.heartbeat_interval + self.config.heartbeat_timeout {
                        return SessionEnd::Lost("heartbeat timeout".to_string());
                    }
                    let pinged = tokio::select! {
                        _ = cancel.cancelled() => return SessionEnd::Cancelled,
                        pinged = tokio::time::timeout(write_budget, sink.send(WsMessage::Ping(Vec::new()))) => pinged,
                    };
                    match pinged {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => return SessionEnd::Lost(format!("ping failed: {}", e)),
                        Err(_) => return SessionEnd::Lost("heartbeat timeout".to_string()),
                    }
                    tracing::trace!("sent heartbeat ping");
                }

                incoming = stream.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => self.dispatch(&text),
                    Some(Ok(WsMessage::Pong(_))) => {
                        last_pong = Instant::now();
                        tracing::trace!("received heartbeat pong");
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        let reason = match frame {
                            Some(frame) => format!(
                                "relay closed connection ({} {})",
                                u16::from(frame.code),
                                frame.reason
                            ),
                            None => "relay closed connection".to_string(),
                        };
                        return SessionEnd::Lost(reason);
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        tracing::warn!(len = data.len(), "ignoring binary frame from relay");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Lost(format!("transport error: {}", e)),
                    None => return SessionEnd::Lost("transport closed".to_string()),
                },
            }
        }
    }

    /// Parses one inbound text frame and publishes it.
    fn dispatch(&self, text: &str) {
        match Envelope::from_json(text) {
            Ok(envelope) => {
                tracing::debug!(message_type = %envelope.message_type(), "received envelope");
                if let Some(tx) = lock(&self.messages).as_ref() {
                    // No subscribers is fine.
                    let _ = tx.send(envelope);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable frame");
                self.publish_error(e.kind(), format!("undecodable frame: {}", e));
            }
        }
    }
}

/// Client for exchanging sealed messages with a peer through the relay.
///
/// All methods fail with [`ProtocolError::Disposed`] once [`RelayClient::dispose`]
/// has been called.
pub struct RelayClient {
    inner: Arc<Inner>,
}

impl RelayClient {
    /// Creates a disconnected client.
    pub fn new(config: RelayClientConfig) -> Self {
        let (messages, _) = broadcast::channel(MESSAGE_CHANNEL_CAPACITY);
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        let auto_reconnect = config.auto_reconnect;

        Self {
            inner: Arc::new(Inner {
                config,
                state: Arc::new(ConnectionStateManager::new()),
                keys: RwLock::new(None),
                auto_reconnect: AtomicBool::new(auto_reconnect),
                disposed: AtomicBool::new(false),
                outbound: Mutex::new(None),
                target: Mutex::new(None),
                session: tokio::sync::Mutex::new(None),
                messages: Mutex::new(Some(messages)),
                errors: Mutex::new(Some(errors)),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn ensure_not_disposed(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            Err(ProtocolError::Disposed)
        } else {
            Ok(())
        }
    }

    /// The state manager observing this client.
    pub fn state_manager(&self) -> &Arc<ConnectionStateManager> {
        &self.inner.state
    }

    /// Shorthand for `state_manager().state()`.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.state()
    }

    /// Connects to the relay at `endpoint` (`host:port`) for `pairing_code`.
    ///
    /// Fails with a state error if already connected or connecting. On
    /// handshake failure the client moves to the error state, an
    /// [`ErrorEvent`] is published and the error is returned.
    pub async fn connect(&self, endpoint: &str, pairing_code: &str) -> Result<()> {
        self.ensure_not_disposed()?;
        validate_pairing_code(pairing_code)?;

        let mut session = self.inner.session.lock().await;
        self.ensure_not_disposed()?;

        let state = self.inner.state.state();
        if matches!(
            state,
            ConnectionState::Connected | ConnectionState::Connecting | ConnectionState::Reconnecting
        ) {
            return Err(ProtocolError::InvalidState(format!(
                "cannot connect while {}; disconnect first",
                state
            )));
        }

        self.inner.stop_session(&mut session).await;
        let target = RelayTarget {
            endpoint: endpoint.to_string(),
            pairing_code: pairing_code.to_string(),
        };
        *lock(&self.inner.target) = Some(target.clone());
        self.inner.establish(&mut session, target).await
    }

    /// Closes the connection, cancels any pending reconnect and clears the
    /// error message.
    pub async fn disconnect(&self) -> Result<()> {
        self.ensure_not_disposed()?;
        let mut session = self.inner.session.lock().await;
        self.inner.stop_session(&mut session).await;
        self.inner
            .state
            .transition(ConnectionState::Disconnected, None);
        tracing::info!("disconnected from relay");
        Ok(())
    }

    /// Re-establishes the connection to the last endpoint and pairing code.
    pub async fn reconnect(&self) -> Result<()> {
        self.ensure_not_disposed()?;
        let mut session = self.inner.session.lock().await;
        self.ensure_not_disposed()?;

        let target = lock(&self.inner.target).clone().ok_or_else(|| {
            ProtocolError::InvalidState("no previous connection to re-establish".to_string())
        })?;
        self.inner.stop_session(&mut session).await;
        self.inner.establish(&mut session, target).await
    }

    /// Sets the local key pair and pins the remote peer's public key.
    pub fn set_keys(&self, local: KeyPair, remote: PublicKey) -> Result<()> {
        self.ensure_not_disposed()?;
        tracing::debug!(local = ?local.public_key(), remote = ?remote, "keys updated");
        *self
            .inner
            .keys
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some((local, remote));
        Ok(())
    }

    /// The local public key, if keys are set.
    pub fn local_public_key(&self) -> Option<PublicKey> {
        read(&self.inner.keys)
            .as_ref()
            .map(|(local, _)| *local.public_key())
    }

    /// The pinned remote public key, if keys are set.
    pub fn remote_public_key(&self) -> Option<PublicKey> {
        read(&self.inner.keys).as_ref().map(|(_, remote)| *remote)
    }

    /// Enables or disables automatic reconnection.
    ///
    /// Disabling takes effect before the next scheduled attempt.
    pub fn set_auto_reconnect(&self, enabled: bool) -> Result<()> {
        self.ensure_not_disposed()?;
        self.inner.auto_reconnect.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    pub fn auto_reconnect(&self) -> bool {
        self.inner.auto_reconnect.load(Ordering::SeqCst)
    }

    /// Seals `payload` and writes it to the relay as one text frame.
    ///
    /// Resolves once the frame has been written to the transport.
    pub async fn send<T>(&self, message_type: MessageType, payload: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.ensure_not_disposed()?;

        let (sender, envelope) = {
            let keys = read(&self.inner.keys);
            let (local, remote) = keys.as_ref().ok_or_else(|| {
                ProtocolError::InvalidState("keys not set; call set_keys first".to_string())
            })?;
            let sender = lock(&self.inner.outbound)
                .clone()
                .ok_or_else(|| ProtocolError::InvalidState("transport is not open".to_string()))?;
            (sender, Envelope::seal(message_type, payload, local, remote)?)
        };

        let (done, written) = oneshot::channel();
        sender
            .send(OutboundFrame {
                text: envelope.to_json()?,
                done,
            })
            .await
            .map_err(|_| ProtocolError::ConnectionClosed("transport closed before send".to_string()))?;

        written.await.map_err(|_| {
            ProtocolError::ConnectionClosed("transport closed before the frame was written".to_string())
        })??;

        tracing::debug!(%message_type, "sent envelope");
        Ok(())
    }

    /// Sends keystrokes or a command line.
    pub async fn send_terminal_input(&self, input: &str) -> Result<()> {
        self.send(
            MessageType::TerminalInput,
            &TerminalInput {
                input: input.to_string(),
            },
        )
        .await
    }

    /// Sends a terminal size change.
    pub async fn send_resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.send(MessageType::Resize, &Resize { cols, rows }).await
    }

    /// Sends a pairing request carrying the local public key.
    pub async fn send_pairing_request(
        &self,
        pairing_code: &str,
        device_name: Option<&str>,
    ) -> Result<()> {
        let public_key = self.local_public_key().ok_or_else(|| {
            ProtocolError::InvalidState("keys not set; call set_keys first".to_string())
        })?;
        self.send(
            MessageType::PairingRequest,
            &PairingRequest {
                pairing_code: pairing_code.to_string(),
                public_key: public_key.to_base64(),
                device_name: device_name.map(str::to_string),
            },
        )
        .await
    }

    /// Sends one chunk of captured audio.
    pub async fn send_audio_frame(&self, sequence: u64, audio: &[u8]) -> Result<()> {
        self.send(
            MessageType::VoiceAudioFrame,
            &VoiceAudioFrame::from_bytes(sequence, audio),
        )
        .await
    }

    /// Sends a voice session control command.
    pub async fn send_voice_control(&self, action: VoiceAction) -> Result<()> {
        self.send(MessageType::VoiceControl, &VoiceControl { action })
            .await
    }

    /// Subscribes to every inbound envelope.
    pub fn subscribe(&self) -> Result<broadcast::Receiver<Envelope>> {
        self.ensure_not_disposed()?;
        lock(&self.inner.messages)
            .as_ref()
            .map(broadcast::Sender::subscribe)
            .ok_or(ProtocolError::Disposed)
    }

    /// Inbound envelopes of one type.
    ///
    /// Every stream sees every matching envelope. Envelopes are not
    /// decrypted; call [`RelayClient::open`] on the ones you need.
    pub fn messages_by_type(&self, message_type: MessageType) -> Result<MessageStream> {
        let stream = BroadcastStream::new(self.subscribe()?).filter_map(move |item| {
            let matched = match item {
                Ok(envelope) if envelope.message_type() == message_type => Some(envelope),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(%message_type, skipped, "message subscriber lagging, frames dropped");
                    None
                }
            };
            future::ready(matched)
        });
        Ok(Box::pin(stream))
    }

    /// Connection failures, unexpected closes and undecodable frames.
    pub fn errors(&self) -> Result<ErrorStream> {
        self.ensure_not_disposed()?;
        let rx = lock(&self.inner.errors)
            .as_ref()
            .map(broadcast::Sender::subscribe)
            .ok_or(ProtocolError::Disposed)?;
        let stream = BroadcastStream::new(rx).filter_map(|item| future::ready(item.ok()));
        Ok(Box::pin(stream))
    }

    /// Opens an inbound envelope with the local key pair and pinned peer key.
    ///
    /// An envelope whose `sender_public_key` is not the pinned key is
    /// rejected with a crypto error.
    pub fn open(&self, envelope: &Envelope) -> Result<Payload> {
        self.ensure_not_disposed()?;
        let keys = read(&self.inner.keys);
        let (local, remote) = keys.as_ref().ok_or_else(|| {
            ProtocolError::InvalidState("keys not set; call set_keys first".to_string())
        })?;

        if envelope.sender_public_key() != remote {
            return Err(ProtocolError::Decryption(format!(
                "sender key {} does not match pinned peer key {}",
                envelope.sender_public_key().fingerprint(),
                remote.fingerprint()
            )));
        }
        envelope.open(local, remote)
    }

    /// Like [`RelayClient::open`], deserializing into a typed payload.
    pub fn open_as<T: DeserializeOwned>(&self, envelope: &Envelope) -> Result<T> {
        let payload = self.open(envelope)?;
        Ok(serde_json::from_value(serde_json::Value::Object(payload))?)
    }

    /// Shuts the client down: cancels reconnection, closes the transport and
    /// ends every stream. Later calls fail with [`ProtocolError::Disposed`].
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();

        let mut session = self.inner.session.lock().await;
        self.inner.stop_session(&mut session).await;
        self.inner
            .state
            .transition(ConnectionState::Disconnected, None);

        lock(&self.inner.messages).take();
        lock(&self.inner.errors).take();
        tracing::info!("relay client disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("state", &self.inner.state.state())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
