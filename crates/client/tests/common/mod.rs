//! In-process mock relay for integration tests.
//!
//! Accepts WebSocket upgrades on `/ws/client/{code}` for a fixed set of
//! pairing codes (anything else gets HTTP 403), records the text frames
//! clients send, and can push frames, drop every connection without a
//! close handshake, stop answering pings, or shut its listener down.

#![allow(dead_code)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use relay_client::{ConnectionState, RelayClient};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

/// Control signals fanned out to every live connection.
#[derive(Debug, Clone, Copy)]
enum Control {
    /// Drop the socket without a close frame.
    Drop,
    /// Stop reading (and so stop answering pings) until dropped.
    Stall,
}

struct Shared {
    codes: HashSet<String>,
    control: broadcast::Sender<Control>,
    push: broadcast::Sender<String>,
    received: mpsc::UnboundedSender<String>,
    accepted: AtomicUsize,
    active: AtomicUsize,
    shutdown: CancellationToken,
}

pub struct MockRelay {
    addr: SocketAddr,
    shared: Arc<Shared>,
    received: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl MockRelay {
    /// Starts a relay on an ephemeral localhost port accepting `codes`.
    pub async fn start(codes: &[&str]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (control, _) = broadcast::channel(16);
        let (push, _) = broadcast::channel(64);
        let (received_tx, received_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            codes: codes.iter().map(|c| c.to_string()).collect(),
            control,
            push,
            received: received_tx,
            accepted: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
        });

        let accept_shared = shared.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_shared.shutdown.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { continue };
                        tokio::spawn(handle_connection(stream, accept_shared.clone()));
                    }
                }
            }
        });

        Self {
            addr,
            shared,
            received: tokio::sync::Mutex::new(received_rx),
            accept_task: Mutex::new(Some(accept_task)),
        }
    }

    /// `host:port` to hand to `RelayClient::connect`.
    pub fn endpoint(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    /// Total upgrades accepted so far.
    pub fn accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// Connections currently open.
    pub fn active(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Sends a text frame to every connected client.
    pub fn push(&self, text: impl Into<String>) {
        let _ = self.shared.push.send(text.into());
    }

    /// Drops every live connection without a close handshake.
    pub fn drop_connections(&self) {
        let _ = self.shared.control.send(Control::Drop);
    }

    /// Makes every live connection stop answering pings.
    pub fn stall_connections(&self) {
        let _ = self.shared.control.send(Control::Stall);
    }

    /// Closes the listener and every connection, then waits for the accept
    /// loop to exit so the port refuses new connections.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let task = self.accept_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Next text frame received from any client.
    pub async fn next_received(&self) -> String {
        let mut received = self.received.lock().await;
        tokio::time::timeout(Duration::from_secs(5), received.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("relay channel closed")
    }

    /// Waits until `count` upgrades have been accepted.
    pub async fn wait_for_accepted(&self, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.accepted() < count {
            assert!(Instant::now() < deadline, "relay never reached {} connections", count);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Waits until no connections remain open.
    pub async fn wait_for_idle(&self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.active() > 0 {
            assert!(Instant::now() < deadline, "relay connections never closed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

async fn handle_connection(stream: TcpStream, shared: Arc<Shared>) {
    let codes = shared.codes.clone();
    let check_code = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match request.uri().path().strip_prefix("/ws/client/") {
            Some(code) if codes.contains(code) => Ok(response),
            _ => {
                let mut rejection = ErrorResponse::new(Some("unknown pairing code".to_string()));
                *rejection.status_mut() = StatusCode::FORBIDDEN;
                Err(rejection)
            }
        }
    };

    let Ok(ws) = accept_hdr_async(stream, check_code).await else {
        return;
    };

    let (mut sink, mut stream) = ws.split();
    let mut control = shared.control.subscribe();
    let mut push = shared.push.subscribe();
    shared.active.fetch_add(1, Ordering::SeqCst);
    shared.accepted.fetch_add(1, Ordering::SeqCst);

    let mut stalled = false;
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            signal = control.recv() => match signal {
                Ok(Control::Drop) | Err(_) => break,
                Ok(Control::Stall) => stalled = true,
            },
            frame = push.recv(), if !stalled => {
                let Ok(text) = frame else { continue };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = stream.next(), if !stalled => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let _ = shared.received.send(text);
                }
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }

    shared.active.fetch_sub(1, Ordering::SeqCst);
    // Dropping both halves closes the TCP stream with no close frame.
}

/// Records every state the client's manager transitions to.
pub fn record_states(client: &RelayClient) -> Arc<Mutex<Vec<ConnectionState>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    client
        .state_manager()
        .add_listener(move |snapshot| sink.lock().unwrap().push(snapshot.state));
    seen
}

/// Records every transition with the time it was observed.
pub fn record_timed_states(client: &RelayClient) -> Arc<Mutex<Vec<(ConnectionState, Instant)>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    client
        .state_manager()
        .add_listener(move |snapshot| sink.lock().unwrap().push((snapshot.state, Instant::now())));
    seen
}

/// Waits until the client reaches `state`.
pub async fn wait_for_state(client: &RelayClient, state: ConnectionState, within: Duration) {
    let deadline = Instant::now() + within;
    while client.state() != state {
        assert!(
            Instant::now() < deadline,
            "client stuck in {} waiting for {}",
            client.state(),
            state
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Waits until `seen` holds at least `count` entries.
pub async fn wait_for_transitions<T>(seen: &Arc<Mutex<Vec<T>>>, count: usize, within: Duration) {
    let deadline = Instant::now() + within;
    while seen.lock().unwrap().len() < count {
        assert!(
            Instant::now() < deadline,
            "only {} of {} transitions observed",
            seen.lock().unwrap().len(),
            count
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
