//! End-to-end tests against an in-process relay.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{record_states, record_timed_states, wait_for_state, wait_for_transitions, MockRelay};
use futures_util::StreamExt;
use protocol::messages::{TerminalInput, TerminalOutput};
use protocol::{Envelope, ErrorKind, KeyPair, MessageType, ProtocolError};
use relay_client::{ConnectionState, ReconnectPolicy, RelayClient, RelayClientConfig};

const CODE: &str = "TEST01";

fn fast_reconnect(base_ms: u64, max_ms: u64, attempts: u32) -> RelayClientConfig {
    RelayClientConfig::default()
        .with_connect_timeout(Duration::from_secs(2))
        .with_reconnect_policy(ReconnectPolicy::new(
            Duration::from_millis(base_ms),
            Duration::from_millis(max_ms),
            attempts,
        ))
}

/// A client with keys set, plus the host key pair it is paired with.
fn paired_client(config: RelayClientConfig) -> (RelayClient, KeyPair) {
    let host = KeyPair::generate();
    let client = RelayClient::new(config);
    client
        .set_keys(KeyPair::generate(), *host.public_key())
        .unwrap();
    (client, host)
}

/// Seals a frame as the host would send it to `client`.
fn host_frame(host: &KeyPair, client: &RelayClient, message_type: MessageType, payload: serde_json::Value) -> String {
    let recipient = client.local_public_key().unwrap();
    Envelope::seal(message_type, &payload, host, &recipient)
        .unwrap()
        .to_json()
        .unwrap()
}

#[tokio::test]
async fn test_connect_reports_connecting_then_connected() {
    let relay = MockRelay::start(&[CODE]).await;
    let (client, _host) = paired_client(fast_reconnect(100, 1000, 3));
    let states = record_states(&client);

    assert_eq!(client.state(), ConnectionState::Disconnected);
    client.connect(&relay.endpoint(), CODE).await.unwrap();

    assert_eq!(client.state(), ConnectionState::Connected);
    assert!(client.state_manager().error_message().is_none());
    assert_eq!(
        *states.lock().unwrap(),
        vec![ConnectionState::Connecting, ConnectionState::Connected]
    );

    client.dispose().await;
    relay.wait_for_idle().await;
    assert!(matches!(
        client.send_terminal_input("ls").await,
        Err(ProtocolError::Disposed)
    ));
}

#[tokio::test]
async fn test_sent_input_reaches_host_intact() {
    let relay = MockRelay::start(&[CODE]).await;
    let (client, host) = paired_client(fast_reconnect(100, 1000, 3));
    client.connect(&relay.endpoint(), CODE).await.unwrap();

    client.send_terminal_input("ls -la").await.unwrap();

    let frame = relay.next_received().await;
    let envelope = Envelope::from_json(&frame).unwrap();
    assert_eq!(envelope.message_type(), MessageType::TerminalInput);
    assert_eq!(envelope.sender_public_key(), &client.local_public_key().unwrap());

    let sender = *envelope.sender_public_key();
    let input: TerminalInput = envelope.open_as(&host, &sender).unwrap();
    assert_eq!(input.input, "ls -la");

    client.dispose().await;
}

#[tokio::test]
async fn test_sends_arrive_in_order() {
    let relay = MockRelay::start(&[CODE]).await;
    let (client, host) = paired_client(fast_reconnect(100, 1000, 3));
    client.connect(&relay.endpoint(), CODE).await.unwrap();

    for i in 0..5 {
        client.send_terminal_input(&format!("line {}", i)).await.unwrap();
    }

    let sender = client.local_public_key().unwrap();
    for i in 0..5 {
        let envelope = Envelope::from_json(&relay.next_received().await).unwrap();
        let input: TerminalInput = envelope.open_as(&host, &sender).unwrap();
        assert_eq!(input.input, format!("line {}", i));
    }

    client.dispose().await;
}

#[tokio::test]
async fn test_inbound_envelopes_fan_out_by_type() {
    let relay = MockRelay::start(&[CODE]).await;
    let (client, host) = paired_client(fast_reconnect(100, 1000, 3));
    let mut first = client.messages_by_type(MessageType::TerminalOutput).unwrap();
    let mut second = client.messages_by_type(MessageType::TerminalOutput).unwrap();
    let mut resizes = client.messages_by_type(MessageType::Resize).unwrap();

    client.connect(&relay.endpoint(), CODE).await.unwrap();
    relay.wait_for_accepted(1).await;
    relay.push(host_frame(
        &host,
        &client,
        MessageType::TerminalOutput,
        serde_json::json!({"output": "total 0\n"}),
    ));

    let timeout = Duration::from_secs(5);
    for stream in [&mut first, &mut second] {
        let envelope = tokio::time::timeout(timeout, stream.next())
            .await
            .unwrap()
            .unwrap();
        let output: TerminalOutput = client.open_as(&envelope).unwrap();
        assert_eq!(output.output, "total 0\n");
    }

    assert!(
        tokio::time::timeout(Duration::from_millis(200), resizes.next())
            .await
            .is_err(),
        "resize subscriber saw a terminal output frame"
    );

    client.dispose().await;
}

#[tokio::test]
async fn test_undecodable_frame_is_reported_and_skipped() {
    let relay = MockRelay::start(&[CODE]).await;
    let (client, host) = paired_client(fast_reconnect(100, 1000, 3));
    let mut errors = client.errors().unwrap();
    let mut output = client.messages_by_type(MessageType::TerminalOutput).unwrap();

    client.connect(&relay.endpoint(), CODE).await.unwrap();
    relay.wait_for_accepted(1).await;
    relay.push("not json");
    relay.push(host_frame(
        &host,
        &client,
        MessageType::TerminalOutput,
        serde_json::json!({"output": "still here"}),
    ));

    let timeout = Duration::from_secs(5);
    let event = tokio::time::timeout(timeout, errors.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, ErrorKind::Format);

    let envelope = tokio::time::timeout(timeout, output.next())
        .await
        .unwrap()
        .unwrap();
    let payload: TerminalOutput = client.open_as(&envelope).unwrap();
    assert_eq!(payload.output, "still here");
    assert_eq!(client.state(), ConnectionState::Connected);

    client.dispose().await;
}

#[tokio::test]
async fn test_rejected_pairing_code_enters_error_state() {
    let relay = MockRelay::start(&[CODE]).await;
    let (client, _host) = paired_client(fast_reconnect(100, 1000, 3));
    let mut errors = client.errors().unwrap();

    let err = client.connect(&relay.endpoint(), "WRONG1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert!(err.to_string().contains("rejected pairing code"), "{}", err);

    assert_eq!(client.state(), ConnectionState::Error);
    assert!(client.state_manager().has_error());
    assert!(client
        .state_manager()
        .error_message()
        .unwrap()
        .contains("rejected pairing code"));

    let event = errors.next().await.unwrap();
    assert_eq!(event.kind, ErrorKind::Connection);
    assert_eq!(relay.accepted(), 0);

    client.dispose().await;
}

#[tokio::test]
async fn test_connect_to_closed_port_fails() {
    let relay = MockRelay::start(&[CODE]).await;
    let endpoint = relay.endpoint();
    relay.shutdown().await;

    let (client, _host) = paired_client(fast_reconnect(100, 1000, 3));
    let err = client.connect(&endpoint, CODE).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert_eq!(client.state(), ConnectionState::Error);

    client.dispose().await;
}

#[tokio::test]
async fn test_abrupt_drop_reconnects() {
    let relay = MockRelay::start(&[CODE]).await;
    let (client, _host) = paired_client(fast_reconnect(100, 1000, 5));
    let states = record_states(&client);
    let mut errors = client.errors().unwrap();

    client.connect(&relay.endpoint(), CODE).await.unwrap();
    relay.wait_for_accepted(1).await;
    relay.drop_connections();

    wait_for_transitions(&states, 5, Duration::from_secs(5)).await;
    assert_eq!(
        *states.lock().unwrap(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]
    );
    relay.wait_for_accepted(2).await;

    let event = errors.next().await.unwrap();
    assert_eq!(event.kind, ErrorKind::Connection);
    assert!(event.message.contains("connection lost"));

    // The new transport carries traffic.
    client.send_terminal_input("after").await.unwrap();
    relay.next_received().await;

    client.dispose().await;
}

#[tokio::test]
async fn test_backoff_grows_until_attempts_exhausted() {
    let relay = MockRelay::start(&[CODE]).await;
    let (client, _host) = paired_client(fast_reconnect(100, 1000, 4));
    let states = record_timed_states(&client);

    client.connect(&relay.endpoint(), CODE).await.unwrap();
    relay.wait_for_accepted(1).await;
    relay.shutdown().await;

    wait_for_state(&client, ConnectionState::Error, Duration::from_secs(10)).await;

    let states = states.lock().unwrap().clone();
    let mut delays = Vec::new();
    for pair in states.windows(2) {
        if pair[0].0 == ConnectionState::Reconnecting && pair[1].0 == ConnectionState::Connecting {
            delays.push(pair[1].1 - pair[0].1);
        }
    }

    assert_eq!(delays.len(), 4, "transitions: {:?}", states.iter().map(|s| s.0).collect::<Vec<_>>());
    assert!(delays[0] >= Duration::from_millis(90), "{:?}", delays);
    assert!(delays[1] > delays[0], "{:?}", delays);
    assert!(delays[2] > delays[1], "{:?}", delays);
    assert!(delays[3] > delays[2], "{:?}", delays);

    assert_eq!(states.last().unwrap().0, ConnectionState::Error);
    assert!(client
        .state_manager()
        .error_message()
        .unwrap()
        .contains("after 4 attempts"));

    client.dispose().await;
}

#[tokio::test]
async fn test_drop_without_auto_reconnect_disconnects() {
    let relay = MockRelay::start(&[CODE]).await;
    let (client, _host) = paired_client(fast_reconnect(100, 1000, 3).with_auto_reconnect(false));
    let states = record_states(&client);

    client.connect(&relay.endpoint(), CODE).await.unwrap();
    relay.wait_for_accepted(1).await;
    relay.drop_connections();

    wait_for_state(&client, ConnectionState::Disconnected, Duration::from_secs(5)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(!states.lock().unwrap().contains(&ConnectionState::Reconnecting));
    assert!(client.state_manager().error_message().is_some());
    assert_eq!(relay.accepted(), 1);

    client.dispose().await;
}

#[tokio::test]
async fn test_disabling_auto_reconnect_during_backoff() {
    let relay = MockRelay::start(&[CODE]).await;
    let (client, _host) = paired_client(fast_reconnect(300, 1000, 5));
    let states = record_states(&client);

    client.connect(&relay.endpoint(), CODE).await.unwrap();
    relay.wait_for_accepted(1).await;
    relay.drop_connections();

    wait_for_state(&client, ConnectionState::Reconnecting, Duration::from_secs(5)).await;
    client.set_auto_reconnect(false).unwrap();

    wait_for_state(&client, ConnectionState::Disconnected, Duration::from_secs(5)).await;
    let states = states.lock().unwrap().clone();
    assert_eq!(
        states.iter().filter(|s| **s == ConnectionState::Connecting).count(),
        1,
        "{:?}",
        states
    );
    assert_eq!(relay.accepted(), 1);

    client.dispose().await;
}

#[tokio::test]
async fn test_disconnect_cancels_pending_reconnect() {
    let relay = MockRelay::start(&[CODE]).await;
    let (client, _host) = paired_client(fast_reconnect(200, 1000, 5));

    client.connect(&relay.endpoint(), CODE).await.unwrap();
    relay.wait_for_accepted(1).await;
    relay.drop_connections();

    wait_for_state(&client, ConnectionState::Reconnecting, Duration::from_secs(5)).await;
    assert!(client.state_manager().error_message().is_some());

    client.disconnect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(client.state_manager().error_message().is_none());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(relay.accepted(), 1);

    client.dispose().await;
}

#[tokio::test]
async fn test_connect_while_connected_is_state_error() {
    let relay = MockRelay::start(&[CODE]).await;
    let (client, _host) = paired_client(fast_reconnect(100, 1000, 3));
    client.connect(&relay.endpoint(), CODE).await.unwrap();

    let err = client.connect(&relay.endpoint(), CODE).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
    assert_eq!(client.state(), ConnectionState::Connected);

    client.dispose().await;
}

#[tokio::test]
async fn test_disconnect_then_reconnect_uses_last_target() {
    let relay = MockRelay::start(&[CODE]).await;
    let (client, _host) = paired_client(fast_reconnect(100, 1000, 3));
    client.connect(&relay.endpoint(), CODE).await.unwrap();

    client.disconnect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    relay.wait_for_idle().await;

    client.reconnect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
    relay.wait_for_accepted(2).await;

    client.send_terminal_input("again").await.unwrap();
    relay.next_received().await;

    client.dispose().await;
}

#[tokio::test]
async fn test_dispose_closes_transport_and_ends_streams() {
    let relay = MockRelay::start(&[CODE]).await;
    let (client, _host) = paired_client(fast_reconnect(100, 1000, 3));
    let mut output = client.messages_by_type(MessageType::TerminalOutput).unwrap();
    let mut errors = client.errors().unwrap();

    client.connect(&relay.endpoint(), CODE).await.unwrap();
    relay.wait_for_accepted(1).await;

    client.dispose().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    relay.wait_for_idle().await;

    assert!(output.next().await.is_none());
    assert!(errors.next().await.is_none());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(relay.accepted(), 1);
}

#[tokio::test]
async fn test_missed_pongs_trigger_reconnect() {
    let relay = MockRelay::start(&[CODE]).await;
    let config = fast_reconnect(5_000, 10_000, 3)
        .with_heartbeat(Duration::from_millis(100), Duration::from_millis(100));
    let (client, _host) = paired_client(config);

    client.connect(&relay.endpoint(), CODE).await.unwrap();
    relay.wait_for_accepted(1).await;
    relay.stall_connections();

    wait_for_state(&client, ConnectionState::Reconnecting, Duration::from_secs(5)).await;
    assert!(client
        .state_manager()
        .error_message()
        .unwrap()
        .contains("heartbeat timeout"));

    client.dispose().await;
}

/// One input frame large enough that a peer which stops reading soon fills
/// the socket buffers.
fn bulk_input() -> String {
    "x".repeat(1 << 20)
}

/// Sends bulk frames until a send fails.
fn spawn_bulk_sender(client: &Arc<RelayClient>) -> tokio::task::JoinHandle<()> {
    let client = client.clone();
    tokio::spawn(async move {
        let input = bulk_input();
        for _ in 0..32 {
            if client.send_terminal_input(&input).await.is_err() {
                break;
            }
        }
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stalled_writes_are_declared_lost() {
    let relay = MockRelay::start(&[CODE]).await;
    let config = fast_reconnect(5_000, 10_000, 3)
        .with_heartbeat(Duration::from_millis(100), Duration::from_millis(100));
    let (client, _host) = paired_client(config);
    let client = Arc::new(client);

    client.connect(&relay.endpoint(), CODE).await.unwrap();
    relay.wait_for_accepted(1).await;
    relay.stall_connections();

    let sender = spawn_bulk_sender(&client);

    wait_for_state(&client, ConnectionState::Reconnecting, Duration::from_secs(5)).await;
    tokio::time::timeout(Duration::from_secs(5), sender)
        .await
        .expect("sender still blocked after the link was declared lost")
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), client.dispose())
        .await
        .expect("dispose did not complete");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dispose_completes_while_write_is_stalled() {
    let relay = MockRelay::start(&[CODE]).await;
    let (client, _host) = paired_client(fast_reconnect(100, 1000, 3));
    let client = Arc::new(client);

    client.connect(&relay.endpoint(), CODE).await.unwrap();
    relay.wait_for_accepted(1).await;
    relay.stall_connections();

    let sender = spawn_bulk_sender(&client);
    tokio::time::sleep(Duration::from_secs(1)).await;

    tokio::time::timeout(Duration::from_secs(5), client.dispose())
        .await
        .expect("dispose did not complete");
    assert_eq!(client.state(), ConnectionState::Disconnected);
    tokio::time::timeout(Duration::from_secs(5), sender)
        .await
        .expect("sender still blocked after dispose")
        .unwrap();
}

#[tokio::test]
async fn test_send_during_backoff_fails_fast() {
    let relay = MockRelay::start(&[CODE]).await;
    let (client, _host) = paired_client(fast_reconnect(5_000, 10_000, 3));

    client.connect(&relay.endpoint(), CODE).await.unwrap();
    relay.wait_for_accepted(1).await;
    relay.drop_connections();
    wait_for_state(&client, ConnectionState::Reconnecting, Duration::from_secs(5)).await;

    let result = tokio::time::timeout(Duration::from_secs(1), client.send_terminal_input("lost"))
        .await
        .expect("send blocked during backoff");
    assert_eq!(result.unwrap_err().kind(), ErrorKind::State);

    client.dispose().await;
}

#[tokio::test]
async fn test_state_events_are_broadcast() {
    let relay = MockRelay::start(&[CODE]).await;
    let (client, _host) = paired_client(fast_reconnect(100, 1000, 3));
    let mut events = client.state_manager().subscribe();

    client.connect(&relay.endpoint(), CODE).await.unwrap();

    let connecting = events.recv().await.unwrap();
    assert_eq!(connecting.state, ConnectionState::Connecting);
    let connected = events.recv().await.unwrap();
    assert_eq!(connected.state, ConnectionState::Connected);
    assert!(connected.changed_at >= connecting.changed_at);

    client.dispose().await;
}
