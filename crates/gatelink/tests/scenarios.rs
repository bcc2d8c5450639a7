//! Connection lifecycle scenarios driven over the in-memory transport with a
//! paused clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gatelink::heartbeat::HeartbeatConfig;
use gatelink::quality::QualityConfig;
use gatelink::queue::QueueConfig;
use gatelink::reconnect::ReconnectConfig;
use gatelink::transport::memory::{self, MemoryGateway, MemoryPeer};
use gatelink::transport::OutboundFrame;
use gatelink::{
    ClientConfig, ConnectionPhase, ErrorKind, GatewayClient, GatewayError, SendOutcome, StaticToken,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

const HOUR_MS: u64 = 3_600_000;

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

/// Quiet configuration: no heartbeats, idle timeouts or quality checks within a
/// test's lifetime, and deterministic backoff.
fn config() -> ClientConfig {
    ClientConfig::new("ws://gateway.test/ws")
        .with_reconnect(ReconnectConfig {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_ratio: 0.0,
            max_attempts: 25,
        })
        .with_heartbeat(HeartbeatConfig {
            interval_ms: HOUR_MS,
            ack_timeout_ms: 2 * HOUR_MS,
            max_missed_acks: 3,
            idle_timeout_ms: 10 * HOUR_MS,
        })
        .with_quality(QualityConfig {
            check_interval_ms: 10 * HOUR_MS,
            ..QualityConfig::default()
        })
        .with_token_timeout(Duration::from_millis(HOUR_MS))
        .with_handshake_timeout(secs(5))
}

fn spawn(config: ClientConfig) -> (GatewayClient, MemoryGateway) {
    let (connector, gateway) = memory::channel();
    let client = GatewayClient::spawn_with_connector(config, StaticToken::new("test-token"), connector)
        .expect("client should spawn");
    (client, gateway)
}

async fn connected(config: ClientConfig) -> (GatewayClient, MemoryGateway, MemoryPeer) {
    let (client, mut gateway) = spawn(config);
    client.connect().await.expect("connect should succeed");
    let peer = gateway.accept().await.expect("gateway should accept");
    (client, gateway, peer)
}

fn n_of(payload: &Value) -> u64 {
    payload["n"].as_u64().expect("payload carries n")
}

async fn recv_numbers(peer: &mut MemoryPeer, count: usize) -> Vec<u64> {
    let mut numbers = Vec::with_capacity(count);
    for _ in 0..count {
        let frame = peer.recv_event().await.expect("expected an event");
        assert_eq!(frame.event_type, "message_create");
        numbers.push(n_of(&frame.payload));
    }
    numbers
}

async fn assert_no_connection_within(gateway: &mut MemoryGateway, within: Duration) {
    assert!(
        tokio::time::timeout(within, gateway.accept()).await.is_err(),
        "unexpected connection"
    );
}

// ----------------------------------------------------------------------------
// Handshake
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_missing_credential_fails_fast_without_socket() {
    let (connector, gateway) = memory::channel();
    let client = GatewayClient::spawn_with_connector(config(), StaticToken::none(), connector)
        .expect("client should spawn");

    assert_eq!(client.connect().await, Err(GatewayError::CredentialUnavailable));

    let state = client.connection_state();
    assert!(!state.is_connecting());
    assert!(!state.is_connected());
    assert_eq!(state.phase, ConnectionPhase::Disconnected);
    assert_eq!(
        state.last_error.map(|e| e.kind),
        Some(ErrorKind::CredentialUnavailable)
    );

    // Not retried automatically.
    tokio::time::sleep(secs(600)).await;
    assert_eq!(gateway.connection_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_credential_travels_in_query() {
    let (client, _gateway, peer) = connected(config()).await;

    let pairs: Vec<(String, String)> = peer.url().query_pairs().into_owned().collect();
    assert_eq!(pairs, vec![("token".to_string(), "test-token".to_string())]);

    let state = client.connection_state();
    assert!(state.is_connected());
    assert!(state.last_connected_at.is_some());
    assert_eq!(state.reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_connect_is_idempotent_when_connected() {
    let (client, gateway, _peer) = connected(config()).await;

    client.connect().await.expect("second connect");
    client.connect().await.expect("third connect");
    assert_eq!(gateway.connection_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_connects_share_one_attempt() {
    let gate = Arc::new(Notify::new());
    let provider = {
        let gate = Arc::clone(&gate);
        move || {
            let gate = Arc::clone(&gate);
            async move {
                gate.notified().await;
                Some("slow-token".to_string())
            }
        }
    };
    let (connector, mut gateway) = memory::channel();
    let client = GatewayClient::spawn_with_connector(config(), provider, connector)
        .expect("client should spawn");

    let first = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });
    let second = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });
    client
        .wait_for_phase(ConnectionPhase::Connecting)
        .await
        .expect("connecting");
    tokio::time::sleep(secs(1)).await;

    gate.notify_one();
    assert_eq!(first.await.expect("join"), Ok(()));
    assert_eq!(second.await.expect("join"), Ok(()));
    assert_eq!(gateway.connection_attempts(), 1);
    let _peer = gateway.accept().await.expect("peer");
}

#[tokio::test(start_paused = true)]
async fn test_token_fetch_timeout_is_retryable() {
    let provider = || std::future::pending::<Option<String>>();
    let (connector, gateway) = memory::channel();
    let client = GatewayClient::spawn_with_connector(
        config().with_token_timeout(secs(2)),
        provider,
        connector,
    )
    .expect("client should spawn");

    let err = client.connect().await.expect_err("token fetch should time out");
    assert!(matches!(&err, GatewayError::Transport(msg) if msg.contains("token fetch timed out")));
    assert_eq!(client.connection_state().phase, ConnectionPhase::Backoff);
    assert_eq!(gateway.connection_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_handshake_timeout_schedules_reconnect() {
    let (client, gateway) = spawn(config());
    gateway.set_stalled(true);

    let started = Instant::now();
    let err = client.connect().await.expect_err("handshake should time out");
    assert!(matches!(&err, GatewayError::Transport(msg) if msg.contains("handshake timed out")));
    assert!(started.elapsed() >= secs(5));

    let state = client.connection_state();
    assert_eq!(state.phase, ConnectionPhase::Backoff);
    assert_eq!(state.reconnect_attempts, 1);
}

// ----------------------------------------------------------------------------
// Outbound queue
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_sends_while_disconnected_flush_in_order_on_connect() {
    let (client, mut gateway) = spawn(config());

    for n in 0..5 {
        let outcome = client
            .send_message("message_create", &json!({ "n": n }))
            .await
            .expect("send");
        assert_eq!(outcome, SendOutcome::Queued);
    }
    assert_eq!(client.connection_metrics().queue_depth, 5);

    client.connect().await.expect("connect");
    let mut peer = gateway.accept().await.expect("peer");

    assert_eq!(recv_numbers(&mut peer, 5).await, vec![0, 1, 2, 3, 4]);
    let metrics = client.connection_metrics();
    assert_eq!(metrics.queue_depth, 0);
    assert_eq!(metrics.messages_sent, 5);
    assert_eq!(metrics.messages_queued, 5);
}

#[tokio::test(start_paused = true)]
async fn test_sends_survive_unclean_close_in_order_exactly_once() {
    let (client, mut gateway, mut first) = connected(config()).await;

    for n in 0..2 {
        let outcome = client
            .send_message("message_create", &json!({ "n": n }))
            .await
            .expect("send");
        assert_eq!(outcome, SendOutcome::Sent);
    }
    let mut delivered = recv_numbers(&mut first, 2).await;

    // Unclean close: no close frame.
    drop(first);

    for n in 2..5 {
        let outcome = client
            .send_message("message_create", &json!({ "n": n }))
            .await
            .expect("send");
        assert_eq!(outcome, SendOutcome::Queued);
    }

    let mut second = gateway.accept().await.expect("reconnected");
    delivered.extend(recv_numbers(&mut second, 3).await);
    assert_eq!(delivered, vec![0, 1, 2, 3, 4]);

    // Nothing delivered twice.
    assert!(tokio::time::timeout(secs(5), second.recv_event()).await.is_err());
    assert_eq!(client.connection_metrics().queue_depth, 0);
}

#[tokio::test(start_paused = true)]
async fn test_metrics_watch_reports_drained_queue() {
    let (client, mut gateway) = spawn(config());
    let mut metrics = client.subscribe_metrics();

    for n in 0..3 {
        client
            .send_message("message_create", &json!({ "n": n }))
            .await
            .expect("send");
    }
    assert_eq!(metrics.borrow_and_update().queue_depth, 3);

    client.connect().await.expect("connect");
    let drained = metrics
        .wait_for(|m| m.queue_depth == 0)
        .await
        .expect("driver running")
        .clone();
    assert_eq!(drained.messages_sent, 3);

    let mut peer = gateway.accept().await.expect("peer");
    assert_eq!(recv_numbers(&mut peer, 3).await, vec![0, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_stale_messages_are_dropped_before_flush() {
    let (client, mut gateway) = spawn(config());

    client
        .send_message("message_create", &json!({"n": 0}))
        .await
        .expect("send");
    tokio::time::sleep(secs(301)).await;
    client
        .send_message("message_create", &json!({"n": 1}))
        .await
        .expect("send");

    client.connect().await.expect("connect");
    let mut peer = gateway.accept().await.expect("peer");

    assert_eq!(recv_numbers(&mut peer, 1).await, vec![1]);
    assert_eq!(client.connection_metrics().messages_dropped, 1);
}

#[tokio::test(start_paused = true)]
async fn test_full_queue_drops_oldest_half() {
    let config = config().with_queue(QueueConfig {
        capacity: 4,
        max_age_secs: 300,
    });
    let (client, mut gateway) = spawn(config);

    for n in 0..5 {
        client
            .send_message("message_create", &json!({ "n": n }))
            .await
            .expect("send");
    }
    assert_eq!(client.connection_metrics().queue_depth, 3);

    client.connect().await.expect("connect");
    let mut peer = gateway.accept().await.expect("peer");
    assert_eq!(recv_numbers(&mut peer, 3).await, vec![2, 3, 4]);
    assert_eq!(client.connection_metrics().messages_dropped, 2);
}

#[tokio::test(start_paused = true)]
async fn test_empty_event_type_rejected() {
    let (client, _gateway) = spawn(config());
    let result = client.send_message("", &json!({})).await;
    assert!(matches!(result, Err(GatewayError::Protocol(_))));
}

// ----------------------------------------------------------------------------
// Heartbeat, idle timeout and quality
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_reconnect_after_third_missed_heartbeat() {
    let config = config().with_heartbeat(HeartbeatConfig {
        interval_ms: 10_000,
        ack_timeout_ms: 20_000,
        max_missed_acks: 3,
        idle_timeout_ms: 10 * HOUR_MS,
    });
    let (_client, mut gateway, mut first) = connected(config).await;
    let started = Instant::now();

    // Probes at 10, 20, 30, 40 s go unanswered; the third miss lands at 50 s,
    // before the fourth probe's deadline at 60 s.
    let second = gateway.accept().await.expect("forced reconnect");
    let elapsed = started.elapsed();
    assert!(elapsed >= secs(50), "reconnected too early: {elapsed:?}");
    assert!(elapsed < secs(51), "reconnected too late: {elapsed:?}");
    assert_eq!(gateway.connection_attempts(), 2);

    let mut missed_counts = Vec::new();
    while let Some(frame) = first.recv_frame().await {
        assert_eq!(frame.event_type, "heartbeat");
        missed_counts.push(frame.payload["missed"].as_u64().expect("missed count"));
    }
    assert_eq!(missed_counts, vec![0, 0, 1, 2]);

    // Exactly one reconnect.
    assert_no_connection_within(&mut gateway, secs(5)).await;
    assert_eq!(gateway.connection_attempts(), 2);
    drop(second);
}

#[tokio::test(start_paused = true)]
async fn test_pong_resets_misses_and_records_rtt() {
    let config = config().with_heartbeat(HeartbeatConfig {
        interval_ms: 10_000,
        ack_timeout_ms: 20_000,
        max_missed_acks: 3,
        idle_timeout_ms: 10 * HOUR_MS,
    });
    let (client, mut gateway, mut peer) = connected(config).await;

    for _ in 0..3 {
        let probe = peer.recv_frame().await.expect("probe");
        assert_eq!(probe.event_type, "heartbeat");
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(peer.send_event("pong", json!({"timestamp": 1_234})));
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    let metrics = client.connection_metrics();
    assert_eq!(metrics.missed_heartbeats, 0);
    assert_eq!(metrics.last_server_timestamp, Some(1_234));
    let rtt = metrics.last_rtt.expect("rtt recorded");
    assert!(rtt >= Duration::from_millis(249) && rtt <= Duration::from_millis(251));

    // Acknowledged probes never trigger a reconnect.
    assert_no_connection_within(&mut gateway, secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn test_idle_timeout_resets_on_any_frame() {
    let config = config().with_heartbeat(HeartbeatConfig {
        interval_ms: HOUR_MS,
        ack_timeout_ms: 2 * HOUR_MS,
        max_missed_acks: 3,
        idle_timeout_ms: 30_000,
    });
    let (_client, mut gateway, first) = connected(config).await;
    let started = Instant::now();

    tokio::time::sleep(secs(20)).await;
    assert!(first.send_event("typing", json!({})));

    let _second = gateway.accept().await.expect("stale connection replaced");
    let elapsed = started.elapsed();
    assert!(elapsed >= secs(50) && elapsed < secs(51), "elapsed {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_critical_quality_triggers_proactive_reconnect() {
    // Misses are never fatal on their own here; only the quality score can
    // trigger the reconnect.
    let config = config()
        .with_heartbeat(HeartbeatConfig {
            interval_ms: 10_000,
            ack_timeout_ms: 10_000,
            max_missed_acks: 100,
            idle_timeout_ms: 10 * HOUR_MS,
        })
        .with_quality(QualityConfig::default());
    let (client, mut gateway, _first) = connected(config).await;
    let started = Instant::now();

    // 30 s: two misses, score 60 (poor). 60 s: five misses, score 0 (critical).
    let _second = gateway.accept().await.expect("proactive reconnect");
    let elapsed = started.elapsed();
    assert!(elapsed >= secs(60) && elapsed < secs(61), "elapsed {elapsed:?}");
    assert_eq!(client.connection_state().phase, ConnectionPhase::Connected);
}

// ----------------------------------------------------------------------------
// Reconnection scheduling
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_backoff_delays_double() {
    let (client, gateway) = spawn(config());
    gateway.set_refusing(true);

    assert!(client.connect().await.is_err());
    // Attempts at 0, 1, 3 and 7 seconds.
    tokio::time::sleep(Duration::from_millis(7_500)).await;
    assert_eq!(gateway.connection_attempts(), 4);
    assert_eq!(client.connection_state().reconnect_attempts, 4);

    tokio::time::sleep(secs(8)).await;
    assert_eq!(gateway.connection_attempts(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_max_attempts_then_reconnect_resets() {
    let config = config().with_reconnect(ReconnectConfig {
        base_delay_ms: 1_000,
        max_delay_ms: 30_000,
        jitter_ratio: 0.0,
        max_attempts: 3,
    });
    let (client, mut gateway) = spawn(config);
    gateway.set_refusing(true);

    assert!(client.connect().await.is_err());
    tokio::time::sleep(secs(120)).await;

    // The initial attempt plus three scheduled ones.
    assert_eq!(gateway.connection_attempts(), 4);
    let state = client.connection_state();
    assert_eq!(state.phase, ConnectionPhase::Disconnected);
    assert_eq!(
        state.last_error.map(|e| e.kind),
        Some(ErrorKind::MaxAttemptsExceeded)
    );

    gateway.set_refusing(false);
    client.reconnect().await.expect("reconnect after cap");
    let _peer = gateway.accept().await.expect("peer");
    let state = client.connection_state();
    assert!(state.is_connected());
    assert_eq!(state.reconnect_attempts, 0);
    assert!(state.last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_manual_disconnect_during_backoff_stops_attempts() {
    let (client, mut gateway) = spawn(config());
    gateway.set_refusing(true);

    assert!(matches!(client.connect().await, Err(GatewayError::Transport(_))));
    assert_eq!(client.connection_state().phase, ConnectionPhase::Backoff);
    assert_eq!(gateway.connection_attempts(), 1);

    client.disconnect(true).await;
    let state = client.connection_state();
    assert_eq!(state.phase, ConnectionPhase::Disconnected);
    assert!(state.manually_disconnected);

    tokio::time::sleep(secs(3_600)).await;
    assert_eq!(gateway.connection_attempts(), 1);

    gateway.set_refusing(false);
    client.connect().await.expect("explicit connect");
    assert_eq!(gateway.connection_attempts(), 2);
    assert!(!client.connection_state().manually_disconnected);
    let _peer = gateway.accept().await.expect("peer");
}

#[tokio::test(start_paused = true)]
async fn test_manual_disconnect_during_token_fetch_rejects_open() {
    let gate = Arc::new(Notify::new());
    let provider = {
        let gate = Arc::clone(&gate);
        move || {
            let gate = Arc::clone(&gate);
            async move {
                gate.notified().await;
                Some("late-token".to_string())
            }
        }
    };
    let (connector, gateway) = memory::channel();
    let client = GatewayClient::spawn_with_connector(config(), provider, connector)
        .expect("client should spawn");

    let connecting = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });
    client
        .wait_for_phase(ConnectionPhase::Connecting)
        .await
        .expect("connecting");

    client.disconnect(true).await;
    gate.notify_one();

    assert_eq!(connecting.await.expect("join"), Err(GatewayError::Cancelled));
    tokio::time::sleep(secs(60)).await;
    assert_eq!(gateway.connection_attempts(), 0);
    assert_eq!(client.connection_state().phase, ConnectionPhase::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_sends_normal_closure() {
    let (client, mut gateway, mut peer) = connected(config()).await;

    client.disconnect(true).await;
    match peer.recv().await {
        Some(OutboundFrame::Close { code, .. }) => assert_eq!(code, 1000),
        other => panic!("expected close frame, got {other:?}"),
    }

    let state = client.connection_state();
    assert_eq!(state.phase, ConnectionPhase::Disconnected);
    assert_no_connection_within(&mut gateway, secs(600)).await;
}

#[tokio::test(start_paused = true)]
async fn test_non_manual_disconnect_hands_off_to_backoff() {
    let (client, mut gateway, mut first) = connected(config()).await;
    let started = Instant::now();

    client.disconnect(false).await;
    match first.recv().await {
        Some(OutboundFrame::Close { code, .. }) => assert_eq!(code, 1000),
        other => panic!("expected close frame, got {other:?}"),
    }
    let state = client.connection_state();
    assert_eq!(state.phase, ConnectionPhase::Backoff);
    assert!(!state.manually_disconnected);
    assert_eq!(state.reconnect_attempts, 1);

    let _second = gateway.accept().await.expect("reconnected after backoff");
    assert!(started.elapsed() >= secs(1));
    assert_eq!(gateway.connection_attempts(), 2);
    client
        .wait_for_phase(ConnectionPhase::Connected)
        .await
        .expect("connected");
}

#[tokio::test(start_paused = true)]
async fn test_manual_and_non_manual_disconnect_differ() {
    let (manual, mut manual_gateway, _manual_peer) = connected(config()).await;
    let (automatic, mut automatic_gateway, _automatic_peer) = connected(config()).await;

    manual.disconnect(true).await;
    automatic.disconnect(false).await;

    assert_no_connection_within(&mut manual_gateway, secs(600)).await;
    assert_eq!(manual_gateway.connection_attempts(), 1);
    assert_eq!(manual.connection_state().phase, ConnectionPhase::Disconnected);

    let _peer = automatic_gateway.accept().await.expect("automatic reconnect");
    assert_eq!(automatic_gateway.connection_attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_non_manual_disconnect_when_idle_stays_idle() {
    let (client, mut gateway) = spawn(config());

    client.disconnect(false).await;
    assert_eq!(client.connection_state().phase, ConnectionPhase::Disconnected);
    assert_no_connection_within(&mut gateway, secs(600)).await;
    assert_eq!(gateway.connection_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_replaces_live_connection() {
    let (client, mut gateway, mut first) = connected(config()).await;

    client.reconnect().await.expect("reconnect");
    assert!(matches!(first.recv().await, Some(OutboundFrame::Close { .. })));

    let _second = gateway.accept().await.expect("second connection");
    assert_eq!(gateway.connection_attempts(), 2);
    assert!(client.connection_state().is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_clean_server_close_triggers_reconnect() {
    let (client, mut gateway, first) = connected(config()).await;

    first.close("server restart");
    let _second = gateway.accept().await.expect("reconnected");
    assert!(client.connection_state().is_connected());
}

// ----------------------------------------------------------------------------
// Inbound routing
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_reserved_events_never_reach_handlers() {
    let (client, _gateway, peer) = connected(config()).await;

    let reserved_hits = Arc::new(AtomicUsize::new(0));
    for event_type in ["connection_established", "pong", "heartbeat_ack", "heartbeat", "error"] {
        let hits = Arc::clone(&reserved_hits);
        client.on(event_type, move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.on("message_create", move |frame| {
        let _ = tx.send(frame.payload.clone());
        Ok(())
    });

    assert!(peer.send_event("connection_established", json!({"connection_id": "conn-7"})));
    assert!(peer.send_event("pong", json!({"timestamp": 5})));
    assert!(peer.send_event("error", json!({"message": "slow down"})));
    assert!(peer.send_event("message_create", json!({"n": 1})));

    assert_eq!(rx.recv().await, Some(json!({"n": 1})));
    assert_eq!(reserved_hits.load(Ordering::SeqCst), 0);

    let state = client.connection_state();
    assert_eq!(state.connection_id.as_deref(), Some("conn-7"));
    assert_eq!(client.connection_metrics().frames_received, 4);
}

#[tokio::test(start_paused = true)]
async fn test_failing_handlers_do_not_block_siblings() {
    let (client, _gateway, peer) = connected(config()).await;

    client.on("typing", |_| Err("handler failed".into()));
    client.on("typing", |_| panic!("handler panicked"));
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.on("typing", move |frame| {
        let _ = tx.send(frame.payload.clone());
        Ok(())
    });

    for n in 0..2 {
        assert!(peer.send_event("typing", json!({ "n": n })));
    }
    assert_eq!(rx.recv().await, Some(json!({"n": 0})));
    assert_eq!(rx.recv().await, Some(json!({"n": 1})));
    assert!(client.connection_state().is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_off_stops_delivery() {
    let (client, _gateway, peer) = connected(config()).await;

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let id = client.on("typing", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.on("typing", move |_| {
        let _ = tx.send(());
        Ok(())
    });

    assert!(peer.send_event("typing", json!({})));
    rx.recv().await.expect("delivered");
    assert!(client.off("typing", id));
    assert!(peer.send_event("typing", json!({})));
    rx.recv().await.expect("delivered");

    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_binary_payload_reaches_handlers() {
    let (client, mut gateway, peer) = connected(config()).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.on("file", move |frame| {
        let _ = tx.send(frame.payload.clone());
        Ok(())
    });

    // ["file", bin8 [1, 2, 3]]
    for _ in 0..5 {
        assert!(peer.send_raw(vec![0x92, 0xa4, b'f', b'i', b'l', b'e', 0xc4, 0x03, 1, 2, 3]));
    }
    for _ in 0..5 {
        assert_eq!(rx.recv().await, Some(json!("AQID")));
    }

    let metrics = client.connection_metrics();
    assert_eq!(metrics.frames_received, 5);
    assert_eq!(metrics.frames_rejected, 0);
    assert_no_connection_within(&mut gateway, secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_inbound_burst_delivered_in_order() {
    let (client, _gateway, peer) = connected(config()).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.on("message_create", move |frame| {
        let _ = tx.send(n_of(&frame.payload));
        Ok(())
    });

    // Far more frames than the driver buffers between the reader and itself.
    for n in 0..500 {
        assert!(peer.send_event("message_create", json!({ "n": n })));
    }
    for n in 0..500 {
        assert_eq!(rx.recv().await, Some(n));
    }
    assert_eq!(client.connection_metrics().frames_received, 500);
}

#[tokio::test(start_paused = true)]
async fn test_server_heartbeat_probe_is_answered() {
    let (_client, _gateway, mut peer) = connected(config()).await;

    assert!(peer.send_event("heartbeat", json!({})));
    let reply = peer.recv_frame().await.expect("reply");
    assert_eq!(reply.event_type, "heartbeat_ack");
    assert!(reply.payload["timestamp"].is_i64());
}

#[tokio::test(start_paused = true)]
async fn test_repeated_protocol_errors_force_reconnect() {
    let config = config().with_max_protocol_errors(3);
    let (client, mut gateway, first) = connected(config).await;

    assert!(first.send_raw(vec![0xc1]));
    assert!(first.send_raw(Vec::new()));
    // A valid frame resets the streak.
    assert!(first.send_event("message_create", json!({})));
    assert!(first.send_text("not binary"));
    assert!(first.send_raw(vec![0x93]));
    assert_no_connection_within(&mut gateway, secs(1)).await;

    let state = client.connection_state();
    assert!(state.is_connected());
    assert_eq!(state.last_error.map(|e| e.kind), Some(ErrorKind::Protocol));

    assert!(first.send_raw(vec![0xc1]));
    let _second = gateway.accept().await.expect("forced reconnect");
    assert_eq!(client.connection_metrics().frames_rejected, 5);
}

// ----------------------------------------------------------------------------
// Observers and shutdown
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_state_listener_sees_lifecycle() {
    let (client, mut gateway) = spawn(config());

    let phases = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&phases);
    let subscription = client.on_connection_state_change(move |state| {
        assert!(!(state.is_connected() && state.is_connecting()));
        let mut phases = sink.lock();
        if phases.last() != Some(&state.phase) {
            phases.push(state.phase);
        }
    });

    client.connect().await.expect("connect");
    let first = gateway.accept().await.expect("peer");
    drop(first);
    let _second = gateway.accept().await.expect("reconnected");
    client
        .wait_for_phase(ConnectionPhase::Connected)
        .await
        .expect("connected");

    assert_eq!(
        *phases.lock(),
        vec![
            ConnectionPhase::Connecting,
            ConnectionPhase::Connected,
            ConnectionPhase::Backoff,
            ConnectionPhase::Connecting,
            ConnectionPhase::Connected,
        ]
    );

    assert!(subscription.unsubscribe());
    client.disconnect(true).await;
    assert_eq!(phases.lock().last(), Some(&ConnectionPhase::Connected));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_client() {
    let (client, _gateway, mut peer) = connected(config()).await;
    let other = client.clone();

    client.shutdown().await;
    assert!(matches!(peer.recv().await, Some(OutboundFrame::Close { .. })));
    assert_eq!(other.connect().await, Err(GatewayError::ClientClosed));
}
