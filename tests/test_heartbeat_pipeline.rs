//! Heartbeat/ack pipeline behaviour through a full DeviceConnection
//!
//! Runs on a paused tokio clock, so timings are exact and the tests are fast.

mod test_helpers;

use cloudlink::device::ACK_POLL_INTERVAL;
use cloudlink::protocol::{CommandEnvelope, Fields, MSG_ACK, MSG_PING};
use cloudlink::transport::{MessageProcessor, SharedProcessor};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{message_topic, mock_connection};
use tokio::time::{sleep, Instant};

#[tokio::test(start_paused = true)]
async fn test_idle_connection_pings_every_heartbeat() {
    let (connection, transport, _) = mock_connection(Duration::from_millis(1000));

    connection.open(true).await.unwrap();
    let opened_at = Instant::now();
    sleep(Duration::from_millis(3500)).await;

    let pings = transport.get_pings().await;
    assert!(pings.len() >= 3, "expected at least 3 pings, got {}", pings.len());
    assert!(transport.get_acks().await.is_empty());

    let mut previous = opened_at;
    for ping in &pings {
        assert_eq!(ping.topic, message_topic(MSG_PING));
        assert_eq!(ping.fields(), Some(Fields::new()));

        let gap = ping.at - previous;
        assert!(gap >= Duration::from_millis(1000), "pings too close: {gap:?}");
        assert!(
            gap <= Duration::from_millis(1000) + ACK_POLL_INTERVAL,
            "ping late: {gap:?}"
        );
        previous = ping.at;
    }

    connection.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_ack_right_after_open_precedes_next_ping() {
    let (connection, transport, _) = mock_connection(Duration::from_millis(1000));

    connection.open(true).await.unwrap();
    let opened_at = Instant::now();
    connection.acknowledge(42, true).unwrap();

    sleep(Duration::from_millis(2000)).await;

    let published = transport.get_published().await;
    let acks: Vec<_> = published.iter().filter(|r| r.is_ack()).collect();
    assert_eq!(acks.len(), 1);
    assert!(acks[0].at - opened_at <= ACK_POLL_INTERVAL);
    assert_eq!(acks[0].topic, message_topic(MSG_ACK));
    assert_eq!(
        serde_json::Value::Object(acks[0].fields().unwrap()),
        json!({"correlationId": 42, "acked": 1})
    );

    // The ack is the first thing on the wire
    assert!(published[0].is_ack());

    connection.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_acks_are_published_in_order() {
    let (connection, transport, _) = mock_connection(Duration::from_secs(30));
    connection.open(true).await.unwrap();

    let handle = connection.ack_handle();
    for (id, ok) in [(1, true), (2, false), (3, true)] {
        handle.acknowledge(id, ok).unwrap();
    }
    sleep(Duration::from_millis(100)).await;

    let acks: Vec<serde_json::Value> = transport
        .get_acks()
        .await
        .into_iter()
        .map(|record| serde_json::Value::Object(record.fields().unwrap()))
        .collect();
    assert_eq!(
        acks,
        vec![
            json!({"correlationId": 1, "acked": 1}),
            json!({"correlationId": 2, "acked": 0}),
            json!({"correlationId": 3, "acked": 1}),
        ]
    );
    assert_eq!(connection.metrics().pipeline.acks_sent, 3);

    connection.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_ack_from_inbound_callback_context() {
    let (connection, transport, _) = mock_connection(Duration::from_secs(30));
    connection.open(true).await.unwrap();

    // Acknowledging is synchronous, so it works from the transport callback
    let handle = connection.ack_handle();
    let acker: SharedProcessor = Arc::new(move |_: &str, payload: &[u8]| {
        let envelope = CommandEnvelope::parse(payload).unwrap();
        handle
            .acknowledge(envelope.correlation_id.unwrap(), true)
            .unwrap();
    });
    acker.process(
        "/DOMAIN/device/KitchenCamera/cmds",
        br#"{"correlationId": "1234", "action": "snap"}"#,
    );
    sleep(Duration::from_millis(10)).await;

    let acks = transport.get_acks().await;
    assert_eq!(acks.len(), 1);
    assert_eq!(
        acks[0].fields().unwrap().get("correlationId"),
        Some(&json!(1234))
    );

    connection.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_close_mid_wait_stops_worker_before_disconnect() {
    let (connection, transport, _) = mock_connection(Duration::from_millis(1000));
    connection.open(true).await.unwrap();

    sleep(Duration::from_millis(2300)).await;
    let close_started = Instant::now();
    connection.close().await;
    assert!(close_started.elapsed() <= ACK_POLL_INTERVAL);

    let disconnect_at = transport
        .get_disconnect_started_at()
        .await
        .expect("transport was disconnected");
    for record in transport.get_published().await {
        assert!(record.at <= disconnect_at, "publish after disconnect began");
    }

    // Nothing is attempted after close either
    sleep(Duration::from_secs(10)).await;
    assert_eq!(transport.rejected_publish_count(), 0);
    assert_eq!(transport.get_pings().await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_pipeline_publish_failures_are_swallowed() {
    let (connection, transport, _) = mock_connection(Duration::from_millis(500));
    connection.open(true).await.unwrap();

    transport.set_fail_publish(true);
    connection.acknowledge(7, true).unwrap();
    sleep(Duration::from_millis(1600)).await;

    assert!(connection.is_connected());
    assert!(connection.metrics().pipeline.failures >= 3);

    // Lost acks are not retried once the transport recovers
    transport.set_fail_publish(false);
    sleep(Duration::from_millis(600)).await;
    assert!(transport.get_acks().await.is_empty());
    assert!(!transport.get_pings().await.is_empty());

    connection.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_acks_queued_while_closed_flush_on_open() {
    let (connection, transport, _) = mock_connection(Duration::from_secs(30));

    connection.acknowledge(99, false).unwrap();
    assert!(transport.get_published().await.is_empty());

    connection.open(true).await.unwrap();
    sleep(Duration::from_millis(10)).await;

    let acks = transport.get_acks().await;
    assert_eq!(acks.len(), 1);
    assert_eq!(
        serde_json::Value::Object(acks[0].fields().unwrap()),
        json!({"correlationId": 99, "acked": 0})
    );

    connection.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_reopen_restarts_heartbeat() {
    let (connection, transport, _) = mock_connection(Duration::from_millis(1000));

    connection.open(true).await.unwrap();
    sleep(Duration::from_millis(1500)).await;
    connection.close().await;
    assert_eq!(transport.get_pings().await.len(), 1);

    connection.open(true).await.unwrap();
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(transport.get_pings().await.len(), 2);
    assert_eq!(transport.connect_count(), 2);

    connection.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_fresh_session_pings_on_first_idle_poll() {
    let (connection, transport, _) = mock_connection(Duration::from_secs(30));

    connection.open(true).await.unwrap();
    let opened_at = Instant::now();
    sleep(ACK_POLL_INTERVAL + Duration::from_millis(100)).await;

    let pings = transport.get_pings().await;
    assert_eq!(pings.len(), 1);
    assert!(pings[0].at - opened_at <= ACK_POLL_INTERVAL);

    // After that the full heartbeat applies
    sleep(Duration::from_secs(20)).await;
    assert_eq!(transport.get_pings().await.len(), 1);

    connection.close().await;
}
