//! Per-connection metrics
//!
//! Atomic counters updated from both the foreground send path and the
//! background heartbeat/ack worker, plus a serializable snapshot for status
//! output.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Counters for one device connection
#[derive(Debug)]
pub struct ConnectionMetrics {
    // Lifecycle
    open: AtomicBool,
    opens: AtomicU64,
    connect_failures: AtomicU64,

    // Pipeline traffic
    pings_sent: AtomicU64,
    acks_sent: AtomicU64,
    acks_enqueued: AtomicU64,
    pipeline_failures: AtomicU64,

    // Explicit sends
    messages_sent: AtomicU64,
    media_sent: AtomicU64,
    media_bytes: AtomicU64,
    publish_failures: AtomicU64,

    inbound_messages: AtomicU64,

    opened_at: Mutex<Option<DateTime<Utc>>>,
    last_sent_at: Mutex<Option<DateTime<Utc>>>,
}

impl ConnectionMetrics {
    pub fn new() -> Self {
        Self {
            open: AtomicBool::new(false),
            opens: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            pings_sent: AtomicU64::new(0),
            acks_sent: AtomicU64::new(0),
            acks_enqueued: AtomicU64::new(0),
            pipeline_failures: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            media_sent: AtomicU64::new(0),
            media_bytes: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            inbound_messages: AtomicU64::new(0),
            opened_at: Mutex::new(None),
            last_sent_at: Mutex::new(None),
        }
    }

    pub fn connection_opened(&self) {
        self.opens.fetch_add(1, Ordering::Relaxed);
        self.open.store(true, Ordering::Relaxed);
        if let Ok(mut opened_at) = self.opened_at.lock() {
            *opened_at = Some(Utc::now());
        }
    }

    pub fn connection_failed(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
        self.open.store(false, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.open.store(false, Ordering::Relaxed);
        if let Ok(mut opened_at) = self.opened_at.lock() {
            *opened_at = None;
        }
    }

    pub fn ping_sent(&self) {
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn ack_enqueued(&self) {
        self.acks_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ack_sent(&self) {
        self.acks_sent.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// A heartbeat or ack publish that the worker logged and dropped
    pub fn pipeline_failed(&self) {
        self.pipeline_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn media_sent(&self, bytes: usize) {
        self.media_sent.fetch_add(1, Ordering::Relaxed);
        self.media_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inbound_received(&self) {
        self.inbound_messages.fetch_add(1, Ordering::Relaxed);
    }

    fn touch(&self) {
        if let Ok(mut last_sent_at) = self.last_sent_at.lock() {
            *last_sent_at = Some(Utc::now());
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let opened_at = self.opened_at.lock().ok().and_then(|guard| *guard);
        let last_sent_at = self.last_sent_at.lock().ok().and_then(|guard| *guard);
        let now = Utc::now();

        MetricsSnapshot {
            connection: ConnectionStats {
                open: self.open.load(Ordering::Relaxed),
                opens: self.opens.load(Ordering::Relaxed),
                connect_failures: self.connect_failures.load(Ordering::Relaxed),
                uptime_seconds: opened_at
                    .map(|at| (now - at).num_seconds().max(0) as u64)
                    .unwrap_or(0),
                inbound_messages: self.inbound_messages.load(Ordering::Relaxed),
            },
            pipeline: PipelineStats {
                pings_sent: self.pings_sent.load(Ordering::Relaxed),
                acks_enqueued: self.acks_enqueued.load(Ordering::Relaxed),
                acks_sent: self.acks_sent.load(Ordering::Relaxed),
                failures: self.pipeline_failures.load(Ordering::Relaxed),
            },
            sends: SendStats {
                messages_sent: self.messages_sent.load(Ordering::Relaxed),
                media_sent: self.media_sent.load(Ordering::Relaxed),
                media_bytes: self.media_bytes.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
            },
            last_sent_at,
            timestamp: now,
        }
    }
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub connection: ConnectionStats,
    pub pipeline: PipelineStats,
    pub sends: SendStats,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub open: bool,
    pub opens: u64,
    pub connect_failures: u64,
    pub uptime_seconds: u64,
    pub inbound_messages: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub pings_sent: u64,
    pub acks_enqueued: u64,
    pub acks_sent: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendStats {
    pub messages_sent: u64,
    pub media_sent: u64,
    pub media_bytes: u64,
    pub publish_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_pipeline_counters() {
        let metrics = ConnectionMetrics::new();

        metrics.ping_sent();
        metrics.ping_sent();
        metrics.ack_enqueued();
        metrics.ack_sent();
        metrics.pipeline_failed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.pipeline.pings_sent, 2);
        assert_eq!(snapshot.pipeline.acks_enqueued, 1);
        assert_eq!(snapshot.pipeline.acks_sent, 1);
        assert_eq!(snapshot.pipeline.failures, 1);
        assert!(snapshot.last_sent_at.is_some());
    }

    #[test]
    fn test_media_bytes_accumulate() {
        let metrics = ConnectionMetrics::new();
        metrics.media_sent(1024);
        metrics.media_sent(512);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sends.media_sent, 2);
        assert_eq!(snapshot.sends.media_bytes, 1536);
    }

    #[test]
    fn test_lifecycle() {
        let metrics = ConnectionMetrics::new();
        assert!(!metrics.snapshot().connection.open);
        assert!(metrics.snapshot().last_sent_at.is_none());

        metrics.connection_failed();
        metrics.connection_opened();
        let snapshot = metrics.snapshot();
        assert!(snapshot.connection.open);
        assert_eq!(snapshot.connection.opens, 1);
        assert_eq!(snapshot.connection.connect_failures, 1);

        metrics.connection_closed();
        let snapshot = metrics.snapshot();
        assert!(!snapshot.connection.open);
        assert_eq!(snapshot.connection.uptime_seconds, 0);
    }

    #[test]
    fn test_thread_safety() {
        let metrics = Arc::new(ConnectionMetrics::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                thread::spawn(move || {
                    for _ in 0..100 {
                        metrics.ack_enqueued();
                        metrics.message_sent();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.pipeline.acks_enqueued, 1000);
        assert_eq!(snapshot.sends.messages_sent, 1000);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = ConnectionMetrics::new();
        metrics.inbound_received();

        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["connection"]["inbound_messages"], 1);
        assert!(json["last_sent_at"].is_null());
        assert!(json["timestamp"].is_string());
    }
}
