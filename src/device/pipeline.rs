//! Heartbeat/ack pipeline
//!
//! A single background task owns the outbound path for pings and acks. It
//! waits on the ack queue with a bounded timeout. Queued acks always go out
//! first; a PING is sent only when the queue stayed empty for the whole wait
//! and the session has been silent for at least the heartbeat interval.
//!
//! The queue is unbounded and outlives the worker: acks enqueued while the
//! connection is closed are delivered after the next open.

use crate::error::{sanitize_error_message, DeviceError, DeviceResult};
use crate::observability::ConnectionMetrics;
use crate::pipeline_span;
use crate::protocol::{Message, PendingAck, TopicRouter, MSG_ACK};
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// Upper bound on one wait for the ack queue
pub const ACK_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Lower bound on one wait, so an overdue heartbeat cannot spin the worker
const MIN_WAIT: Duration = Duration::from_millis(10);

/// Shared consumer end of the ack queue
pub(crate) type AckQueue = Arc<Mutex<mpsc::UnboundedReceiver<PendingAck>>>;

/// Create the ack queue for one connection
pub(crate) fn ack_queue() -> (mpsc::UnboundedSender<PendingAck>, AckQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, Arc::new(Mutex::new(rx)))
}

/// Cloneable, non-blocking way to acknowledge commands
///
/// Safe to use from the inbound message callback: `acknowledge` only
/// enqueues and never waits on the transport.
#[derive(Debug, Clone)]
pub struct AckHandle {
    tx: mpsc::UnboundedSender<PendingAck>,
    metrics: Arc<ConnectionMetrics>,
}

impl AckHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<PendingAck>, metrics: Arc<ConnectionMetrics>) -> Self {
        Self { tx, metrics }
    }

    /// Queue an ACK for `correlation_id`
    pub fn acknowledge(&self, correlation_id: i64, acked: bool) -> DeviceResult<()> {
        self.tx
            .send(PendingAck::new(correlation_id, acked))
            .map_err(|_| DeviceError::QueueClosed)?;
        self.metrics.ack_enqueued();
        debug!(correlation_id, acked, "Acknowledgment queued");
        Ok(())
    }
}

/// Everything the worker needs to publish on behalf of the connection
pub(crate) struct AckPipeline<T: Transport + 'static> {
    pub transport: Arc<T>,
    pub router: TopicRouter,
    pub heartbeat: Duration,
    pub metrics: Arc<ConnectionMetrics>,
}

/// Handle to a running worker
pub(crate) struct PipelineWorker {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl<T: Transport + 'static> AckPipeline<T> {
    /// Start the worker on the current runtime
    pub fn spawn(self, queue: AckQueue) -> PipelineWorker {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let span = pipeline_span!(
            device_id = %self.router.identity().device_id,
            heartbeat_ms = self.heartbeat.as_millis() as u64
        );
        let handle = tokio::spawn(self.run(queue, shutdown_rx).instrument(span));
        PipelineWorker {
            shutdown_tx,
            handle,
        }
    }

    async fn run(self, queue: AckQueue, mut shutdown_rx: watch::Receiver<bool>) {
        let mut acks = queue.lock().await;
        // None until the first send of this session; a fresh session is due
        let mut last_sent: Option<Instant> = None;
        info!("Heartbeat/ack pipeline started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let wait = self.next_wait(last_sent);

            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }

                received = tokio::time::timeout(wait, acks.recv()) => match received {
                    Ok(Some(ack)) => {
                        self.send(Message::ack(ack)).await;
                        last_sent = Some(Instant::now());
                    }
                    // Every sender is gone; nothing can be queued any more
                    Ok(None) => break,
                    Err(_) => {
                        if self.ping_due(last_sent) {
                            self.send(Message::ping()).await;
                            last_sent = Some(Instant::now());
                        }
                    }
                }
            }
        }

        info!("Heartbeat/ack pipeline stopped");
    }

    /// How long to wait on the queue before checking the heartbeat again
    ///
    /// Never longer than [`ACK_POLL_INTERVAL`] and never zero.
    fn next_wait(&self, last_sent: Option<Instant>) -> Duration {
        let until_due = match last_sent {
            Some(at) => self.heartbeat.saturating_sub(at.elapsed()),
            None => self.heartbeat,
        };
        until_due.clamp(MIN_WAIT, ACK_POLL_INTERVAL)
    }

    fn ping_due(&self, last_sent: Option<Instant>) -> bool {
        last_sent.map_or(true, |at| at.elapsed() >= self.heartbeat)
    }

    /// Publish a ping or ack; failures are logged and dropped
    async fn send(&self, message: Message) {
        let topic = self.router.message_topic(message.message_id);
        let kind = message.kind();

        let payload = match message.payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(kind, error = %e, "Failed to encode pipeline message");
                self.metrics.pipeline_failed();
                return;
            }
        };

        match self
            .transport
            .publish(&topic, payload, message.qos, message.retained)
            .await
        {
            Ok(()) => {
                if message.message_id == MSG_ACK {
                    self.metrics.ack_sent();
                } else {
                    self.metrics.ping_sent();
                }
                debug!(kind, topic = %topic, "Pipeline message sent");
            }
            Err(e) => {
                self.metrics.pipeline_failed();
                warn!(
                    kind,
                    topic = %topic,
                    error = %sanitize_error_message(&e.to_string()),
                    "Pipeline publish failed, dropping"
                );
            }
        }
    }
}

impl PipelineWorker {
    /// Request cooperative shutdown and wait up to `timeout` for the task to exit
    ///
    /// Returns false if the worker had to be aborted.
    pub async fn stop(mut self, timeout: Duration) -> bool {
        let _ = self.shutdown_tx.send(true);

        match tokio::time::timeout(timeout, &mut self.handle).await {
            Ok(_) => true,
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Pipeline worker did not stop in time, aborting"
                );
                self.handle.abort();
                let _ = self.handle.await;
                false
            }
        }
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Non-async teardown for Drop paths
    pub fn abort(&self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DeviceIdentity, QoS, MSG_PING};
    use crate::testing::MockTransport;
    use crate::transport::{SessionOptions, Transport};
    use serde_json::json;

    fn router() -> TopicRouter {
        TopicRouter::new(DeviceIdentity::new("DOMAIN", "cam", "RaspCAM", "1.0"))
    }

    async fn connected_transport() -> Arc<MockTransport> {
        let transport = Arc::new(MockTransport::new());
        let identity = DeviceIdentity::new("DOMAIN", "cam", "RaspCAM", "1.0");
        let options = SessionOptions::new(
            "tcp://localhost:1883",
            crate::protocol::Credentials::from_identity(&identity, "key"),
            true,
        );
        transport.connect(&options).await.unwrap();
        transport
    }

    fn pipeline(
        transport: &Arc<MockTransport>,
        heartbeat: Duration,
    ) -> (AckPipeline<MockTransport>, Arc<ConnectionMetrics>) {
        let metrics = Arc::new(ConnectionMetrics::new());
        (
            AckPipeline {
                transport: transport.clone(),
                router: router(),
                heartbeat,
                metrics: metrics.clone(),
            },
            metrics,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_worker_sends_pings_on_heartbeat() {
        let transport = connected_transport().await;
        let (pipeline, metrics) = pipeline(&transport, Duration::from_millis(1000));
        let (_tx, queue) = ack_queue();

        let worker = pipeline.spawn(queue);
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(worker.stop(Duration::from_secs(5)).await);

        let pings = transport.get_pings().await;
        assert_eq!(pings.len(), 3);
        assert!(transport.get_acks().await.is_empty());
        assert_eq!(metrics.snapshot().pipeline.pings_sent, 3);

        for record in &pings {
            assert_eq!(record.topic, "/DOMAIN/device/cam/msgs/1/RaspCAM/1.0");
            assert_eq!(record.fields(), Some(serde_json::Map::new()));
            assert_eq!(record.qos, QoS::AtMostOnce);
            assert!(!record.retained);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_heartbeat_still_polls_every_two_seconds() {
        let transport = connected_transport().await;
        let (pipeline, _) = pipeline(&transport, Duration::from_secs(60));
        let (tx, queue) = ack_queue();
        let worker = pipeline.spawn(queue);

        tokio::time::sleep(Duration::from_secs(10)).await;
        // Only the opening ping: the next is not due for a minute
        assert_eq!(transport.get_pings().await.len(), 1);

        // An ack queued mid-wait is not held back until the heartbeat
        tx.send(PendingAck::new(5, false)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let acks = transport.get_acks().await;
        assert_eq!(acks.len(), 1);
        assert_eq!(
            serde_json::Value::Object(acks[0].fields().unwrap()),
            json!({"correlationId": 5, "acked": 0})
        );

        worker.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_resets_heartbeat_clock() {
        let transport = connected_transport().await;
        let (pipeline, _) = pipeline(&transport, Duration::from_millis(1000));
        let (tx, queue) = ack_queue();
        let worker = pipeline.spawn(queue);

        tokio::time::sleep(Duration::from_millis(800)).await;
        tx.send(PendingAck::new(1, true)).unwrap();
        tokio::time::sleep(Duration::from_millis(900)).await;

        // Ack at ~800ms; next ping not due until ~1800ms
        assert_eq!(transport.get_acks().await.len(), 1);
        assert!(transport.get_pings().await.is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.get_pings().await.len(), 1);
        worker.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failures_do_not_stop_worker() {
        let transport = connected_transport().await;
        let (pipeline, metrics) = pipeline(&transport, Duration::from_millis(500));
        let (tx, queue) = ack_queue();

        transport.set_fail_publish(true);
        let worker = pipeline.spawn(queue);
        tx.send(PendingAck::new(9, true)).unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;

        assert!(worker.is_running());
        assert!(transport.get_published().await.is_empty());
        let failures = metrics.snapshot().pipeline.failures;
        assert!(failures >= 2, "expected ack and ping failures, got {failures}");

        transport.set_fail_publish(false);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!transport.get_pings().await.is_empty());
        worker.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_prompt_mid_wait() {
        let transport = connected_transport().await;
        let (pipeline, _) = pipeline(&transport, Duration::from_secs(30));
        let (_tx, queue) = ack_queue();
        let worker = pipeline.spawn(queue);

        tokio::time::sleep(Duration::from_millis(700)).await;
        let started = Instant::now();
        assert!(worker.stop(Duration::from_secs(5)).await);
        assert!(started.elapsed() < ACK_POLL_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_survives_worker_restart() {
        let transport = connected_transport().await;
        let (tx, queue) = ack_queue();

        let (first, _) = pipeline(&transport, Duration::from_secs(30));
        first.spawn(queue.clone()).stop(Duration::from_secs(5)).await;

        tx.send(PendingAck::new(77, true)).unwrap();

        let (second, _) = pipeline(&transport, Duration::from_secs(30));
        let worker = second.spawn(queue);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let acks = transport.get_acks().await;
        assert_eq!(acks.len(), 1);
        assert_eq!(
            acks[0].fields().unwrap().get("correlationId"),
            Some(&json!(77))
        );
        worker.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_ping_within_one_poll_of_start() {
        let transport = connected_transport().await;
        let (pipeline, _) = pipeline(&transport, Duration::from_secs(30));
        let (_tx, queue) = ack_queue();
        let started = Instant::now();
        let worker = pipeline.spawn(queue);

        tokio::time::sleep(ACK_POLL_INTERVAL + Duration::from_millis(100)).await;
        let pings = transport.get_pings().await;
        assert_eq!(pings.len(), 1);
        assert!(pings[0].at - started <= ACK_POLL_INTERVAL);

        worker.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_heartbeat_does_not_spin() {
        let transport = connected_transport().await;
        let (pipeline, _) = pipeline(&transport, Duration::ZERO);
        let (_tx, queue) = ack_queue();
        let worker = pipeline.spawn(queue);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let pings = transport.get_pings().await.len();
        assert!(pings <= 11, "worker spun: {pings} pings in 100ms");
        assert!(worker.stop(Duration::from_secs(5)).await);
    }

    #[test]
    fn test_wait_is_bounded() {
        let transport = Arc::new(MockTransport::new());
        let (long, _) = pipeline(&transport, Duration::from_secs(60));
        assert_eq!(long.next_wait(None), ACK_POLL_INTERVAL);
        assert!(long.ping_due(None));

        let (short, _) = pipeline(&transport, Duration::from_millis(500));
        assert_eq!(short.next_wait(None), Duration::from_millis(500));

        let (zero, _) = pipeline(&transport, Duration::ZERO);
        assert_eq!(zero.next_wait(Some(Instant::now())), MIN_WAIT);
    }

    #[tokio::test]
    async fn test_ack_handle_reports_closed_queue() {
        let (tx, queue) = ack_queue();
        let metrics = Arc::new(ConnectionMetrics::new());
        let handle = AckHandle::new(tx, metrics.clone());

        handle.acknowledge(1, true).unwrap();
        assert_eq!(metrics.snapshot().pipeline.acks_enqueued, 1);

        drop(queue);
        assert!(matches!(
            handle.acknowledge(2, true),
            Err(DeviceError::QueueClosed)
        ));
    }

    #[test]
    fn test_ping_uses_reserved_id() {
        assert_eq!(Message::ping().message_id, MSG_PING);
    }
}
