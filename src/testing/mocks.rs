//! Mock transport for testing
//!
//! Records every publish with the (tokio) instant it happened so tests can
//! check heartbeat spacing and teardown ordering under a paused clock.

use crate::protocol::{Fields, QoS, MSG_ACK, MSG_PING};
use crate::transport::mqtt::connection::to_mqtt_qos;
use crate::transport::mqtt::InboundRouter;
use crate::transport::{ConnectionState, SessionOptions, SharedProcessor, Transport, TransportError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// One publish seen by the mock
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRecord {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retained: bool,
    pub at: Instant,
}

impl PublishRecord {
    /// Decode the payload as a JSON field map
    pub fn fields(&self) -> Option<Fields> {
        serde_json::from_slice(&self.payload).ok()
    }

    /// Message id from a `.../msgs/{id}/{model}/{firmware}` topic
    pub fn message_id(&self) -> Option<i32> {
        let levels: Vec<&str> = self.topic.split('/').collect();
        let position = levels.iter().position(|level| *level == "msgs")?;
        levels.get(position + 1)?.parse().ok()
    }

    pub fn is_ping(&self) -> bool {
        self.message_id() == Some(MSG_PING)
    }

    pub fn is_ack(&self) -> bool {
        self.message_id() == Some(MSG_ACK)
    }
}

/// In-memory [`Transport`] with switchable failures
#[derive(Debug, Default)]
pub struct MockTransport {
    pub published: Arc<Mutex<Vec<PublishRecord>>>,
    pub subscriptions: Arc<Mutex<Vec<(String, QoS)>>>,
    pub last_options: Arc<Mutex<Option<SessionOptions>>>,
    pub disconnect_started_at: Arc<Mutex<Option<Instant>>>,
    inbound: Mutex<InboundRouter>,
    connected: AtomicBool,
    fail_connect: AtomicBool,
    fail_subscribe: AtomicBool,
    fail_publish: AtomicBool,
    fail_disconnect: AtomicBool,
    connects: AtomicUsize,
    force_disconnects: AtomicUsize,
    rejected_publishes: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock whose connect handshake always fails
    pub fn with_connect_failure() -> Self {
        let transport = Self::default();
        transport.set_fail_connect(true);
        transport
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_disconnect(&self, fail: bool) {
        self.fail_disconnect.store(fail, Ordering::SeqCst);
    }

    /// Simulate the broker dropping the session
    pub fn drop_session(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn force_disconnect_count(&self) -> usize {
        self.force_disconnects.load(Ordering::SeqCst)
    }

    /// Publishes attempted while no session was up
    pub fn rejected_publish_count(&self) -> usize {
        self.rejected_publishes.load(Ordering::SeqCst)
    }

    pub async fn get_published(&self) -> Vec<PublishRecord> {
        self.published.lock().await.clone()
    }

    pub async fn get_pings(&self) -> Vec<PublishRecord> {
        self.get_published()
            .await
            .into_iter()
            .filter(PublishRecord::is_ping)
            .collect()
    }

    pub async fn get_acks(&self) -> Vec<PublishRecord> {
        self.get_published()
            .await
            .into_iter()
            .filter(PublishRecord::is_ack)
            .collect()
    }

    pub async fn get_subscriptions(&self) -> Vec<(String, QoS)> {
        self.subscriptions.lock().await.clone()
    }

    pub async fn get_last_options(&self) -> Option<SessionOptions> {
        self.last_options.lock().await.clone()
    }

    pub async fn get_disconnect_started_at(&self) -> Option<Instant> {
        *self.disconnect_started_at.lock().await
    }

    pub async fn clear_history(&self) {
        self.published.lock().await.clear();
    }

    /// Inject an inbound message as if the broker delivered it
    pub async fn deliver(&self, topic: &str, payload: &[u8]) -> usize {
        self.inbound.lock().await.dispatch(topic, payload)
    }

    fn not_connected() -> TransportError {
        TransportError::NotConnected {
            state: ConnectionState::Disconnected("Mock session closed".to_string()),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, options: &SessionOptions) -> Result<(), TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.last_options.lock().await = Some(options.clone());

        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailedStr(
                "Mock connection refused: BadUserNamePassword".to_string(),
            ));
        }

        *self.disconnect_started_at.lock().await = None;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        processor: SharedProcessor,
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(Self::not_connected());
        }
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(TransportError::SubscriptionFailed(
                "Mock subscription failure".into(),
            ));
        }

        self.inbound
            .lock()
            .await
            .register(topic, to_mqtt_qos(qos), processor);
        self.subscriptions.lock().await.push((topic.to_string(), qos));
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retained: bool,
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            self.rejected_publishes.fetch_add(1, Ordering::SeqCst);
            return Err(Self::not_connected());
        }
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::PublishFailed("Mock publish failure".into()));
        }

        self.published.lock().await.push(PublishRecord {
            topic: topic.to_string(),
            payload,
            qos,
            retained,
            at: Instant::now(),
        });
        Ok(())
    }

    async fn disconnect(&self, _timeout: Duration) -> Result<(), TransportError> {
        *self.disconnect_started_at.lock().await = Some(Instant::now());

        if self.fail_disconnect.load(Ordering::SeqCst) {
            return Err(TransportError::DisconnectFailed(
                "Mock disconnect timed out".to_string(),
            ));
        }

        self.connected.store(false, Ordering::SeqCst);
        self.inbound.lock().await.clear();
        Ok(())
    }

    async fn force_disconnect(&self) {
        self.force_disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.inbound.lock().await.clear();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
