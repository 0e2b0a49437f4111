//! Connection manager: owns the transport session and the pipeline worker

use super::pipeline::{ack_queue, AckHandle, AckPipeline, AckQueue, PipelineWorker};
use super::DevicePublisher;
use crate::config::DeviceConfig;
use crate::device_span;
use crate::error::{sanitize_error_message, DeviceError, DeviceResult};
use crate::observability::{ConnectionMetrics, MetricsSnapshot};
use crate::protocol::{
    Credentials, DeviceIdentity, Fields, Message, MessageId, PendingAck, QoS, TopicRouter,
    ValidationError,
};
use crate::transport::{SessionOptions, SharedProcessor, Transport};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn, Instrument};

/// Bound on the graceful transport disconnect during `close`
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// How long `close` waits for the worker before aborting it
const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Commands are subscribed at-least-once
const COMMAND_QOS: QoS = QoS::AtLeastOnce;

/// Lifecycle of a [`DeviceConnection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Closed,
    Opening,
    Open,
    Closing,
}

/// A device's connection to the platform
///
/// Holds exactly one transport session and, while open, exactly one
/// heartbeat/ack worker. Open and close are serialized against each other.
pub struct DeviceConnection<T: Transport + 'static> {
    router: TopicRouter,
    credentials: Credentials,
    broker_url: String,
    heartbeat: Duration,
    transport: Arc<T>,
    processor: SharedProcessor,
    ack_tx: mpsc::UnboundedSender<PendingAck>,
    ack_rx: AckQueue,
    worker: Mutex<Option<PipelineWorker>>,
    state_tx: watch::Sender<LifecycleState>,
    metrics: Arc<ConnectionMetrics>,
}

impl<T: Transport + 'static> DeviceConnection<T> {
    /// Build a closed connection; nothing touches the network until `open`
    pub fn new(
        identity: DeviceIdentity,
        api_key: impl Into<String>,
        broker_url: impl Into<String>,
        heartbeat: Duration,
        transport: Arc<T>,
        processor: SharedProcessor,
    ) -> DeviceResult<Self> {
        identity.validate()?;
        if heartbeat.is_zero() {
            return Err(ValidationError::ZeroHeartbeat.into());
        }

        let credentials = Credentials::from_identity(&identity, api_key);
        let (ack_tx, ack_rx) = ack_queue();
        let (state_tx, _) = watch::channel(LifecycleState::Closed);

        Ok(Self {
            router: TopicRouter::new(identity),
            credentials,
            broker_url: broker_url.into(),
            heartbeat,
            transport,
            processor,
            ack_tx,
            ack_rx,
            worker: Mutex::new(None),
            state_tx,
            metrics: Arc::new(ConnectionMetrics::new()),
        })
    }

    /// Build from a loaded configuration, reading the API key from the environment
    pub fn from_config(
        config: &DeviceConfig,
        transport: Arc<T>,
        processor: SharedProcessor,
    ) -> DeviceResult<Self> {
        Self::new(
            config.identity(),
            config.api_key()?,
            config.mqtt.broker_url.clone(),
            config.heartbeat(),
            transport,
            processor,
        )
    }

    pub fn router(&self) -> &TopicRouter {
        &self.router
    }

    pub fn identity(&self) -> &DeviceIdentity {
        self.router.identity()
    }

    pub fn heartbeat(&self) -> Duration {
        self.heartbeat
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn state(&self) -> LifecycleState {
        *self.state_tx.borrow()
    }

    /// Watch lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: LifecycleState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Connection lifecycle transition");
        }
    }

    /// Open the session, subscribe to commands and start the pipeline worker
    ///
    /// A no-op when already open. On failure no worker runs and the
    /// connection stays closed.
    pub async fn open(&self, reconnect: bool) -> DeviceResult<()> {
        let span = device_span!(device_id = %self.identity().device_id);
        self.open_inner(reconnect).instrument(span).await
    }

    /// Open with auto-reconnect enabled
    pub async fn open_default(&self) -> DeviceResult<()> {
        self.open(true).await
    }

    async fn open_inner(&self, reconnect: bool) -> DeviceResult<()> {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            debug!("Connection already open");
            return Ok(());
        }

        self.set_state(LifecycleState::Opening);
        let options = SessionOptions::new(&self.broker_url, self.credentials.clone(), reconnect);

        if let Err(e) = self.transport.connect(&options).await {
            self.metrics.connection_failed();
            self.set_state(LifecycleState::Closed);
            warn!(error = %sanitize_error_message(&e.to_string()), "Connect failed");
            return Err(DeviceError::Connect(e));
        }

        let command_topic = self.router.device_command_topic();
        if let Err(e) = self
            .transport
            .subscribe(&command_topic, COMMAND_QOS, self.inbound_processor())
            .await
        {
            self.transport.force_disconnect().await;
            self.metrics.connection_failed();
            self.set_state(LifecycleState::Closed);
            warn!(topic = %command_topic, error = %e, "Command subscription failed");
            return Err(DeviceError::Connect(e));
        }

        let pipeline = AckPipeline {
            transport: self.transport.clone(),
            router: self.router.clone(),
            heartbeat: self.heartbeat,
            metrics: self.metrics.clone(),
        };
        *worker = Some(pipeline.spawn(self.ack_rx.clone()));

        self.metrics.connection_opened();
        self.set_state(LifecycleState::Open);
        info!(
            broker_url = %self.broker_url,
            command_topic = %command_topic,
            heartbeat_ms = self.heartbeat.as_millis() as u64,
            auto_reconnect = reconnect,
            "Device connection open"
        );
        Ok(())
    }

    /// Count inbound messages, then hand them on untouched
    fn inbound_processor(&self) -> SharedProcessor {
        let processor = self.processor.clone();
        let metrics = self.metrics.clone();
        Arc::new(move |topic: &str, payload: &[u8]| {
            metrics.inbound_received();
            processor.process(topic, payload);
        })
    }

    /// Stop the worker, then tear down the session
    ///
    /// Idempotent. Disconnect errors are logged, never returned: the session
    /// is considered closed either way.
    pub async fn close(&self) {
        let span = device_span!(device_id = %self.identity().device_id);
        self.close_inner().instrument(span).await
    }

    async fn close_inner(&self) {
        let mut worker = self.worker.lock().await;
        let Some(pipeline) = worker.take() else {
            return;
        };

        self.set_state(LifecycleState::Closing);

        // Worker first: it must never publish on a session being torn down
        if !pipeline.stop(WORKER_STOP_TIMEOUT).await {
            warn!("Pipeline worker aborted during close");
        }

        if let Err(e) = self.transport.disconnect(DISCONNECT_TIMEOUT).await {
            warn!(
                error = %sanitize_error_message(&e.to_string()),
                "Graceful disconnect failed, forcing"
            );
            self.transport.force_disconnect().await;
        }

        self.metrics.connection_closed();
        self.set_state(LifecycleState::Closed);
        info!("Device connection closed");
    }

    /// True while open and the transport reports a live session
    pub fn is_connected(&self) -> bool {
        self.state() == LifecycleState::Open && self.transport.is_connected()
    }

    /// Queue an acknowledgment for an inbound command; never blocks
    pub fn acknowledge(&self, correlation_id: i64, acked: bool) -> DeviceResult<()> {
        self.ack_handle().acknowledge(correlation_id, acked)
    }

    /// Handle for acknowledging from other tasks or the inbound callback
    pub fn ack_handle(&self) -> AckHandle {
        AckHandle::new(self.ack_tx.clone(), self.metrics.clone())
    }

    fn ensure_open(&self) -> DeviceResult<()> {
        if self.state() != LifecycleState::Open {
            return Err(DeviceError::NotOpen);
        }
        Ok(())
    }

    /// Serialize and publish a message to its message topic
    pub async fn send(&self, message: Message) -> DeviceResult<()> {
        self.ensure_open()?;

        let topic = self.router.message_topic(message.message_id);
        let payload = message.payload()?;

        self.transport
            .publish(&topic, payload, message.qos, message.retained)
            .await
            .map_err(|e| {
                self.metrics.publish_failed();
                DeviceError::publish(topic.clone(), e)
            })?;

        self.metrics.message_sent();
        debug!(message_id = message.message_id, topic = %topic, "Message sent");
        Ok(())
    }

    pub async fn send_message(
        &self,
        message_id: MessageId,
        fields: Fields,
        qos: QoS,
        retained: bool,
    ) -> DeviceResult<()> {
        self.send(Message::new(message_id, fields).with_qos(qos).retained(retained))
            .await
    }

    /// Send with QoS 0, not retained
    pub async fn publish(&self, message_id: MessageId, fields: Fields) -> DeviceResult<()> {
        self.send(Message::new(message_id, fields)).await
    }

    /// Publish a still image to the snapshot topic
    pub async fn send_picture(
        &self,
        camera_id: &str,
        live: bool,
        format: &str,
        data: Vec<u8>,
        qos: QoS,
        retained: bool,
    ) -> DeviceResult<()> {
        let topic = self.router.snapshot_topic(camera_id, live, format);
        self.send_media(topic, data, qos, retained).await
    }

    /// Publish a video segment to the stream topic
    pub async fn send_video(
        &self,
        camera_id: &str,
        live: bool,
        format: &str,
        data: Vec<u8>,
        qos: QoS,
        retained: bool,
    ) -> DeviceResult<()> {
        let topic = self.router.stream_topic(camera_id, live, format);
        self.send_media(topic, data, qos, retained).await
    }

    async fn send_media(
        &self,
        topic: String,
        data: Vec<u8>,
        qos: QoS,
        retained: bool,
    ) -> DeviceResult<()> {
        self.ensure_open()?;

        let bytes = data.len();
        self.transport
            .publish(&topic, data, qos, retained)
            .await
            .map_err(|e| {
                self.metrics.publish_failed();
                DeviceError::publish(topic.clone(), e)
            })?;

        self.metrics.media_sent(bytes);
        debug!(topic = %topic, bytes, "Media sent");
        Ok(())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

#[async_trait]
impl<T: Transport + 'static> DevicePublisher for DeviceConnection<T> {
    async fn open(&self, reconnect: bool) -> DeviceResult<()> {
        DeviceConnection::open(self, reconnect).await
    }

    async fn close(&self) {
        DeviceConnection::close(self).await
    }

    fn is_connected(&self) -> bool {
        DeviceConnection::is_connected(self)
    }

    async fn send_message(
        &self,
        message_id: MessageId,
        fields: Fields,
        qos: QoS,
        retained: bool,
    ) -> DeviceResult<()> {
        DeviceConnection::send_message(self, message_id, fields, qos, retained).await
    }

    async fn send_picture(
        &self,
        camera_id: &str,
        live: bool,
        format: &str,
        data: Vec<u8>,
        qos: QoS,
        retained: bool,
    ) -> DeviceResult<()> {
        DeviceConnection::send_picture(self, camera_id, live, format, data, qos, retained).await
    }

    async fn send_video(
        &self,
        camera_id: &str,
        live: bool,
        format: &str,
        data: Vec<u8>,
        qos: QoS,
        retained: bool,
    ) -> DeviceResult<()> {
        DeviceConnection::send_video(self, camera_id, live, format, data, qos, retained).await
    }
}

impl<T: Transport + 'static> Drop for DeviceConnection<T> {
    fn drop(&mut self) {
        // Can't await here; stop the worker so it doesn't outlive the connection
        if let Some(worker) = self.worker.get_mut().take() {
            worker.abort();
        }
    }
}
