//! Impure I/O operations for the MQTT transport
//!
//! This module handles network communication, the event-loop supervisor task
//! and integration with the rumqttc client.

use super::connection::{configure_mqtt_options, to_mqtt_qos, ReconnectConfig};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, InboundRouter, MessageHandler};
use crate::protocol::QoS;
use crate::transport::session::{ConnectionState, SessionOptions, TransportError};
use crate::transport::{SharedProcessor, Transport};
use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the request channel between client handle and event loop
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// How long `connect` waits for the broker's ConnAck
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Background pieces of one live session
struct SessionHandle {
    shutdown_tx: watch::Sender<bool>,
    event_loop_handle: JoinHandle<()>,
}

/// MQTT implementation of [`Transport`] backed by rumqttc
pub struct MqttTransport {
    client: Arc<Mutex<Option<AsyncClient>>>,
    inbound: Arc<Mutex<InboundRouter>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    session: Mutex<Option<SessionHandle>>,
    reconnect_config: ReconnectConfig,
}

impl MqttTransport {
    pub fn new() -> Self {
        Self::with_reconnect_config(ReconnectConfig::default())
    }

    pub fn with_reconnect_config(reconnect_config: ReconnectConfig) -> Self {
        let (state_tx, state_rx) =
            watch::channel(ConnectionState::Disconnected("Not connected".to_string()));
        Self {
            client: Arc::new(Mutex::new(None)),
            inbound: Arc::new(Mutex::new(InboundRouter::new())),
            state_tx: Arc::new(state_tx),
            state_rx,
            session: Mutex::new(None),
            reconnect_config,
        }
    }

    /// Get current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Wait for connection confirmation (ConnAck) with timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                let state = state_rx.borrow_and_update().clone();
                match state {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(reason) => {
                        return Err(TransportError::ConnectionFailedStr(reason));
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting(_) => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(TransportError::ConnectionFailedStr(
                        "State channel closed".to_string(),
                    ));
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectionFailedStr(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    /// Check connection state before operations
    fn check_connection_state(&self) -> Result<(), TransportError> {
        let current_state = self.connection_state();
        if !HealthMonitor::can_publish(&current_state) {
            return Err(TransportError::NotConnected {
                state: current_state,
            });
        }
        Ok(())
    }

    /// Clone of the live client handle
    ///
    /// The lock is released before any request is queued: a full request
    /// channel must not block the event loop's own resubscription.
    async fn current_client(&self) -> Result<AsyncClient, TransportError> {
        self.client
            .lock()
            .await
            .clone()
            .ok_or_else(|| TransportError::NotConnected {
                state: self.connection_state(),
            })
    }

    /// Stop the supervisor and drop the client handle
    async fn release_session(&self, session: SessionHandle) {
        let _ = session.shutdown_tx.send(true);
        session.event_loop_handle.abort();
        self.client.lock().await.take();
        self.inbound.lock().await.clear();
        transition(&self.state_tx, ConnectionEvent::ClientClosed);
    }
}

impl Default for MqttTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply a connection event to the shared state, logging real transitions
fn transition(state_tx: &watch::Sender<ConnectionState>, event: ConnectionEvent) {
    let next = HealthMonitor::determine_next_state(event);
    let previous = state_tx.send_replace(next.clone());
    if previous != next {
        HealthMonitor::log_state_transition(&previous, &next);
    }
}

/// State owned by the event-loop supervisor task
struct EventLoopSupervisor {
    client: Arc<Mutex<Option<AsyncClient>>>,
    inbound: Arc<Mutex<InboundRouter>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    reconnect_config: ReconnectConfig,
    auto_reconnect: bool,
    reconnect_attempts: u32,
    ever_connected: bool,
}

impl EventLoopSupervisor {
    async fn run(mut self, mut event_loop: EventLoop, mut shutdown_rx: watch::Receiver<bool>) {
        info!("Starting MQTT event loop supervisor");

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping event loop supervisor");
                        break;
                    }
                }

                polled = event_loop.poll() => {
                    let keep_running = match polled {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            self.process_event_route(route).await
                        }
                        Err(e) => self.handle_event_loop_error(e.to_string(), &shutdown_rx).await,
                    };
                    if !keep_running {
                        break;
                    }
                }
            }
        }

        info!("MQTT event loop stopped");
    }

    /// Returns true to continue loop, false to break
    async fn process_event_route(&mut self, route: EventRoute) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                let reconnected = self.ever_connected;
                transition(&self.state_tx, ConnectionEvent::ConnAckReceived);
                self.reconnect_attempts = 0;
                self.ever_connected = true;
                if reconnected {
                    self.resubscribe().await;
                }
                true
            }
            EventRoute::ConnectionRefused(code) => {
                transition(
                    &self.state_tx,
                    ConnectionEvent::NetworkError(format!("Connection refused: {code}")),
                );
                false
            }
            EventRoute::MessageReceived { topic, payload } => {
                debug!(target: "mqtt_transport", topic = %topic, bytes = payload.len(), "Received MQTT message");
                self.inbound.lock().await.dispatch(&topic, &payload);
                true
            }
            EventRoute::Disconnected => {
                transition(&self.state_tx, ConnectionEvent::DisconnectedByBroker);
                true
            }
            EventRoute::SubscriptionConfirmed { packet_id, failed } => {
                if failed {
                    error!(packet_id, "Broker rejected subscription");
                } else {
                    debug!(target: "mqtt_transport", packet_id, "Subscription confirmed");
                }
                true
            }
            EventRoute::InfrastructureEvent(event_str) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event_str);
                true
            }
            EventRoute::DisconnectSent => {
                transition(&self.state_tx, ConnectionEvent::ClientClosed);
                false
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    /// Returns true to continue loop (after backoff), false to break
    async fn handle_event_loop_error(
        &mut self,
        error: String,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> bool {
        transition(&self.state_tx, ConnectionEvent::NetworkError(error.clone()));

        let decision = HealthMonitor::should_attempt_reconnection(
            self.reconnect_attempts,
            &self.reconnect_config,
            self.auto_reconnect,
            self.ever_connected,
            *shutdown_rx.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                self.reconnect_attempts = attempt;
                transition(&self.state_tx, ConnectionEvent::ReconnectionStarted(attempt));
                info!(attempt, delay_ms, error = %error, "Reconnecting to MQTT broker");
                // rumqttc reconnects on the next poll
                interruptible_sleep(shutdown_rx.clone(), delay_ms).await
            }
            ReconnectionDecision::AbortShutdownRequested => false,
            ReconnectionDecision::AbortReconnectDisabled => {
                if self.ever_connected {
                    warn!("MQTT session lost and auto-reconnect is disabled");
                }
                false
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                error!(
                    attempts = self.reconnect_attempts,
                    "Max reconnection attempts exceeded"
                );
                false
            }
        }
    }

    /// Clean sessions lose their subscriptions on reconnect
    async fn resubscribe(&self) {
        let filters = self.inbound.lock().await.filters();
        let Some(client) = self.client.lock().await.clone() else {
            return;
        };
        for (filter, qos) in filters {
            // try_subscribe: awaiting here would stall the event loop that drains the request channel
            if let Err(e) = client.try_subscribe(filter.as_str(), qos) {
                error!("Failed to re-subscribe to {}: {}", filter, e);
            } else {
                debug!(target: "mqtt_transport", "Re-subscribed to: {}", filter);
            }
        }
    }
}

/// Perform interruptible sleep with shutdown monitoring
/// Returns true if sleep completed, false if shutdown requested
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => {
            !(changed.is_err() || *shutdown_rx.borrow())
        }
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self, options: &SessionOptions) -> Result<(), TransportError> {
        let mut session = self.session.lock().await;
        if let Some(existing) = session.as_ref() {
            if !existing.event_loop_handle.is_finished() {
                return Err(TransportError::ConnectionFailedStr(
                    "Session already open".to_string(),
                ));
            }
        }

        let mqtt_options = configure_mqtt_options(options)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        *self.client.lock().await = Some(client);
        self.state_tx.send_replace(ConnectionState::Connecting);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = EventLoopSupervisor {
            client: self.client.clone(),
            inbound: self.inbound.clone(),
            state_tx: self.state_tx.clone(),
            reconnect_config: self.reconnect_config.clone(),
            auto_reconnect: options.auto_reconnect,
            reconnect_attempts: 0,
            ever_connected: false,
        };
        let event_loop_handle = tokio::spawn(supervisor.run(event_loop, shutdown_rx));
        let handle = SessionHandle {
            shutdown_tx,
            event_loop_handle,
        };

        info!(
            broker_url = %options.broker_url,
            client_id = %options.credentials.client_id(),
            auto_reconnect = options.auto_reconnect,
            "Connecting to MQTT broker"
        );

        match Self::wait_for_connection_confirmation(self.state_rx.clone(), CONNECT_TIMEOUT).await
        {
            Ok(()) => {
                *session = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.release_session(handle).await;
                Err(e)
            }
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        processor: SharedProcessor,
    ) -> Result<(), TransportError> {
        self.check_connection_state()?;

        let mqtt_qos = to_mqtt_qos(qos);
        self.inbound
            .lock()
            .await
            .register(topic, mqtt_qos, processor);

        let client = self.current_client().await?;
        client.subscribe(topic, mqtt_qos).await.map_err(|e| {
            TransportError::SubscriptionFailed(format!("Failed to subscribe to {topic}: {e}").into())
        })?;

        info!("Subscribed to: {}", topic);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retained: bool,
    ) -> Result<(), TransportError> {
        self.check_connection_state()?;

        let client = self.current_client().await?;
        client
            .publish(topic, to_mqtt_qos(qos), retained, payload)
            .await
            .map_err(|e| TransportError::PublishFailed(Box::new(e)))
    }

    async fn disconnect(&self, timeout: Duration) -> Result<(), TransportError> {
        let mut session = self.session.lock().await;
        let Some(handle) = session.as_mut() else {
            return Ok(());
        };

        if handle.event_loop_handle.is_finished() {
            if let Some(handle) = session.take() {
                self.release_session(handle).await;
            }
            return Ok(());
        }

        let client = self.client.lock().await.clone();
        if let Some(client) = client {
            client
                .disconnect()
                .await
                .map_err(|e| TransportError::DisconnectFailed(e.to_string()))?;
        }

        match tokio::time::timeout(timeout, &mut handle.event_loop_handle).await {
            Ok(_) => {
                if let Some(handle) = session.take() {
                    self.release_session(handle).await;
                }
                info!("MQTT session closed gracefully");
                Ok(())
            }
            Err(_) => Err(TransportError::DisconnectFailed(format!(
                "DISCONNECT not flushed within {}ms",
                timeout.as_millis()
            ))),
        }
    }

    async fn force_disconnect(&self) {
        if let Some(handle) = self.session.lock().await.take() {
            warn!("Forcing MQTT session teardown");
            self.release_session(handle).await;
        }
    }

    fn is_connected(&self) -> bool {
        HealthMonitor::can_publish(&self.state_rx.borrow())
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        // Can't await in Drop; only make sure the supervisor task stops
        if let Some(handle) = self.session.get_mut().take() {
            let _ = handle.shutdown_tx.send(true);
            handle.event_loop_handle.abort();
        }
    }
}
