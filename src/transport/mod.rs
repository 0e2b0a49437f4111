//! Transport layer for device communication
//!
//! The device protocol only needs a handful of primitives from a
//! publish/subscribe transport. [`Transport`] captures exactly those so the
//! connection manager and heartbeat pipeline can be driven by MQTT in
//! production and by [`crate::testing::MockTransport`] in tests.

use crate::protocol::QoS;
use std::sync::Arc;
use std::time::Duration;

pub mod mqtt;
pub mod session;

pub use session::{ConnectionState, SessionOptions, TransportError};

/// Receives every message arriving on a subscribed topic
///
/// Called from the transport's own event-loop task, so implementations must
/// return quickly and never block on that task.
pub trait MessageProcessor: Send + Sync {
    fn process(&self, topic: &str, payload: &[u8]);
}

impl<F> MessageProcessor for F
where
    F: Fn(&str, &[u8]) + Send + Sync,
{
    fn process(&self, topic: &str, payload: &[u8]) {
        self(topic, payload)
    }
}

/// Shared inbound processor handle
pub type SharedProcessor = Arc<dyn MessageProcessor>;

/// Publish/subscribe session primitives consumed by the device layer
///
/// All methods take `&self`: the session is shared between foreground sends
/// and the background heartbeat pipeline, so implementations must be safe
/// for concurrent `publish` calls.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Establish a session, failing if the broker does not accept it
    async fn connect(&self, options: &SessionOptions) -> Result<(), TransportError>;

    /// Subscribe to a topic, routing its messages to `processor`
    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        processor: SharedProcessor,
    ) -> Result<(), TransportError>;

    /// Publish raw bytes to a topic
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retained: bool,
    ) -> Result<(), TransportError>;

    /// Graceful disconnect, bounded by `timeout`
    async fn disconnect(&self, timeout: Duration) -> Result<(), TransportError>;

    /// Drop the session without waiting on the broker
    async fn force_disconnect(&self);

    /// True while the broker session is up
    fn is_connected(&self) -> bool;
}

/// Type alias for MQTT transport
pub type MqttTransport = mqtt::MqttTransport;
