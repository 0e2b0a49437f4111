//! Device-side connection layer
//!
//! [`DeviceConnection`] ties a [`Transport`](crate::transport::Transport) to a
//! device identity: it opens and closes the session, runs the heartbeat/ack
//! pipeline and exposes the send API.

pub mod connection;
pub mod pipeline;

pub use connection::{DeviceConnection, LifecycleState, DISCONNECT_TIMEOUT};
pub use pipeline::{AckHandle, ACK_POLL_INTERVAL};

use crate::error::DeviceResult;
use crate::protocol::{Fields, MessageId, QoS};
use async_trait::async_trait;

/// What any device-to-platform publisher offers, whatever carries the bytes
#[async_trait]
pub trait DevicePublisher: Send + Sync {
    async fn open(&self, reconnect: bool) -> DeviceResult<()>;

    /// Idempotent; never fails
    async fn close(&self);

    fn is_connected(&self) -> bool;

    async fn send_message(
        &self,
        message_id: MessageId,
        fields: Fields,
        qos: QoS,
        retained: bool,
    ) -> DeviceResult<()>;

    async fn send_picture(
        &self,
        camera_id: &str,
        live: bool,
        format: &str,
        data: Vec<u8>,
        qos: QoS,
        retained: bool,
    ) -> DeviceResult<()>;

    async fn send_video(
        &self,
        camera_id: &str,
        live: bool,
        format: &str,
        data: Vec<u8>,
        qos: QoS,
        retained: bool,
    ) -> DeviceResult<()>;
}
