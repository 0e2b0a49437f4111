//! Session configuration, state and errors shared by every transport

use crate::protocol::Credentials;
use std::time::Duration;
use thiserror::Error;

/// Broker keep-alive interval
pub const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Options for one broker session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    /// Broker URL, e.g. `tcp://mqtt.example.io:1883`
    pub broker_url: String,
    pub credentials: Credentials,
    pub keep_alive: Duration,
    pub clean_session: bool,
    /// Reconnect in the background after the session drops
    pub auto_reconnect: bool,
}

impl SessionOptions {
    /// Keep-alive 30s and clean session, the only combination the platform uses
    pub fn new(broker_url: impl Into<String>, credentials: Credentials, auto_reconnect: bool) -> Self {
        Self {
            broker_url: broker_url.into(),
            credentials,
            keep_alive: KEEP_ALIVE,
            clean_session: true,
            auto_reconnect,
        }
    }
}

/// Connection state reported by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - attempting to connect
    Connecting,
    /// Successfully connected and ready for operations
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
}

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Disconnect failed: {0}")]
    DisconnectFailed(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
}
