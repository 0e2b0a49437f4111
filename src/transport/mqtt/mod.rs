//! MQTT 3.1.1 transport backed by rumqttc
//!
//! Pure functions are kept apart from I/O so most of the logic can be tested
//! without a broker:
//!
//! - [`connection`] - Broker URL parsing, client options and backoff policy
//! - [`message_handler`] - Event routing and inbound dispatch
//! - [`health_monitor`] - Reconnection decisions and state transitions
//! - [`client`] - The event-loop supervisor and [`Transport`](crate::transport::Transport) impl
//!
//! # Usage
//!
//! ```rust,no_run
//! use cloudlink::protocol::{Credentials, DeviceIdentity, QoS};
//! use cloudlink::transport::{MqttTransport, SessionOptions, Transport};
//!
//! # tokio_test::block_on(async {
//! let identity = DeviceIdentity::new("DOMAIN", "KitchenCamera", "RaspCAM", "1.0.0");
//! let options = SessionOptions::new(
//!     "tcp://localhost:1883",
//!     Credentials::from_identity(&identity, "api-key"),
//!     true,
//! );
//!
//! let transport = MqttTransport::new();
//! transport.connect(&options).await?;
//! transport
//!     .publish("/DOMAIN/device/KitchenCamera/msgs/1/RaspCAM/1.0.0", b"{}".to_vec(), QoS::AtMostOnce, false)
//!     .await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::MqttTransport;
pub use connection::{parse_broker_url, BrokerEndpoint, ReconnectConfig};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, InboundRouter, MessageHandler};
