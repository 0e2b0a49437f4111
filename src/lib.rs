//! cloudlink - device-side message exchange client
//!
//! Lets an embedded device talk to a cloud platform over MQTT:
//! - Topic routing for commands, messages, snapshots and video streams
//! - Connection lifecycle with optional auto-reconnect
//! - A background heartbeat/ack pipeline that keeps the session alive and
//!   delivers command acknowledgments without blocking the caller
//! - Direct sends for structured messages and binary media
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use cloudlink::device::DeviceConnection;
//! use cloudlink::protocol::{DeviceIdentity, Fields, QoS};
//! use cloudlink::transport::MqttTransport;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let connection = DeviceConnection::new(
//!     DeviceIdentity::new("DOMAIN", "KitchenCamera", "RaspCAM", "1.0.0"),
//!     std::env::var("DEVICE_API_KEY")?,
//!     "tcp://mqtt.example.io:1883",
//!     Duration::from_secs(30),
//!     Arc::new(MqttTransport::new()),
//!     Arc::new(|topic: &str, payload: &[u8]| {
//!         println!("command on {topic}: {} bytes", payload.len());
//!     }),
//! )?;
//!
//! connection.open_default().await?;
//!
//! let mut fields = Fields::new();
//! fields.insert("temperature".to_string(), 21.5.into());
//! connection.send_message(100, fields, QoS::AtLeastOnce, false).await?;
//! connection.acknowledge(42, true)?;
//!
//! connection.close().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, DeviceConfig};
pub use device::{AckHandle, DeviceConnection, DevicePublisher, LifecycleState};
pub use error::{DeviceError, DeviceResult};
pub use protocol::*;
