//! Pure connection configuration for the MQTT transport
//!
//! This module contains pure functions for building broker options and the
//! reconnection backoff policy.

use crate::protocol::QoS;
use crate::transport::session::{SessionOptions, TransportError};
use rumqttc::{MqttOptions, Transport as RumqttcTransport};
use url::Url;

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Custom backoff pattern in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![250, 500, 1000, 2000, 5000],
            sustained_delay: 5000,
        }
    }
}

impl ReconnectConfig {
    /// Calculate backoff delay for given attempt (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = (attempt.saturating_sub(1)) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// Broker endpoint parsed from a URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse `tcp://`, `mqtt://`, `ssl://` or `mqtts://` broker URLs
pub fn parse_broker_url(broker_url: &str) -> Result<BrokerEndpoint, TransportError> {
    let url =
        Url::parse(broker_url).map_err(|_| TransportError::InvalidBrokerUrl(broker_url.to_string()))?;

    let tls = match url.scheme() {
        "tcp" | "mqtt" => false,
        "ssl" | "mqtts" => true,
        _ => return Err(TransportError::InvalidBrokerUrl(broker_url.to_string())),
    };

    let host = url
        .host_str()
        .ok_or_else(|| TransportError::InvalidBrokerUrl(broker_url.to_string()))?
        .to_string();
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok(BrokerEndpoint { host, port, tls })
}

/// Pure function to configure MQTT options from session options
pub fn configure_mqtt_options(options: &SessionOptions) -> Result<MqttOptions, TransportError> {
    let endpoint = parse_broker_url(&options.broker_url)?;
    let credentials = &options.credentials;

    let mut mqtt_options =
        MqttOptions::new(credentials.client_id(), endpoint.host.as_str(), endpoint.port);

    if endpoint.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    mqtt_options.set_credentials(credentials.user_name(), credentials.password());
    mqtt_options.set_keep_alive(options.keep_alive);
    mqtt_options.set_clean_session(options.clean_session);

    // Snapshots and video clips travel as single publishes
    mqtt_options.set_max_packet_size(16 * 1024 * 1024, 16 * 1024 * 1024);

    Ok(mqtt_options)
}

/// Map protocol QoS onto rumqttc QoS
pub fn to_mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}
