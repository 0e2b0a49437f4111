//! Pure reconnection and state-transition logic for the MQTT transport

use super::connection::ReconnectConfig;
use crate::transport::session::ConnectionState;
use tracing::{error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Determine if reconnection should be attempted (pure function)
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        auto_reconnect: bool,
        ever_connected: bool,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        // Initial handshake failures are reported to the caller, not retried
        if !auto_reconnect || !ever_connected {
            return ReconnectionDecision::AbortReconnectDisabled;
        }

        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        ReconnectionDecision::Proceed {
            attempt: current_attempts + 1,
            delay_ms: config.calculate_backoff_delay(current_attempts + 1),
        }
    }

    /// Determine next state after connection event (pure function)
    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnAckReceived => ConnectionState::Connected,
            ConnectionEvent::DisconnectedByBroker => {
                ConnectionState::Disconnected("Broker disconnected".to_string())
            }
            ConnectionEvent::NetworkError(error) => ConnectionState::Disconnected(error),
            ConnectionEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(attempt),
            ConnectionEvent::ClientClosed => {
                ConnectionState::Disconnected("Client disconnected".to_string())
            }
        }
    }

    /// Check if connection state allows publishing (pure function)
    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Log connection state transition
    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("MQTT session established");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected(reason)) => {
                warn!("MQTT session lost: {}", reason);
            }
            (ConnectionState::Reconnecting(attempt), ConnectionState::Connected) => {
                info!(attempt, "MQTT session re-established");
            }
            (ConnectionState::Connecting, ConnectionState::Disconnected(reason)) => {
                error!("MQTT handshake failed: {}", reason);
            }
            _ => {
                info!("MQTT connection state: {:?} -> {:?}", from, to);
            }
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt
    Proceed { attempt: u32, delay_ms: u64 },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - auto reconnect off, or the session never came up
    AbortReconnectDisabled,
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// ConnAck received from broker
    ConnAckReceived,
    /// Broker initiated disconnect
    DisconnectedByBroker,
    /// Network or protocol error
    NetworkError(String),
    /// Reconnection attempt started
    ReconnectionStarted(u32),
    /// Local side closed the session
    ClientClosed,
}
