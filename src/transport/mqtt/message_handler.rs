//! Pure event routing and inbound dispatch for the MQTT transport
//!
//! Event classification is pure; dispatch hands raw topic and payload to the
//! processor registered for the matching subscription.

use crate::transport::SharedProcessor;
use rumqttc::mqttbytes::matches as topic_matches;
use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet, QoS, SubscribeReasonCode};
use std::collections::HashMap;
use tracing::debug;

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => {
                    if connack.code == ConnectReturnCode::Success {
                        EventRoute::ConnectionAcknowledged
                    } else {
                        EventRoute::ConnectionRefused(format!("{:?}", connack.code))
                    }
                }
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                },
                Packet::Disconnect => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    failed: suback
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure)),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Broker answered CONNECT with a non-success code
    ConnectionRefused(String),
    /// Message received on subscribed topic
    MessageReceived { topic: String, payload: Vec<u8> },
    /// MQTT broker disconnected
    Disconnected,
    /// Subscription confirmed
    SubscriptionConfirmed { packet_id: u16, failed: bool },
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Our DISCONNECT went out; the session is closing
    DisconnectSent,
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// Subscription filter to processor table
#[derive(Default, Clone)]
pub struct InboundRouter {
    routes: HashMap<String, (QoS, SharedProcessor)>,
}

impl std::fmt::Debug for InboundRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundRouter")
            .field("filters", &self.filters())
            .finish()
    }
}

impl InboundRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, filter: &str, qos: QoS, processor: SharedProcessor) {
        self.routes.insert(filter.to_string(), (qos, processor));
    }

    /// Subscribed filters, for re-subscription after reconnect
    pub fn filters(&self) -> Vec<(String, QoS)> {
        self.routes
            .iter()
            .map(|(filter, (qos, _))| (filter.clone(), *qos))
            .collect()
    }

    pub fn clear(&mut self) {
        self.routes.clear();
    }

    /// Hand the message to every processor whose filter matches; returns the count
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> usize {
        let mut delivered = 0;
        for (filter, (_, processor)) in &self.routes {
            if topic_matches(topic, filter) {
                processor.process(topic, payload);
                delivered += 1;
            }
        }
        if delivered == 0 {
            debug!(topic = %topic, "No processor registered for inbound topic");
        }
        delivered
    }
}
