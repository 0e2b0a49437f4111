//! Message types exchanged with the platform
//!
//! Structured messages are a JSON object keyed by field name, published on the
//! message topic for their message id. Two ids are reserved by the protocol:
//! [`MSG_PING`] for liveness and [`MSG_ACK`] for command acknowledgments.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Application-defined message type identifier
pub type MessageId = i32;

/// Heartbeat message, sent with no fields
pub const MSG_PING: MessageId = 1;

/// Command acknowledgment, fields `{correlationId, acked}`
pub const MSG_ACK: MessageId = 2;

/// Field name carrying the command correlation id
pub const P_CORRELATION_ID: &str = "correlationId";

/// Field name carrying the accept (1) / reject (0) flag
pub const P_ACKED: &str = "acked";

/// Ordered field mapping serialized as the JSON payload
pub type Fields = Map<String, Value>;

/// Delivery guarantee requested from the transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    pub fn level(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(format!("QoS must be 0, 1 or 2, got {other}")),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos.level()
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.level())
    }
}

/// A structured message ready to be published
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_id: MessageId,
    pub fields: Fields,
    pub qos: QoS,
    pub retained: bool,
}

impl Message {
    /// Message with QoS 0, not retained
    pub fn new(message_id: MessageId, fields: Fields) -> Self {
        Self {
            message_id,
            fields,
            qos: QoS::AtMostOnce,
            retained: false,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn retained(mut self, retained: bool) -> Self {
        self.retained = retained;
        self
    }

    pub fn ping() -> Self {
        Self::new(MSG_PING, Fields::new())
    }

    pub fn ack(ack: PendingAck) -> Self {
        Self::new(MSG_ACK, ack.to_fields())
    }

    /// Serialize the fields as a JSON object
    pub fn payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.fields)
    }

    /// Short label used in logs
    pub fn kind(&self) -> &'static str {
        match self.message_id {
            MSG_PING => "ping",
            MSG_ACK => "ack",
            _ => "message",
        }
    }
}

/// Acknowledgment waiting for the pipeline to deliver it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAck {
    #[serde(rename = "correlationId")]
    pub correlation_id: i64,
    #[serde(with = "ack_flag")]
    pub acked: bool,
}

impl PendingAck {
    pub fn new(correlation_id: i64, acked: bool) -> Self {
        Self {
            correlation_id,
            acked,
        }
    }

    pub fn to_fields(self) -> Fields {
        let mut fields = Fields::new();
        fields.insert(P_CORRELATION_ID.to_string(), Value::from(self.correlation_id));
        fields.insert(P_ACKED.to_string(), Value::from(u8::from(self.acked)));
        fields
    }
}

/// `acked` travels as 0|1 on the wire
mod ack_flag {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(acked: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*acked))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        Ok(u8::deserialize(deserializer)? != 0)
    }
}

/// Inbound command as far as the protocol layer cares about it
///
/// The command body is application-defined. Only the correlation id is
/// needed to acknowledge it.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEnvelope {
    pub correlation_id: Option<i64>,
    pub fields: Fields,
}

impl CommandEnvelope {
    /// Parse a JSON object payload
    pub fn parse(payload: &[u8]) -> Result<Self, String> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| format!("Failed to parse command payload: {e}"))?;
        let Value::Object(fields) = value else {
            return Err("Command payload is not a JSON object".to_string());
        };

        let correlation_id = fields.get(P_CORRELATION_ID).and_then(|v| match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        });

        Ok(Self {
            correlation_id,
            fields,
        })
    }
}
