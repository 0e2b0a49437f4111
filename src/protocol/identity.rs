//! Device identity and derived broker credentials
//!
//! The identity is fixed for the lifetime of a connection. Every topic the
//! device publishes or subscribes to, and the credentials it presents to the
//! broker, are derived from it.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Prefix the platform expects on device client ids and user names
pub const DEVICE_PREFIX: &str = "DEV_";

/// Who this device is, as registered on the platform
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Tenant domain key issued by the platform
    pub domain_key: String,
    /// Device identifier, e.g. `KitchenCamera`
    pub device_id: String,
    /// Hardware model, e.g. `RaspCAM`
    pub device_model: String,
    /// Firmware version string, e.g. `1.0.0`
    pub firmware_version: String,
}

impl DeviceIdentity {
    pub fn new(
        domain_key: impl Into<String>,
        device_id: impl Into<String>,
        device_model: impl Into<String>,
        firmware_version: impl Into<String>,
    ) -> Self {
        Self {
            domain_key: domain_key.into(),
            device_id: device_id.into(),
            device_model: device_model.into(),
            firmware_version: firmware_version.into(),
        }
    }

    /// Check every identity field can be embedded as a single topic level
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_topic_segment("domain_key", &self.domain_key)?;
        validate_topic_segment("device_id", &self.device_id)?;
        validate_topic_segment("device_model", &self.device_model)?;
        validate_topic_segment("firmware_version", &self.firmware_version)?;
        Ok(())
    }
}

/// Broker credentials derived from a device identity
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    client_id: String,
    user_name: String,
    password: String,
}

impl Credentials {
    /// `client_id = DEV_{device_id}`, `user_name = DEV_{domain_key}`, password is the API key
    pub fn from_identity(identity: &DeviceIdentity, api_key: impl Into<String>) -> Self {
        Self {
            client_id: format!("{DEVICE_PREFIX}{}", identity.device_id),
            user_name: format!("{DEVICE_PREFIX}{}", identity.domain_key),
            password: api_key.into(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("user_name", &self.user_name)
            .field("password", &"***")
            .finish()
    }
}

/// Validate a value that becomes one level of a topic hierarchy
pub fn validate_topic_segment(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::EmptySegment(field));
    }

    for ch in value.chars() {
        if matches!(ch, '/' | '+' | '#') || ch.is_control() {
            return Err(ValidationError::InvalidSegmentChar { field, ch });
        }
    }

    Ok(())
}

/// Identity validation errors
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("{0} cannot be empty")]
    EmptySegment(&'static str),
    #[error("{field} contains invalid topic character: '{ch}'")]
    InvalidSegmentChar { field: &'static str, ch: char },
    #[error("heartbeat interval must be greater than zero")]
    ZeroHeartbeat,
}
