//! Test helpers and utilities for integration tests

use cloudlink::device::DeviceConnection;
use cloudlink::protocol::DeviceIdentity;
use cloudlink::testing::MockTransport;
use cloudlink::transport::SharedProcessor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DOMAIN: &str = "DOMAIN";
pub const DEVICE_ID: &str = "KitchenCamera";
pub const MODEL: &str = "RaspCAM";
pub const FIRMWARE: &str = "1.0.0";

#[allow(dead_code)]
pub fn test_identity() -> DeviceIdentity {
    DeviceIdentity::new(DOMAIN, DEVICE_ID, MODEL, FIRMWARE)
}

/// Inbound messages captured by [`recording_processor`]
pub type Inbox = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

#[allow(dead_code)]
pub fn recording_processor() -> (SharedProcessor, Inbox) {
    let inbox: Inbox = Arc::default();
    let sink = inbox.clone();
    let processor: SharedProcessor = Arc::new(move |topic: &str, payload: &[u8]| {
        sink.lock().unwrap().push((topic.to_string(), payload.to_vec()));
    });
    (processor, inbox)
}

/// Closed connection over a fresh mock transport
#[allow(dead_code)]
pub fn mock_connection(
    heartbeat: Duration,
) -> (DeviceConnection<MockTransport>, Arc<MockTransport>, Inbox) {
    let transport = Arc::new(MockTransport::new());
    let (processor, inbox) = recording_processor();
    let connection = DeviceConnection::new(
        test_identity(),
        "test-api-key",
        "tcp://localhost:1883",
        heartbeat,
        transport.clone(),
        processor,
    )
    .expect("test identity is valid");
    (connection, transport, inbox)
}

#[allow(dead_code)]
pub fn message_topic(message_id: i32) -> String {
    format!("/{DOMAIN}/device/{DEVICE_ID}/msgs/{message_id}/{MODEL}/{FIRMWARE}")
}
