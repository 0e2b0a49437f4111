//! Loading device configuration from disk

mod test_helpers;

use cloudlink::config::{ConfigError, DeviceConfig};
use cloudlink::device::DeviceConnection;
use cloudlink::testing::MockTransport;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use test_helpers::recording_processor;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

const FULL_CONFIG: &str = r#"
[device]
domain_key = "ABCDEF"
api_key_env = "CLOUDLINK_IT_API_KEY"
device_id = "FrontDoor"
device_model = "DoorCAM"
firmware_version = "2.3.1"

[mqtt]
broker_url = "mqtts://broker.example.io:8883"
heartbeat_ms = 5000
auto_reconnect = false
"#;

#[test]
fn test_load_full_config() {
    let file = write_config(FULL_CONFIG);
    let config = DeviceConfig::load_from_file(file.path()).unwrap();

    assert_eq!(config.device.domain_key, "ABCDEF");
    assert_eq!(config.device.api_key_env, "CLOUDLINK_IT_API_KEY");
    assert_eq!(config.mqtt.broker_url, "mqtts://broker.example.io:8883");
    assert_eq!(config.heartbeat(), Duration::from_secs(5));
    assert!(!config.mqtt.auto_reconnect);
}

#[test]
fn test_missing_file() {
    let result = DeviceConfig::load_from_file(Path::new("/nonexistent/cloudlink/device.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml() {
    let file = write_config("[device\ndomain_key = ");
    assert!(matches!(
        DeviceConfig::load_from_file(file.path()),
        Err(ConfigError::TomlParse(_))
    ));
}

#[test]
fn test_missing_required_field() {
    let file = write_config(
        r#"
[device]
domain_key = "ABCDEF"
device_id = "FrontDoor"

[mqtt]
broker_url = "tcp://localhost:1883"
"#,
    );
    assert!(matches!(
        DeviceConfig::load_from_file(file.path()),
        Err(ConfigError::TomlParse(_))
    ));
}

#[test]
fn test_wildcard_in_identity_rejected() {
    let file = write_config(&FULL_CONFIG.replace("FrontDoor", "Front+Door"));
    assert!(matches!(
        DeviceConfig::load_from_file(file.path()),
        Err(ConfigError::InvalidIdentity(_))
    ));
}

#[test]
fn test_unsupported_broker_scheme_rejected() {
    let file = write_config(&FULL_CONFIG.replace("mqtts://", "ws://"));
    assert!(matches!(
        DeviceConfig::load_from_file(file.path()),
        Err(ConfigError::InvalidConfig(_))
    ));
}

#[test]
fn test_connection_from_config_needs_api_key() {
    let file = write_config(&FULL_CONFIG.replace("CLOUDLINK_IT_API_KEY", "CLOUDLINK_IT_UNSET_KEY"));
    let config = DeviceConfig::load_from_file(file.path()).unwrap();
    let (processor, _) = recording_processor();

    let result =
        DeviceConnection::from_config(&config, Arc::new(MockTransport::new()), processor);
    assert!(result.is_err());
}

#[tokio::test]
async fn test_connection_from_config_uses_settings() {
    std::env::set_var("CLOUDLINK_IT_API_KEY", "secret-from-env");
    let file = write_config(FULL_CONFIG);
    let config = DeviceConfig::load_from_file(file.path()).unwrap();
    let transport = Arc::new(MockTransport::new());
    let (processor, _) = recording_processor();

    let connection = DeviceConnection::from_config(&config, transport.clone(), processor).unwrap();
    assert_eq!(connection.heartbeat(), Duration::from_secs(5));
    assert_eq!(
        connection.router().device_command_topic(),
        "/ABCDEF/device/FrontDoor/cmds"
    );

    connection.open(config.mqtt.auto_reconnect).await.unwrap();
    let options = transport.get_last_options().await.unwrap();
    assert_eq!(options.broker_url, "mqtts://broker.example.io:8883");
    assert_eq!(options.credentials.password(), "secret-from-env");
    assert_eq!(options.credentials.client_id(), "DEV_FrontDoor");
    assert_eq!(options.credentials.user_name(), "DEV_ABCDEF");
    assert!(!options.auto_reconnect);

    connection.close().await;
}
