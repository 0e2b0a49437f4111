//! cloudlink - device client entry point

use clap::{Parser, Subcommand};
use cloudlink::config::DeviceConfig;
use cloudlink::device::DeviceConnection;
use cloudlink::error::sanitize_error_message;
use cloudlink::observability::init_default_logging;
use cloudlink::protocol::{CommandEnvelope, Fields, MessageId, QoS};
use cloudlink::transport::{MqttTransport, SharedProcessor};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Device-side client for the cloud message exchange protocol
#[derive(Parser)]
#[command(name = "cloudlink")]
#[command(about = "Device-side client: heartbeat, acknowledgments and telemetry over MQTT")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "CLOUDLINK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stay connected, acknowledge inbound commands and optionally send telemetry
    Run {
        /// Send a telemetry message every N seconds
        #[arg(long, value_name = "SECS")]
        telemetry_interval: Option<u64>,

        /// Message id used for telemetry
        #[arg(long, default_value_t = 100)]
        telemetry_id: MessageId,
    },
    /// Send one message and exit
    Send {
        /// Application message id
        #[arg(long)]
        message_id: MessageId,

        /// Message fields as a JSON object
        #[arg(long, default_value = "{}")]
        fields: String,

        /// Delivery guarantee (0, 1 or 2)
        #[arg(long, default_value_t = 0)]
        qos: u8,

        /// Ask the broker to retain the message
        #[arg(long)]
        retain: bool,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting cloudlink v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run {
            telemetry_interval,
            telemetry_id,
        } => run_device(config, telemetry_interval.map(Duration::from_secs), telemetry_id).await,
        Commands::Send {
            message_id,
            fields,
            qos,
            retain,
        } => send_once(config, message_id, &fields, qos, retain).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", sanitize_error_message(&e.to_string()));
        process::exit(1);
    }

    info!("Shutdown complete");
}

fn load_configuration(config_path: Option<&Path>) -> Result<DeviceConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(DeviceConfig::load_from_file(path)?);
    }

    for path_str in ["device.toml", "config/device.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(DeviceConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create device.toml".into())
}

/// Forward inbound commands off the transport callback onto a channel
fn command_forwarder() -> (SharedProcessor, mpsc::UnboundedReceiver<(String, Vec<u8>)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let processor: SharedProcessor = Arc::new(move |topic: &str, payload: &[u8]| {
        let _ = tx.send((topic.to_string(), payload.to_vec()));
    });
    (processor, rx)
}

async fn run_device(
    config: DeviceConfig,
    telemetry_interval: Option<Duration>,
    telemetry_id: MessageId,
) -> Result<(), Box<dyn std::error::Error>> {
    let (processor, mut commands) = command_forwarder();
    let transport = Arc::new(MqttTransport::new());
    let connection = DeviceConnection::from_config(&config, transport, processor)?;

    connection.open(config.mqtt.auto_reconnect).await?;

    let acks = connection.ack_handle();
    let command_task = tokio::spawn(async move {
        while let Some((topic, payload)) = commands.recv().await {
            match CommandEnvelope::parse(&payload) {
                Ok(CommandEnvelope {
                    correlation_id: Some(correlation_id),
                    fields,
                }) => {
                    info!(topic = %topic, correlation_id, fields = fields.len(), "Command received");
                    if let Err(e) = acks.acknowledge(correlation_id, true) {
                        warn!("Failed to queue acknowledgment: {}", e);
                    }
                }
                Ok(_) => debug!(topic = %topic, "Command without correlationId, not acknowledged"),
                Err(e) => warn!(topic = %topic, "Ignoring command: {}", e),
            }
        }
    });

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    let mut telemetry = telemetry_interval.map(|period| {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let mut sequence: u64 = 0;

    info!("Device is running and waiting for commands");

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            _ = async {
                match telemetry.as_mut() {
                    Some(ticker) => { ticker.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                sequence += 1;
                let mut fields = Fields::new();
                fields.insert("sequence".to_string(), sequence.into());
                fields.insert("timestamp".to_string(), chrono::Utc::now().to_rfc3339().into());
                if let Err(e) = connection.publish(telemetry_id, fields).await {
                    warn!("Telemetry send failed: {}", e.sanitized());
                }
            }
        }
    }

    connection.close().await;
    command_task.abort();

    let snapshot = connection.metrics();
    info!(
        pings = snapshot.pipeline.pings_sent,
        acks = snapshot.pipeline.acks_sent,
        messages = snapshot.sends.messages_sent,
        "Session summary"
    );
    Ok(())
}

async fn send_once(
    config: DeviceConfig,
    message_id: MessageId,
    fields: &str,
    qos: u8,
    retain: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let fields: Fields = serde_json::from_str(fields)
        .map_err(|e| format!("--fields must be a JSON object: {e}"))?;
    let qos = QoS::try_from(qos)?;

    let (processor, _commands) = command_forwarder();
    let connection =
        DeviceConnection::from_config(&config, Arc::new(MqttTransport::new()), processor)?;

    connection.open(false).await?;
    let result = connection.send_message(message_id, fields, qos, retain).await;
    connection.close().await;

    result?;
    info!(message_id, "Message sent");
    Ok(())
}

fn handle_config_command(
    config: &DeviceConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Configuration is valid");

    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }

    Ok(())
}
