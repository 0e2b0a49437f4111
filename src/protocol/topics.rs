//! Topic derivation and classification for the device protocol
//!
//! All traffic for a device is multiplexed onto one broker session. The topic
//! tells the platform what kind of payload it is looking at:
//!
//! | kind     | topic                                                              |
//! |----------|--------------------------------------------------------------------|
//! | command  | `/{domain}/device/{device}/cmds`                                   |
//! | message  | `/{domain}/device/{device}/msgs/{message_id}/{model}/{firmware}`   |
//! | snapshot | `/{domain}/device/{device}/snap/{live\|offline}/{camera}/{format}` |
//! | stream   | `/{domain}/device/{device}/stream/{live\|offline}/{camera}/{format}` |

use super::identity::DeviceIdentity;
use super::messages::MessageId;

/// Replace path separators so a camera id stays a single topic level
pub fn sanitize_camera_id(camera_id: &str) -> String {
    camera_id.replace('/', "_")
}

fn live_segment(live: bool) -> &'static str {
    if live {
        "live"
    } else {
        "offline"
    }
}

/// What an inbound or outbound topic addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicKind {
    /// Platform-to-device command topic
    Command,
    /// Structured device message
    Message {
        message_id: MessageId,
        device_model: String,
        firmware_version: String,
    },
    /// Still image from a camera
    Snapshot {
        live: bool,
        camera_id: String,
        format: String,
    },
    /// Video from a camera
    Stream {
        live: bool,
        camera_id: String,
        format: String,
    },
    /// Not addressed to this device, or not a recognised shape
    Foreign,
}

impl TopicKind {
    pub fn is_command(&self) -> bool {
        matches!(self, TopicKind::Command)
    }

    /// Messages, snapshots and streams
    pub fn is_data(&self) -> bool {
        matches!(
            self,
            TopicKind::Message { .. } | TopicKind::Snapshot { .. } | TopicKind::Stream { .. }
        )
    }
}

/// Stateless topic builder bound to one device identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRouter {
    identity: DeviceIdentity,
}

impl TopicRouter {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self { identity }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn device_root(&self) -> String {
        format!(
            "/{}/device/{}",
            self.identity.domain_key, self.identity.device_id
        )
    }

    /// Build command topic: `/{domain}/device/{device}/cmds`
    pub fn device_command_topic(&self) -> String {
        format!("{}/cmds", self.device_root())
    }

    /// Build message topic: `/{domain}/device/{device}/msgs/{id}/{model}/{firmware}`
    pub fn message_topic(&self, message_id: MessageId) -> String {
        format!(
            "{}/msgs/{}/{}/{}",
            self.device_root(),
            message_id,
            self.identity.device_model,
            self.identity.firmware_version
        )
    }

    /// Build snapshot topic: `/{domain}/device/{device}/snap/{live|offline}/{camera}/{format}`
    pub fn snapshot_topic(&self, camera_id: &str, live: bool, format: &str) -> String {
        self.media_topic("snap", camera_id, live, format)
    }

    /// Build stream topic: `/{domain}/device/{device}/stream/{live|offline}/{camera}/{format}`
    pub fn stream_topic(&self, camera_id: &str, live: bool, format: &str) -> String {
        self.media_topic("stream", camera_id, live, format)
    }

    fn media_topic(&self, kind: &str, camera_id: &str, live: bool, format: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.device_root(),
            kind,
            live_segment(live),
            sanitize_camera_id(camera_id),
            format
        )
    }

    /// Classify a topic relative to this device
    pub fn classify(&self, topic: &str) -> TopicKind {
        let root = self.device_root();
        let Some(rest) = topic.strip_prefix(root.as_str()) else {
            return TopicKind::Foreign;
        };
        let Some(rest) = rest.strip_prefix('/') else {
            return TopicKind::Foreign;
        };

        let levels: Vec<&str> = rest.split('/').collect();
        match levels.as_slice() {
            ["cmds"] => TopicKind::Command,
            ["msgs", id, model, firmware] => match id.parse::<MessageId>() {
                Ok(message_id) => TopicKind::Message {
                    message_id,
                    device_model: (*model).to_string(),
                    firmware_version: (*firmware).to_string(),
                },
                Err(_) => TopicKind::Foreign,
            },
            [kind @ ("snap" | "stream"), live, camera, format] => {
                let live = match *live {
                    "live" => true,
                    "offline" => false,
                    _ => return TopicKind::Foreign,
                };
                let camera_id = (*camera).to_string();
                let format = (*format).to_string();
                if *kind == "snap" {
                    TopicKind::Snapshot {
                        live,
                        camera_id,
                        format,
                    }
                } else {
                    TopicKind::Stream {
                        live,
                        camera_id,
                        format,
                    }
                }
            }
            _ => TopicKind::Foreign,
        }
    }
}
