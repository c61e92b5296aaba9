//! Inbound control-message routing
//!
//! The agent subscribes to exactly two topics:
//!
//! | Topic                         | Payload                                   | Handler              |
//! |-------------------------------|-------------------------------------------|----------------------|
//! | configuration topic (shared)  | JSON object, merged into live config      | `on_config_update`   |
//! | device topic (= device id)    | `{"type":"watchdog","id":..}`             | `on_watchdog_echo`   |
//! |                               | `{"type":"command","cmd":..}`             | `on_command`         |
//!
//! Anything else (bad JSON, a non-object, an unknown `type`, a foreign topic)
//! is logged and dropped. Telemetry must keep flowing no matter what lands on
//! a control topic.

use log::{debug, warn};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// The two subscribed control topics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlTopics {
    /// Shared configuration-update topic
    pub config: String,
    /// Device-specific topic for commands and watchdog echoes
    pub device: String,
}

impl ControlTopics {
    /// Topics to subscribe to, skipping empty ones
    pub fn subscriptions(&self) -> impl Iterator<Item = &str> {
        [self.config.as_str(), self.device.as_str()]
            .into_iter()
            .filter(|topic| !topic.is_empty())
    }
}

/// A decoded control message
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Partial configuration document to merge
    ConfigUpdate(Map<String, Value>),
    /// Echo of a watchdog ping
    WatchdogEcho {
        /// Ping id being echoed
        id: u64,
    },
    /// Remote command; `cmd` may be missing
    Command {
        /// Command name, e.g. `reboot`
        cmd: Option<String>,
    },
}

/// Why an inbound message was dropped
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Payload is not valid JSON
    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload is JSON but not an object
    #[error("Payload is not a JSON object")]
    NotAnObject,

    /// Device message without a string `type`
    #[error("Missing or non-string 'type' field")]
    MissingType,

    /// Device message of an unsupported `type`
    #[error("Unknown message type '{0}'")]
    UnknownType(String),

    /// Topic matches neither control topic
    #[error("Message on unsubscribed topic '{0}'")]
    UnknownTopic(String),
}

#[derive(Deserialize)]
struct EchoBody {
    id: u64,
}

#[derive(Deserialize)]
struct CommandBody {
    #[serde(default)]
    cmd: Option<String>,
}

/// Receiver of decoded control messages
///
/// Called from the transport's network task; implementations must not block
/// for long.
pub trait InboundHandler: Send + Sync {
    /// A broker session was (re)established and subscriptions issued
    fn on_connected(&self) {}

    /// Configuration-update topic delivered a JSON object
    fn on_config_update(&self, update: Map<String, Value>);

    /// Device topic delivered a watchdog echo
    fn on_watchdog_echo(&self, id: u64);

    /// Device topic delivered a command
    fn on_command(&self, cmd: Option<&str>);
}

/// Decode one inbound publish
pub fn route(topics: &ControlTopics, topic: &str, payload: &[u8]) -> Result<ControlMessage, DispatchError> {
    if !topics.config.is_empty() && topic == topics.config {
        return match serde_json::from_slice::<Value>(payload)? {
            Value::Object(update) => Ok(ControlMessage::ConfigUpdate(update)),
            _ => Err(DispatchError::NotAnObject),
        };
    }

    if !topics.device.is_empty() && topic == topics.device {
        let value = serde_json::from_slice::<Value>(payload)?;
        let kind = match value.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            _ if !value.is_object() => return Err(DispatchError::NotAnObject),
            _ => return Err(DispatchError::MissingType),
        };

        return match kind.as_str() {
            "watchdog" => {
                let body: EchoBody = serde_json::from_value(value)?;
                Ok(ControlMessage::WatchdogEcho { id: body.id })
            }
            "command" => {
                let body: CommandBody = serde_json::from_value(value)?;
                Ok(ControlMessage::Command { cmd: body.cmd })
            }
            _ => Err(DispatchError::UnknownType(kind)),
        };
    }

    Err(DispatchError::UnknownTopic(topic.to_string()))
}

/// Decode one inbound publish and hand it to `handler`
///
/// Errors are logged and swallowed.
pub fn dispatch(handler: &dyn InboundHandler, topics: &ControlTopics, topic: &str, payload: &[u8]) {
    debug!("inbound message on '{}' ({} bytes)", topic, payload.len());

    match route(topics, topic, payload) {
        Ok(ControlMessage::ConfigUpdate(update)) => handler.on_config_update(update),
        Ok(ControlMessage::WatchdogEcho { id }) => handler.on_watchdog_echo(id),
        Ok(ControlMessage::Command { cmd }) => handler.on_command(cmd.as_deref()),
        Err(err) => warn!("dropping message on '{}': {}", topic, err),
    }
}
