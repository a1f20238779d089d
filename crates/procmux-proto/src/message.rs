//! Hub message envelope and typed payloads.
//!
//! On the wire every frame is a flat JSON object:
//!
//! ```json
//! {"type": "process_output", "channel": "process:proc-1",
//!  "processId": "proc-1", "data": "hi\n", "timestamp": "2024-01-01T00:00:00Z"}
//! ```
//!
//! The shape of `data` depends on `type`. In memory it is a [`Payload`] with
//! one variant per [`MessageType`]; decoding reads `type` first and then
//! decodes `data` into the matching variant.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Discriminator carried in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    ProcessOutput,
    ProcessStatus,
    Event,
    Error,
    Ping,
    Pong,
    Subscribe,
    Unsubscribe,
}

impl MessageType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ProcessOutput => "process_output",
            Self::ProcessStatus => "process_status",
            Self::Event => "event",
            Self::Error => "error",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    /// Launched and not yet observed to exit.
    Running,
    /// The supervisor was asked to stop it. Termination is not guaranteed.
    Stopped,
    /// Exit observed.
    Exited,
    /// Waiting on the process failed.
    Failed,
}

impl ProcessStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Exited => "exited",
            Self::Failed => "failed",
        }
    }

    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `data` of a `process_status` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub status: ProcessStatus,
    /// `None` when the process was killed by a signal or never produced a code.
    pub exit_code: Option<i32>,
}

/// Typed message body, one variant per [`MessageType`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// One line of combined stdout/stderr, newline included.
    ProcessOutput(String),
    ProcessStatus(StatusPayload),
    /// Free-form application event.
    Event(Value),
    Error(String),
    Ping,
    Pong,
    /// Channel name to join.
    Subscribe(String),
    /// Channel name to leave.
    Unsubscribe(String),
}

impl Payload {
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::ProcessOutput(_) => MessageType::ProcessOutput,
            Self::ProcessStatus(_) => MessageType::ProcessStatus,
            Self::Event(_) => MessageType::Event,
            Self::Error(_) => MessageType::Error,
            Self::Ping => MessageType::Ping,
            Self::Pong => MessageType::Pong,
            Self::Subscribe(_) => MessageType::Subscribe,
            Self::Unsubscribe(_) => MessageType::Unsubscribe,
        }
    }

    fn into_data(self) -> Option<Value> {
        match self {
            Self::ProcessOutput(text)
            | Self::Error(text)
            | Self::Subscribe(text)
            | Self::Unsubscribe(text) => Some(Value::String(text)),
            Self::ProcessStatus(status) => {
                let exit_code = status.exit_code.map_or(Value::Null, Value::from);
                let mut data = serde_json::Map::new();
                data.insert("status".into(), Value::from(status.status.as_str()));
                data.insert("exitCode".into(), exit_code);
                Some(Value::Object(data))
            }
            Self::Event(value) => Some(value),
            Self::Ping | Self::Pong => None,
        }
    }

    fn decode(kind: MessageType, data: Option<Value>) -> Result<Self, DecodeError> {
        let required = |data: Option<Value>| data.ok_or(DecodeError::MissingData { kind });
        let payload = match kind {
            MessageType::ProcessOutput => Self::ProcessOutput(string_data(kind, required(data)?)?),
            MessageType::ProcessStatus => Self::ProcessStatus(
                serde_json::from_value(required(data)?)
                    .map_err(|source| DecodeError::InvalidData { kind, source })?,
            ),
            MessageType::Event => Self::Event(data.unwrap_or(Value::Null)),
            MessageType::Error => Self::Error(string_data(kind, required(data)?)?),
            MessageType::Ping => Self::Ping,
            MessageType::Pong => Self::Pong,
            MessageType::Subscribe => Self::Subscribe(string_data(kind, required(data)?)?),
            MessageType::Unsubscribe => Self::Unsubscribe(string_data(kind, required(data)?)?),
        };
        Ok(payload)
    }
}

fn string_data(kind: MessageType, data: Value) -> Result<String, DecodeError> {
    match data {
        Value::String(text) => Ok(text),
        _ => Err(DecodeError::ExpectedString { kind }),
    }
}

/// Errors from decoding a frame's `data` for its declared `type`.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("{kind} frame requires data")]
    MissingData { kind: MessageType },

    #[error("{kind} frame requires string data")]
    ExpectedString { kind: MessageType },

    #[error("invalid data for {kind} frame: {source}")]
    InvalidData {
        kind: MessageType,
        source: serde_json::Error,
    },
}

/// A hub frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMessage", into = "RawMessage")]
pub struct Message {
    pub payload: Payload,
    pub channel: Option<String>,
    pub process_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Build a message stamped with the current time.
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            channel: None,
            process_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn process_output(process_id: impl Into<String>, line: impl Into<String>) -> Self {
        Self::new(Payload::ProcessOutput(line.into())).with_process_id(process_id)
    }

    pub fn process_status(
        process_id: impl Into<String>,
        status: ProcessStatus,
        exit_code: Option<i32>,
    ) -> Self {
        Self::new(Payload::ProcessStatus(StatusPayload { status, exit_code }))
            .with_process_id(process_id)
    }

    pub fn event(data: Value) -> Self {
        Self::new(Payload::Event(data))
    }

    pub fn pong() -> Self {
        Self::new(Payload::Pong)
    }

    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    #[must_use]
    pub fn with_process_id(mut self, process_id: impl Into<String>) -> Self {
        self.process_id = Some(process_id.into());
        self
    }

    pub const fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    /// Encode as a JSON text frame.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode a JSON text frame.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(rename = "type")]
    kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    process_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
}

impl TryFrom<RawMessage> for Message {
    type Error = DecodeError;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        // `"data": null` is treated the same as an absent field.
        let data = raw.data.filter(|value| !value.is_null());
        Ok(Self {
            payload: Payload::decode(raw.kind, data)?,
            channel: raw.channel,
            process_id: raw.process_id,
            timestamp: raw.timestamp,
        })
    }
}

impl From<Message> for RawMessage {
    fn from(message: Message) -> Self {
        Self {
            kind: message.payload.message_type(),
            channel: message.channel,
            process_id: message.process_id,
            data: message.payload.into_data(),
            timestamp: message.timestamp,
        }
    }
}
