//! Inbound envelopes received on either channel.
//!
//! Every inbound datagram is one JSON object with a required `"Type"`
//! discriminator:
//!
//! | `Type`    | Payload                                              |
//! |-----------|------------------------------------------------------|
//! | `Message` | free-text log line from a device                     |
//! | `Task`    | task state update for a command's `TaskID`           |
//! | `Data`    | telemetry frame, with `SN` for multi-instance devices |

use serde::Deserialize;

use crate::error::ProtocolError;
use crate::protocol::TaskState;

/// A decoded inbound envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "Type")]
pub enum Envelope {
    /// Device log line.
    Message(DeviceMessage),
    /// Task state update.
    Task(TaskUpdate),
    /// Telemetry frame.
    Data(DataFrame),
}

impl Envelope {
    /// Decodes a datagram.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// A free-text log line.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceMessage {
    /// Originating device name.
    #[serde(rename = "Device")]
    pub device: String,
    /// Message text.
    #[serde(rename = "Msg")]
    pub message: String,
    /// Numeric log level (10 = debug ... 50 = critical).
    #[serde(rename = "LogLevel", default)]
    pub level: u8,
}

/// A task state update.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskUpdate {
    /// Originating device name.
    #[serde(rename = "Device")]
    pub device: String,
    /// Correlation id of the command.
    #[serde(rename = "TaskID")]
    pub task_id: u16,
    /// Sub-task updates carry messages but never change the task's state.
    #[serde(rename = "SubTask", default)]
    pub sub_task: bool,
    /// Reported state.
    #[serde(rename = "TaskInfo")]
    pub state: TaskState,
    /// Optional human-readable message.
    #[serde(rename = "Msg", default)]
    pub message: Option<String>,
    /// Numeric log level of the message.
    #[serde(rename = "LogLevel", default)]
    pub level: u8,
}

/// A telemetry frame.
#[derive(Debug, Clone, Deserialize)]
pub struct DataFrame {
    /// Device category (`Hand`, `Tac3D`).
    #[serde(rename = "Device")]
    pub device: String,
    /// Category-specific payload.
    #[serde(rename = "Data")]
    pub data: serde_json::Value,
    /// Sender timestamp in seconds.
    #[serde(rename = "Time")]
    pub time: f64,
    /// Serial number for multi-instance devices.
    #[serde(rename = "SN", default)]
    pub serial: Option<String>,
}
