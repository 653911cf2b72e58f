//! Command vocabulary and the outbound command envelope.
//!
//! Every command is one JSON datagram:
//! ```text
//! {"Time": 1718000000.25,
//!  "Command": {"Device": "Hand", "Type": "Goto", "args": {...}, "TaskID": 12}}
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Command arguments, serialized as the `args` object.
pub type Args = serde_json::Map<String, serde_json::Value>;

/// Device addressed by a command or named by an inbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    /// The gripper itself.
    Hand,
    /// The tactile sensor array.
    #[serde(rename = "Tac3D")]
    Tac3d,
    /// The server process driving the hardware.
    Server,
}

impl Device {
    /// Returns the wire name of the device.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hand => "Hand",
            Self::Tac3d => "Tac3D",
            Self::Server => "Server",
        }
    }

    /// Parses a wire device name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Hand" => Some(Self::Hand),
            "Tac3D" => Some(Self::Tac3d),
            "Server" => Some(Self::Server),
            _ => None,
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the caller waits for a command's task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Resolve once the device reports the task started.
    Ack,
    /// Resolve once the task reaches a terminal state.
    Completion,
}

/// Command types understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    /// Start the server (`Server`).
    Start,
    /// Stop the server (`Server`).
    Stop,
    /// Acquire control of the hand. Also used as the heartbeat.
    Acquire,
    /// Release control of the hand.
    Release,
    /// Find the gripper zero point.
    SetHome,
    /// Calibrate force sensor zero points.
    CalibrateZero,
    /// Close until an object is contacted.
    Contact,
    /// Planned grasp to a goal force.
    Grasp,
    /// Unplanned force servo.
    ForceServo,
    /// Planned move to a position.
    Goto,
    /// Unplanned position servo.
    PosServo,
    /// Mass/spring/damper emulation.
    Impedance,
    /// Constant speed motion.
    SetSpeed,
    /// Force weighting gains.
    SetWeightParam,
    /// Force PID gains.
    #[serde(rename = "SetPIDParam")]
    SetPidParam,
    /// Stiffness estimation mode.
    SwitchKMode,
    /// Stop all motion and flush the server's task queue.
    Halt,
    /// Clear a latched hardware error.
    ClearError,
}

impl CommandKind {
    /// Returns the wire name of the command.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "Start",
            Self::Stop => "Stop",
            Self::Acquire => "Acquire",
            Self::Release => "Release",
            Self::SetHome => "SetHome",
            Self::CalibrateZero => "CalibrateZero",
            Self::Contact => "Contact",
            Self::Grasp => "Grasp",
            Self::ForceServo => "ForceServo",
            Self::Goto => "Goto",
            Self::PosServo => "PosServo",
            Self::Impedance => "Impedance",
            Self::SetSpeed => "SetSpeed",
            Self::SetWeightParam => "SetWeightParam",
            Self::SetPidParam => "SetPIDParam",
            Self::SwitchKMode => "SwitchKMode",
            Self::Halt => "Halt",
            Self::ClearError => "ClearError",
        }
    }

    /// Returns how callers wait for this command.
    ///
    /// Servo-style commands return once started; everything else must run to
    /// completion on the server.
    #[must_use]
    pub const fn wait_mode(self) -> WaitMode {
        match self {
            Self::ForceServo
            | Self::PosServo
            | Self::Impedance
            | Self::SetSpeed
            | Self::SetPidParam
            | Self::SwitchKMode
            | Self::ClearError => WaitMode::Ack,
            _ => WaitMode::Completion,
        }
    }

    /// Returns true if the command may only be issued while a recent heartbeat
    /// confirms connectivity.
    #[must_use]
    pub const fn requires_heartbeat(self) -> bool {
        !matches!(self, Self::Start | Self::Stop | Self::Acquire | Self::Halt)
    }

    /// Returns true if the command may still be sent during an emergency abort.
    #[must_use]
    pub const fn allowed_in_emergency(self) -> bool {
        matches!(self, Self::Halt | Self::Release)
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of a command envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Target device.
    #[serde(rename = "Device")]
    pub device: Device,
    /// Command type.
    #[serde(rename = "Type")]
    pub kind: CommandKind,
    /// Command arguments.
    pub args: Args,
    /// Correlation id.
    #[serde(rename = "TaskID")]
    pub task_id: u16,
}

/// A complete command datagram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Send time in unix seconds.
    #[serde(rename = "Time")]
    pub time: f64,
    /// The command itself.
    #[serde(rename = "Command")]
    pub command: Command,
}

impl CommandEnvelope {
    /// Creates an envelope stamped with the current time.
    #[must_use]
    pub fn new(device: Device, kind: CommandKind, args: Args, task_id: u16) -> Self {
        Self {
            time: unix_time(),
            command: Command {
                device,
                kind,
                args,
                task_id,
            },
        }
    }

    /// Encodes the envelope into a datagram.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decodes a datagram into an envelope.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Gets the current unix time in seconds.
pub(crate) fn unix_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
