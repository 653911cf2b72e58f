//! Task state reported by the server and the outcome seen by callers.

use serde::Deserialize;

/// Task state carried in the `TaskInfo` field of a `Task` envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "u8")]
#[repr(u8)]
pub enum TaskState {
    /// No information yet.
    #[default]
    Unknown = 0,
    /// The server rejected the command arguments.
    ArgError = 1,
    /// The task started.
    Start = 2,
    /// The task is running.
    Update = 3,
    /// The task ended in failure.
    Failed = 4,
    /// The task ended successfully.
    Succeed = 5,
}

impl TaskState {
    /// Attempts to parse a task state from its wire code.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Unknown),
            1 => Some(Self::ArgError),
            2 => Some(Self::Start),
            3 => Some(Self::Update),
            4 => Some(Self::Failed),
            5 => Some(Self::Succeed),
            _ => None,
        }
    }

    /// Returns true if the state acknowledges that the server received the task.
    #[must_use]
    pub const fn is_ack(self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Returns true if the state implies the task started.
    #[must_use]
    pub const fn is_started(self) -> bool {
        matches!(
            self,
            Self::Start | Self::Update | Self::Failed | Self::Succeed
        )
    }

    /// Returns true if the state is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Succeed)
    }
}

impl TryFrom<u8> for TaskState {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or_else(|| format!("invalid task state {code}"))
    }
}

/// Result of waiting on a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The task was started (ack wait) or succeeded (completion wait).
    Succeeded,
    /// The task was rejected, failed, or purged by an emergency abort.
    Failed,
    /// No response arrived within the ack timeout.
    Lost,
}

impl Outcome {
    /// Returns true for [`Outcome::Succeeded`].
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_state_from_code() {
        assert_eq!(TaskState::from_code(1), Some(TaskState::ArgError));
        assert_eq!(TaskState::from_code(5), Some(TaskState::Succeed));
        assert_eq!(TaskState::from_code(6), None);
    }

    #[test]
    fn test_task_state_classes() {
        assert!(!TaskState::Unknown.is_ack());
        assert!(TaskState::ArgError.is_ack());
        assert!(!TaskState::ArgError.is_started());
        assert!(TaskState::Update.is_started());
        assert!(!TaskState::Update.is_terminal());
        assert!(TaskState::Failed.is_terminal());
    }

    #[test]
    fn test_task_state_deserialize() {
        let state: TaskState = serde_json::from_str("2").unwrap();
        assert_eq!(state, TaskState::Start);
        assert!(serde_json::from_str::<TaskState>("9").is_err());
    }
}
