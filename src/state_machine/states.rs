use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state shared by the task database and the processing table.
///
/// Persisted as a human-readable label in tables and as a fixed integer in
/// the task database; the two encodings must stay in lock step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Scheduled but not yet handed to the batch system
    Waiting,
    /// Handed to the batch system, not yet observed running
    Submitted,
    /// Observed running on the batch system
    Running,
    /// All declared outputs produced
    Done,
    /// Execution raised an error or outputs are missing
    Fail,
}

impl TaskState {
    /// Check if no further transitions are expected without resubmission.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Fail)
    }

    /// Check if a row in this state may be (re)submitted to the queue.
    pub fn is_submittable(&self) -> bool {
        matches!(self, Self::Waiting | Self::Fail)
    }

    /// Fixed integer encoding used by the task database state column.
    pub fn to_int(self) -> i64 {
        match self {
            Self::Waiting => 0,
            Self::Submitted => 1,
            Self::Running => 2,
            Self::Done => 3,
            Self::Fail => 4,
        }
    }

    /// Inverse of [`TaskState::to_int`].
    pub fn from_int(v: i64) -> Result<Self, String> {
        match v {
            0 => Ok(Self::Waiting),
            1 => Ok(Self::Submitted),
            2 => Ok(Self::Running),
            3 => Ok(Self::Done),
            4 => Ok(Self::Fail),
            other => Err(format!("Invalid task state integer: {other}")),
        }
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::Waiting
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Submitted => write!(f, "submitted"),
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "submitted" => Ok(Self::Submitted),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "fail" => Ok(Self::Fail),
            _ => Err(format!("Invalid task state: {s}")),
        }
    }
}
