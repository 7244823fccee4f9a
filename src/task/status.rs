//! Task status state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// User-visible lifecycle status of a task.
///
/// Statuses advance in declaration order. `WaitingForNodes` and
/// `WaitingForLaunch` are optional phases that may be skipped when the
/// backend never reports them. `Failed` can be entered from any non-terminal
/// status. `Success` and `Failed` are terminal.
///
/// ```text
/// Received -> WaitingForEp -> [WaitingForNodes] -> [WaitingForLaunch] -> Running -> Success
///     \____________\_______________\____________________\__________________\-> Failed
/// ```
///
/// # Examples
///
/// ```
/// use taskrelay::TaskStatus;
///
/// assert!(TaskStatus::WaitingForEp.can_transition_to(&TaskStatus::Running));
/// assert!(!TaskStatus::Received.can_transition_to(&TaskStatus::Running));
/// assert!(TaskStatus::Received.can_transition_to(&TaskStatus::Failed));
/// assert!(!TaskStatus::Success.can_transition_to(&TaskStatus::Failed));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Accepted by the submission path.
    Received,
    /// Dispatched, waiting for the endpoint to pick it up.
    WaitingForEp,
    /// The endpoint is acquiring compute nodes.
    WaitingForNodes,
    /// Nodes acquired, waiting for the worker to launch.
    WaitingForLaunch,
    /// Executing on the endpoint.
    Running,
    /// Completed with a result (terminal).
    Success,
    /// Completed with an exception (terminal).
    Failed,
}

impl TaskStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 7] = [
        Self::Received,
        Self::WaitingForEp,
        Self::WaitingForNodes,
        Self::WaitingForLaunch,
        Self::Running,
        Self::Success,
        Self::Failed,
    ];

    /// The string stored in the record's `status` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::WaitingForEp => "waiting-for-ep",
            Self::WaitingForNodes => "waiting-for-nodes",
            Self::WaitingForLaunch => "waiting-for-launch",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    /// Position in the lifecycle. Both terminal statuses share the last rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Received => 0,
            Self::WaitingForEp => 1,
            Self::WaitingForNodes => 2,
            Self::WaitingForLaunch => 3,
            Self::Running => 4,
            Self::Success | Self::Failed => 5,
        }
    }

    /// Returns `true` for `Success` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    fn is_optional(&self) -> bool {
        matches!(self, Self::WaitingForNodes | Self::WaitingForLaunch)
    }

    /// Checks whether moving from this status to `next` is allowed.
    ///
    /// Self-transitions and backward moves are rejected. Forward moves may
    /// only skip the optional node/launch phases.
    pub fn can_transition_to(&self, next: &Self) -> bool {
        if self == next || self.is_terminal() {
            return false;
        }
        if *next == Self::Failed {
            return true;
        }
        if next.rank() <= self.rank() {
            return false;
        }
        Self::ALL
            .iter()
            .filter(|s| s.rank() > self.rank() && s.rank() < next.rank())
            .all(Self::is_optional)
    }

    /// Like [`can_transition_to`](Self::can_transition_to), but reports the
    /// rejection as an error naming the task.
    ///
    /// # Examples
    ///
    /// ```
    /// use taskrelay::TaskStatus;
    ///
    /// assert!(TaskStatus::Running.validate_transition("t", &TaskStatus::Success).is_ok());
    /// assert!(TaskStatus::Success.validate_transition("t", &TaskStatus::Running).is_err());
    /// ```
    pub fn validate_transition(&self, task_id: &str, next: &Self) -> Result<()> {
        if self.can_transition_to(next) {
            return Ok(());
        }
        if self.is_terminal() {
            return Err(Error::TerminalState {
                task_id: task_id.to_string(),
                status: *self,
            });
        }
        Err(Error::InvalidTransition {
            task_id: task_id.to_string(),
            from: *self,
            to: *next,
        })
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unrecognised status string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognised status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for TaskStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}

/// Whether the forwarder side has finished processing a task, independent of
/// the user-visible [`TaskStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InternalStatus {
    /// Still being processed.
    Incomplete,
    /// Completion has been recorded.
    Complete,
}

impl InternalStatus {
    /// The string stored in the record's `internal_status` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incomplete => "incomplete",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for InternalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InternalStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "incomplete" => Ok(Self::Incomplete),
            "complete" => Ok(Self::Complete),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}
