use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of one end-to-end workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created, orchestration job not yet picked up.
    #[default]
    Pending,
    /// Job flow submitted; steps are being processed.
    Running,
    /// Every step completed or was skipped.
    Completed,
    /// A step failed terminally.
    Failed,
    /// Cancelled by an operator.
    Cancelled,
}

impl ExecutionStatus {
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Statuses from which no further transition is allowed.
    pub const TERMINAL: [Self; 3] = [Self::Completed, Self::Failed, Self::Cancelled];

    /// Statuses that may still be cancelled.
    pub const CANCELLABLE: [Self; 2] = [Self::Pending, Self::Running];

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether `self -> next` is an edge of the execution state machine.
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid execution status: {s}")),
        }
    }
}

/// Lifecycle of one agent's run inside an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Root step waiting to be dispatched.
    #[default]
    Pending,
    /// Step whose upstream agents have not all settled.
    WaitingInputs,
    Running,
    Completed,
    Failed,
    /// Reached only through cancellation.
    Skipped,
}

impl StepStatus {
    pub const ALL: [Self; 6] = [
        Self::Pending,
        Self::WaitingInputs,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Skipped,
    ];

    /// Statuses a step can still leave.
    pub const OPEN: [Self; 3] = [Self::Pending, Self::WaitingInputs, Self::Running];

    /// Statuses a step may start running from (RUNNING covers retried attempts).
    pub const STARTABLE: [Self; 3] = [Self::Pending, Self::WaitingInputs, Self::Running];

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Whether this step counts as done for execution finalization.
    pub fn is_settled_ok(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::WaitingInputs => "waiting_inputs",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Whether `self -> next` is an edge of the step state machine.
    ///
    /// `Pending|WaitingInputs -> Failed` only happens when a dependency fails and
    /// the failure cascades to a step that never ran.
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::WaitingInputs, Self::Running)
                | (Self::Running, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Pending, Self::Failed)
                | (Self::WaitingInputs, Self::Failed)
                | (Self::Pending, Self::Skipped)
                | (Self::WaitingInputs, Self::Skipped)
                | (Self::Running, Self::Skipped)
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "waiting_inputs" => Ok(Self::WaitingInputs),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid step status: {s}")),
        }
    }
}
