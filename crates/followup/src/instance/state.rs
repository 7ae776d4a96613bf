//! Follow-up instance state machine
//!
//! ```text
//! Pending ──▶ InProgress ──▶ InProgress ... ──▶ Completed
//!    │             │
//!    └─────────────┴──▶ Halted
//! ```
//!
//! The state is a tagged union so a completed instance can never carry a
//! next run time and a pending one can never lack it. Storage flattens it into
//! [`StateColumns`]; [`InstanceState::from_columns`] rejects combinations the
//! union cannot represent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Flat status, as stored and filtered on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    InProgress,
    Completed,
    Halted,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Halted)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Halted => write!(f, "halted"),
        }
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = InvalidState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "halted" => Ok(Self::Halted),
            other => Err(InvalidState(format!("unknown instance status: {}", other))),
        }
    }
}

/// Stored columns that do not form a legal [`InstanceState`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid instance state: {0}")]
pub struct InvalidState(pub String);

/// Lifecycle state of a follow-up instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InstanceState {
    /// Waiting for the first step to become due
    Pending { next_run_at: DateTime<Utc> },

    /// At least one step has run, or a zero-delay first step is about to
    ///
    /// `next_run_at` is `None` once the last active step has run; the next
    /// run completes the instance.
    InProgress {
        current_step: Option<Uuid>,
        next_run_at: Option<DateTime<Utc>>,
    },

    /// Sequence exhausted
    Completed { completed_at: DateTime<Utc> },

    /// Stopped by an operator
    Halted {
        halted_at: DateTime<Utc>,
        current_step: Option<Uuid>,
    },
}

/// Flattened representation used by storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateColumns {
    pub status: InstanceStatus,
    pub current_step_id: Option<Uuid>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub halted_at: Option<DateTime<Utc>>,
}

impl InstanceState {
    pub fn status(&self) -> InstanceStatus {
        match self {
            Self::Pending { .. } => InstanceStatus::Pending,
            Self::InProgress { .. } => InstanceStatus::InProgress,
            Self::Completed { .. } => InstanceStatus::Completed,
            Self::Halted { .. } => InstanceStatus::Halted,
        }
    }

    pub fn next_run_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Pending { next_run_at } => Some(*next_run_at),
            Self::InProgress { next_run_at, .. } => *next_run_at,
            Self::Completed { .. } | Self::Halted { .. } => None,
        }
    }

    pub fn current_step(&self) -> Option<Uuid> {
        match self {
            Self::InProgress { current_step, .. } | Self::Halted { current_step, .. } => {
                *current_step
            }
            Self::Pending { .. } | Self::Completed { .. } => None,
        }
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Completed { completed_at } => Some(*completed_at),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Whether an executor run at `now` should act on this state
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::Pending { next_run_at } => *next_run_at <= now,
            Self::InProgress { next_run_at, .. } => next_run_at.map_or(true, |at| at <= now),
            Self::Completed { .. } | Self::Halted { .. } => false,
        }
    }

    /// State after an operator halt; terminal states are returned unchanged
    pub fn halt(&self, now: DateTime<Utc>) -> InstanceState {
        match self {
            Self::Pending { .. } | Self::InProgress { .. } => Self::Halted {
                halted_at: now,
                current_step: self.current_step(),
            },
            Self::Completed { .. } | Self::Halted { .. } => self.clone(),
        }
    }

    pub fn columns(&self) -> StateColumns {
        StateColumns {
            status: self.status(),
            current_step_id: self.current_step(),
            next_run_at: self.next_run_at(),
            completed_at: self.completed_at(),
            halted_at: match self {
                Self::Halted { halted_at, .. } => Some(*halted_at),
                _ => None,
            },
        }
    }

    pub fn from_columns(columns: StateColumns) -> Result<Self, InvalidState> {
        let StateColumns {
            status,
            current_step_id,
            next_run_at,
            completed_at,
            halted_at,
        } = columns;

        match status {
            InstanceStatus::Pending => match (next_run_at, current_step_id) {
                (Some(next_run_at), None) => Ok(Self::Pending { next_run_at }),
                _ => Err(InvalidState(
                    "pending instance needs a next run and no current step".to_string(),
                )),
            },
            InstanceStatus::InProgress => {
                if current_step_id.is_none() && next_run_at.is_none() {
                    return Err(InvalidState(
                        "in-progress instance has neither a current step nor a next run"
                            .to_string(),
                    ));
                }
                Ok(Self::InProgress {
                    current_step: current_step_id,
                    next_run_at,
                })
            }
            InstanceStatus::Completed => match (completed_at, next_run_at) {
                (Some(completed_at), None) => Ok(Self::Completed { completed_at }),
                _ => Err(InvalidState(
                    "completed instance needs completed_at and no next run".to_string(),
                )),
            },
            InstanceStatus::Halted => match (halted_at, next_run_at) {
                (Some(halted_at), None) => Ok(Self::Halted {
                    halted_at,
                    current_step: current_step_id,
                }),
                _ => Err(InvalidState(
                    "halted instance needs halted_at and no next run".to_string(),
                )),
            },
        }
    }
}
