//! Task status vocabulary of the marketplace backend.
//!
//! Messaging is scoped to a conversation between two users; task status
//! appears in it only as the closed set of labels the backend uses.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a marketplace task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "Open")]
    Open,
    #[serde(rename = "In Progress")]
    InProgress,
    #[serde(rename = "Pending Verification")]
    PendingVerification,
    #[serde(rename = "Done")]
    Done,
}

/// Error returned for a status label the backend does not define.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task status: {0:?}")]
pub struct UnknownTaskStatus(pub String);

impl TaskStatus {
    /// Backend label.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Open => "Open",
            Self::InProgress => "In Progress",
            Self::PendingVerification => "Pending Verification",
            Self::Done => "Done",
        }
    }

    /// The status that follows this one, if any.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Open => Some(Self::InProgress),
            Self::InProgress => Some(Self::PendingVerification),
            Self::PendingVerification => Some(Self::Done),
            Self::Done => None,
        }
    }

    /// Whether `next` is reachable in one step.
    ///
    /// A task under verification may also be sent back to work.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Open, Self::InProgress)
                | (Self::InProgress, Self::PendingVerification)
                | (Self::PendingVerification, Self::Done | Self::InProgress)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = UnknownTaskStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Open" => Ok(Self::Open),
            "In Progress" => Ok(Self::InProgress),
            "Pending Verification" => Ok(Self::PendingVerification),
            "Done" => Ok(Self::Done),
            other => Err(UnknownTaskStatus(other.to_string())),
        }
    }
}
