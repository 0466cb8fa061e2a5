//! Task execution outcomes.
//!
//! A task either succeeds or fails with a classified [`TaskFailure`]. The
//! classification is a plain tagged value rather than an error type hierarchy so
//! it survives being written into a job's `error_message` and read back.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Result of running a task executor against one job.
pub type TaskOutcome = Result<(), TaskFailure>;

/// Whether a failed task may be attempted again.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient failure; the job is rescheduled with backoff while attempts remain.
    Retryable,
    /// The job can never succeed; it fails permanently on the first occurrence.
    NonRetryable,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Retryable => "retryable",
            FailureKind::NonRetryable => "non_retryable",
        }
    }
}

impl core::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retryable" => Ok(FailureKind::Retryable),
            "non_retryable" => Ok(FailureKind::NonRetryable),
            other => Err(DomainError::decode(format!("unknown failure kind: {other}"))),
        }
    }
}

/// A classified task failure: `{kind, message}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Retryable,
            message: message.into(),
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::NonRetryable,
            message: message.into(),
        }
    }

    /// Failure reported when no executor is registered for a task type.
    pub fn unknown_task_type(task_type: &str) -> Self {
        Self::non_retryable(format!("unknown task type: {task_type}"))
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Retryable
    }

    /// Text stored in a job's `error_message` column.
    ///
    /// Format: `<kind>: <message>`, parseable with [`TaskFailure::from_str`].
    pub fn to_error_message(&self) -> String {
        self.to_string()
    }
}

impl core::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl FromStr for TaskFailure {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, message) = s
            .split_once(": ")
            .ok_or_else(|| DomainError::decode(format!("malformed error message: {s}")))?;
        Ok(Self {
            kind: kind.parse()?,
            message: message.to_string(),
        })
    }
}
