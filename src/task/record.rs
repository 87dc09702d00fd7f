//! Task record and its status state machine.
//!
//! # Invariants
//! - Status moves `Queued -> Processing -> {Done | Error}`, plus the direct
//!   `Queued -> Error` edge for records that cannot start.
//! - Terminal records (`Done`, `Error`) accept no further transition.
//! - `finished_at` is set exactly when the record becomes terminal.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current timestamp truncated to microseconds.
///
/// Stores persist microsecond precision, so every timestamp is cut to that
/// precision up front to keep ordering identical across backends.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Blob path of the generated result for a task.
pub fn output_path(task_id: &str) -> String {
    format!("tasks/{}/output.png", task_id)
}

/// Blob folder holding every artifact of a task.
pub fn task_folder(task_id: &str) -> String {
    format!("tasks/{}/", task_id)
}

/// Task status enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created by the client, waiting for the trigger handler
    Queued,
    /// The trigger handler owns the record
    Processing,
    /// Result stored and published
    Done,
    /// Failed; diagnostic fields are set
    Error,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Queued,
        TaskStatus::Processing,
        TaskStatus::Done,
        TaskStatus::Error,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Done => "done",
            TaskStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(TaskStatus::Queued),
            "processing" => Some(TaskStatus::Processing),
            "done" => Some(TaskStatus::Done),
            "error" => Some(TaskStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostics recorded when a task fails.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailure {
    pub error: String,
    /// Parsed upstream JSON or a truncated raw-text snippet
    pub details: Option<serde_json::Value>,
    /// Upstream request-correlation id
    pub request_id: Option<String>,
    /// Upstream HTTP status code
    pub upstream_status: Option<u16>,
}

impl TaskFailure {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            ..Self::default()
        }
    }
}

/// A requested status change.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskTransition {
    /// `Queued -> Processing`
    Start,
    /// `Processing -> Done`
    Complete { url: String, output_path: String },
    /// `Queued | Processing -> Error`
    Fail(TaskFailure),
}

impl TaskTransition {
    pub fn target(&self) -> TaskStatus {
        match self {
            TaskTransition::Start => TaskStatus::Processing,
            TaskTransition::Complete { .. } => TaskStatus::Done,
            TaskTransition::Fail(_) => TaskStatus::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot move task from {from} to {to}")]
pub struct InvalidTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// Persisted state of one photo-to-AI-image conversion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_status: Option<u16>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// A fresh `Queued` record.
    pub fn new(id: String, input_path: Option<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            status: TaskStatus::Queued,
            input_path,
            output_path: None,
            url: None,
            error: None,
            details: None,
            request_id: None,
            upstream_status: None,
            created_at,
            updated_at: created_at,
            finished_at: None,
        }
    }

    /// Apply a transition, refusing any edge outside the state machine.
    pub fn apply(
        &mut self,
        transition: TaskTransition,
        at: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        let allowed = match (self.status, &transition) {
            (TaskStatus::Queued, TaskTransition::Start) => true,
            (TaskStatus::Queued, TaskTransition::Fail(_)) => true,
            (TaskStatus::Queued, TaskTransition::Complete { .. }) => false,
            (TaskStatus::Processing, TaskTransition::Complete { .. }) => true,
            (TaskStatus::Processing, TaskTransition::Fail(_)) => true,
            (TaskStatus::Processing, TaskTransition::Start) => false,
            (TaskStatus::Done | TaskStatus::Error, _) => false,
        };
        if !allowed {
            return Err(InvalidTransition {
                from: self.status,
                to: transition.target(),
            });
        }

        self.status = transition.target();
        self.updated_at = at;
        match transition {
            TaskTransition::Start => {}
            TaskTransition::Complete { url, output_path } => {
                self.url = Some(url);
                self.output_path = Some(output_path);
                self.finished_at = Some(at);
            }
            TaskTransition::Fail(failure) => {
                self.error = Some(failure.error);
                self.details = failure.details;
                self.request_id = failure.request_id;
                self.upstream_status = failure.upstream_status;
                self.finished_at = Some(at);
            }
        }
        Ok(())
    }
}
