//! API request and response types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service version
    pub version: String,

    /// Whether the server is running in dev mode (admin auth disabled)
    pub dev_mode: bool,

    /// Whether admin endpoints require a bearer token
    pub auth_required: bool,

    /// Task store backend in use
    pub task_store: String,
}

/// Request to create a new task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    /// Client-generated id; a UUID is generated when absent
    pub id: Option<String>,

    /// Blob path of the uploaded photo
    pub input_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadQuery {
    pub task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub path: String,
    pub content_type: String,
}

/// Query string of a public artifact link.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DownloadQuery {
    #[serde(default)]
    pub alt: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffRequest {
    /// Any JSON value; a missing field reads as `null` and is rejected.
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffCreated {
    pub id: String,
    pub expires_at: DateTime<Utc>,
}

/// Login request for dashboard auth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub password: String,
}

/// Login response containing a JWT for admin requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    /// Expiration as unix seconds.
    pub exp: i64,
}

/// Admin task listing query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListTasksQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

/// Admin export query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExportQuery {
    pub status: Option<String>,
}

/// Task statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    /// Total number of tasks ever created
    pub total_tasks: usize,

    pub queued_tasks: usize,

    pub processing_tasks: usize,

    pub completed_tasks: usize,

    pub failed_tasks: usize,

    /// Completed / (completed + failed), 1.0 when nothing has finished
    pub success_rate: f64,
}
