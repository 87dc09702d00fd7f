//! HTTP API for the photo booth.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check
//! - `POST /api/uploads?taskId=` - Upload the input photo (multipart `file`)
//! - `POST /api/tasks` - Create a queued task
//! - `GET /api/tasks/{id}` - Get a task record
//! - `GET /api/tasks/{id}/stream` - Stream status changes via SSE
//! - `GET /v0/b/{bucket}/o/{path}?alt=media&token=` - Download an artifact
//! - `POST /api/handoff` / `GET /api/handoff/{id}` - QR payload handoff
//! - `POST /api/auth/login` - Exchange the dashboard password for a JWT
//! - `GET /api/admin/tasks` - Page through tasks
//! - `GET /api/admin/stats` - Counts per status
//! - `DELETE /api/admin/tasks/{id}` - Delete a task and its blobs
//! - `GET /api/admin/export?status=` - ZIP of task folders

mod admin;
mod auth;
mod blobs;
mod handoff;
mod routes;
pub mod types;

pub use routes::{router, serve, AppState};
pub use types::*;
