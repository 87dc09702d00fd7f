//! # Photo Booth
//!
//! Backend for an AI photo booth: a kiosk uploads a photo, creates a task
//! record, and a trigger handler turns it into a watermarked, shareable
//! image.
//!
//! ## Task Flow
//! 1. Kiosk uploads the photo (`POST /api/uploads`) and creates a task
//!    (`POST /api/tasks`)
//! 2. The task store announces the new record; the dispatcher hands it to
//!    the trigger handler
//! 3. The handler calls the image-editing API, overlays the watermark and
//!    stores the result under `tasks/{id}/output.png`
//! 4. The record ends `done` with a tokenized download URL, or `error` with
//!    upstream diagnostics
//!
//! ## Modules
//! - `task`: task records, the status state machine and pluggable stores
//! - `trigger`: the trigger handler, dispatcher and restart recovery
//! - `transform`: image-editing API client with the alternate-field retry
//! - `overlay`: watermark compositing
//! - `storage`: blob storage and public URLs
//! - `handoff`: short-lived QR payload store
//! - `api`: HTTP surface (booth, artifacts, admin dashboard)

pub mod api;
pub mod config;
pub mod handoff;
pub mod overlay;
pub mod storage;
pub mod task;
pub mod transform;
pub mod trigger;
pub mod util;

pub use config::Config;
