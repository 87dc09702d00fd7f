//! Task records for photo-to-AI-image conversion requests.
//!
//! - `record`: the record type and its status state machine
//! - `store`: pluggable persistence backends for records

mod record;
pub mod store;

pub use record::{
    now, output_path, task_folder, InvalidTransition, TaskFailure, TaskRecord, TaskStatus,
    TaskTransition,
};
