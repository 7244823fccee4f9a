//! Durable, field-addressable task and task-group records.
//!
//! Records live in store hashes and are bounded by a TTL (tasks two weeks,
//! groups one week by default). Handles ([`TaskRecord`], [`TaskGroup`]) are
//! cheap to clone and carry no cached field values.

pub mod group;
pub mod record;
pub mod status;

pub use group::{TaskGroup, DEFAULT_GROUP_TTL};
pub use record::{fields, NewTask, TaskOutcome, TaskRecord, DEFAULT_TASK_TTL, RAW_CONTAINER};
pub use status::{InternalStatus, ParseStatusError, TaskStatus};
