//! Task records: one store hash per submitted unit of work.
//!
//! A [`TaskRecord`] is a handle (store + key + id), not a snapshot. Every
//! accessor performs exactly one field read or write against the store, so
//! partial updates never need a full-record round trip and no component
//! keeps record state in process memory between calls.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::debug;
use uuid::Uuid;

use super::status::{InternalStatus, TaskStatus};
use crate::error::{Error, Result};
use crate::keys::Keyspace;
use crate::store::{decode_utf8, SharedStore};

/// Default record time-to-live: two weeks.
pub const DEFAULT_TASK_TTL: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// Container id meaning "run without a container".
pub const RAW_CONTAINER: &str = "RAW";

/// Hash field names.
pub mod fields {
    /// User-visible [`TaskStatus`](crate::TaskStatus).
    pub const STATUS: &str = "status";
    /// Forwarder-side [`InternalStatus`](crate::InternalStatus).
    pub const INTERNAL_STATUS: &str = "internal_status";
    /// Submitting user.
    pub const USER_ID: &str = "user_id";
    /// Function being invoked.
    pub const FUNCTION_ID: &str = "function_id";
    /// Target endpoint.
    pub const ENDPOINT_ID: &str = "endpoint_id";
    /// Container to run in, or `RAW`.
    pub const CONTAINER_ID: &str = "container_id";
    /// Opaque serialized function and arguments.
    pub const PAYLOAD: &str = "payload";
    /// Opaque serialized result.
    pub const RESULT: &str = "result";
    /// Opaque serialized exception.
    pub const EXCEPTION: &str = "exception";
    /// RFC 3339 completion timestamp.
    pub const COMPLETION_TIME: &str = "completion_time";
    /// Owning task group, if any.
    pub const TASK_GROUP_ID: &str = "task_group_id";
}

/// How a unit of work finished on the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Serialized result.
    Success(Vec<u8>),
    /// Serialized exception.
    Failure(Vec<u8>),
}

impl TaskOutcome {
    /// Returns `true` for [`TaskOutcome::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Builds a failure outcome from a plain message.
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure(message.into().into_bytes())
    }
}

/// Field values for [`TaskRecord::create_or_attach`].
///
/// Every field set here is an explicit override and is written even if the
/// record already exists. Unset fields are left alone; on a fresh record
/// `status`, `internal_status` and `container_id` receive their defaults.
///
/// # Examples
///
/// ```
/// use taskrelay::task::NewTask;
///
/// let fields = NewTask::new()
///     .user_id("u-1")
///     .function_id("f-1")
///     .endpoint_id("e-1")
///     .payload(b"blob".to_vec());
/// assert_eq!(fields.endpoint_id.as_deref(), Some("e-1"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewTask {
    /// Submitting user.
    pub user_id: Option<String>,
    /// Function being invoked.
    pub function_id: Option<String>,
    /// Target endpoint.
    pub endpoint_id: Option<String>,
    /// Container id.
    pub container_id: Option<String>,
    /// Serialized payload.
    pub payload: Option<Vec<u8>>,
    /// Owning group.
    pub task_group_id: Option<String>,
    /// Status override.
    pub status: Option<TaskStatus>,
    /// Internal status override.
    pub internal_status: Option<InternalStatus>,
}

impl NewTask {
    /// Creates an empty field set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the user id.
    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Sets the function id.
    pub fn function_id(mut self, function_id: impl Into<String>) -> Self {
        self.function_id = Some(function_id.into());
        self
    }

    /// Sets the endpoint id.
    pub fn endpoint_id(mut self, endpoint_id: impl Into<String>) -> Self {
        self.endpoint_id = Some(endpoint_id.into());
        self
    }

    /// Sets the container id.
    pub fn container_id(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = Some(container_id.into());
        self
    }

    /// Sets the payload.
    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Sets the task group id.
    pub fn task_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.task_group_id = Some(group_id.into());
        self
    }

    /// Overrides the status.
    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Overrides the internal status.
    pub fn internal_status(mut self, status: InternalStatus) -> Self {
        self.internal_status = Some(status);
        self
    }

    fn overrides(&self) -> Vec<(&'static str, &[u8])> {
        let mut out = Vec::new();
        let text = [
            (fields::USER_ID, &self.user_id),
            (fields::FUNCTION_ID, &self.function_id),
            (fields::ENDPOINT_ID, &self.endpoint_id),
            (fields::CONTAINER_ID, &self.container_id),
            (fields::TASK_GROUP_ID, &self.task_group_id),
        ];
        for (field, value) in text {
            if let Some(value) = value {
                out.push((field, value.as_bytes()));
            }
        }
        if let Some(payload) = &self.payload {
            out.push((fields::PAYLOAD, payload.as_slice()));
        }
        if let Some(status) = self.status {
            out.push((fields::STATUS, status.as_str().as_bytes()));
        }
        if let Some(status) = self.internal_status {
            out.push((fields::INTERNAL_STATUS, status.as_str().as_bytes()));
        }
        out
    }
}

/// Handle on one task's hash in the store.
#[derive(Clone)]
pub struct TaskRecord {
    store: SharedStore,
    key: String,
    task_id: String,
}

impl std::fmt::Debug for TaskRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRecord")
            .field("task_id", &self.task_id)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl TaskRecord {
    /// Generates a fresh task id.
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Returns `true` if a record exists for `task_id`.
    pub async fn exists(store: &SharedStore, keys: &Keyspace, task_id: &str) -> Result<bool> {
        Ok(store.exists(&keys.task(task_id)).await?)
    }

    /// Creates the record, or attaches to it if it already exists.
    ///
    /// Initial `status` (`RECEIVED`), `internal_status` (`INCOMPLETE`) and
    /// `container_id` (`RAW`) are written only if absent, so a repeated call
    /// never resets them. The TTL is attached only if the key has none, so a
    /// repeated call neither refreshes nor shortens it. Fields set in
    /// `new` are explicit overrides and always written.
    pub async fn create_or_attach(
        store: SharedStore,
        keys: &Keyspace,
        task_id: impl Into<String>,
        new: NewTask,
        ttl: Duration,
    ) -> Result<Self> {
        let record = Self::attach(store, keys, task_id);

        for (field, value) in new.overrides() {
            record.store.hset(&record.key, field, value).await?;
        }
        let defaults = [
            (fields::STATUS, TaskStatus::Received.as_str()),
            (fields::INTERNAL_STATUS, InternalStatus::Incomplete.as_str()),
            (fields::CONTAINER_ID, RAW_CONTAINER),
        ];
        for (field, value) in defaults {
            record
                .store
                .hset_nx(&record.key, field, value.as_bytes())
                .await?;
        }
        if record.store.expire_if_unset(&record.key, ttl).await? {
            debug!(task_id = %record.task_id, ttl_secs = ttl.as_secs(), "task record created");
        }
        Ok(record)
    }

    /// Returns a handle on an existing (or not yet existing) record without
    /// touching the store.
    pub fn attach(store: SharedStore, keys: &Keyspace, task_id: impl Into<String>) -> Self {
        let task_id = task_id.into();
        Self {
            key: keys.task(&task_id),
            store,
            task_id,
        }
    }

    /// The task id.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// The store key of the record hash.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns `true` if the record still exists (has not expired or been
    /// deleted).
    pub async fn is_present(&self) -> Result<bool> {
        Ok(self.store.exists(&self.key).await?)
    }

    /// Reads one raw field.
    pub async fn get(&self, field: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.store.hget(&self.key, field).await?)
    }

    /// Writes one raw field. Refused once the record is terminal.
    pub async fn set(&self, field: &str, value: &[u8]) -> Result<()> {
        let status = self.status().await?;
        if status.is_terminal() {
            return Err(Error::TerminalState {
                task_id: self.task_id.clone(),
                status,
            });
        }
        self.store.hset(&self.key, field, value).await?;
        Ok(())
    }

    /// Deletes the record. Returns `true` if it existed.
    pub async fn delete(&self) -> Result<bool> {
        Ok(self.store.delete(&self.key).await?)
    }

    /// Remaining time-to-live.
    pub async fn ttl(&self) -> Result<Option<Duration>> {
        Ok(self.store.ttl(&self.key).await?)
    }

    async fn text(&self, field: &str) -> Result<Option<String>> {
        match self.get(field).await? {
            Some(raw) => decode_utf8(&self.key, field, raw).map(Some),
            None => Ok(None),
        }
    }

    async fn required_text(&self, field: &str) -> Result<String> {
        self.text(field)
            .await?
            .ok_or_else(|| Error::unknown_task(&self.task_id))
    }

    fn malformed(&self, field: &str, message: impl ToString) -> Error {
        Error::MalformedField {
            key: self.key.clone(),
            field: field.to_string(),
            message: message.to_string(),
        }
    }

    /// Current status. A missing record reports [`Error::UnknownTask`].
    pub async fn status(&self) -> Result<TaskStatus> {
        let raw = self.required_text(fields::STATUS).await?;
        raw.parse().map_err(|e| self.malformed(fields::STATUS, e))
    }

    /// Current internal status.
    pub async fn internal_status(&self) -> Result<InternalStatus> {
        let raw = self.required_text(fields::INTERNAL_STATUS).await?;
        raw.parse()
            .map_err(|e| self.malformed(fields::INTERNAL_STATUS, e))
    }

    /// Submitting user.
    pub async fn user_id(&self) -> Result<Option<String>> {
        self.text(fields::USER_ID).await
    }

    /// Function being invoked.
    pub async fn function_id(&self) -> Result<Option<String>> {
        self.text(fields::FUNCTION_ID).await
    }

    /// Target endpoint.
    pub async fn endpoint_id(&self) -> Result<Option<String>> {
        self.text(fields::ENDPOINT_ID).await
    }

    /// Container id; `RAW` when none was assigned.
    pub async fn container_id(&self) -> Result<String> {
        Ok(self
            .text(fields::CONTAINER_ID)
            .await?
            .unwrap_or_else(|| RAW_CONTAINER.to_string()))
    }

    /// Owning task group.
    pub async fn task_group_id(&self) -> Result<Option<String>> {
        self.text(fields::TASK_GROUP_ID).await
    }

    /// Serialized payload. A missing payload reports [`Error::UnknownTask`].
    pub async fn payload(&self) -> Result<Vec<u8>> {
        self.get(fields::PAYLOAD)
            .await?
            .ok_or_else(|| Error::unknown_task(&self.task_id))
    }

    /// Serialized result, once the task succeeded.
    pub async fn result(&self) -> Result<Option<Vec<u8>>> {
        self.get(fields::RESULT).await
    }

    /// Serialized exception, once the task failed.
    pub async fn exception(&self) -> Result<Option<Vec<u8>>> {
        self.get(fields::EXCEPTION).await
    }

    /// When completion was recorded.
    pub async fn completion_time(&self) -> Result<Option<DateTime<Utc>>> {
        let Some(raw) = self.text(fields::COMPLETION_TIME).await? else {
            return Ok(None);
        };
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| self.malformed(fields::COMPLETION_TIME, e))
    }

    /// Sets the target endpoint.
    pub async fn set_endpoint_id(&self, endpoint_id: &str) -> Result<()> {
        self.set(fields::ENDPOINT_ID, endpoint_id.as_bytes()).await
    }

    /// Sets the payload.
    pub async fn set_payload(&self, payload: &[u8]) -> Result<()> {
        self.set(fields::PAYLOAD, payload).await
    }

    /// Sets the container id.
    pub async fn set_container_id(&self, container_id: &str) -> Result<()> {
        self.set(fields::CONTAINER_ID, container_id.as_bytes())
            .await
    }

    /// Links the record to a task group.
    pub async fn set_task_group_id(&self, group_id: &str) -> Result<()> {
        self.set(fields::TASK_GROUP_ID, group_id.as_bytes()).await
    }

    /// Moves `status` forward to `next`.
    ///
    /// Implemented as a compare-and-set loop on the `status` field, so two
    /// writers can never move the record backwards. Returns `Ok(false)` when
    /// the record is already at or past `next` (re-dispatch, late reports),
    /// and an error when `next` would skip a mandatory phase or the record is
    /// terminal in a different status.
    pub async fn advance_status(&self, next: TaskStatus) -> Result<bool> {
        loop {
            let current = self.status().await?;
            if current == next {
                return Ok(false);
            }
            if current.is_terminal() {
                return Err(Error::TerminalState {
                    task_id: self.task_id.clone(),
                    status: current,
                });
            }
            if next.rank() <= current.rank() {
                return Ok(false);
            }
            current.validate_transition(&self.task_id, &next)?;
            let swapped = self
                .store
                .hcas(
                    &self.key,
                    fields::STATUS,
                    current.as_str().as_bytes(),
                    next.as_str().as_bytes(),
                )
                .await?;
            if swapped {
                debug!(task_id = %self.task_id, from = %current, to = %next, "status advanced");
                return Ok(true);
            }
        }
    }

    /// Records the backend's outcome and moves the task to its terminal
    /// status.
    ///
    /// Writes `result` or `exception`, `completion_time` and
    /// `internal_status = COMPLETE`, then walks `status` through `RUNNING`
    /// to `SUCCESS`, or straight to `FAILED`.
    pub async fn complete(&self, outcome: TaskOutcome) -> Result<TaskStatus> {
        let status = self.status().await?;
        if status.is_terminal() {
            return Err(Error::TerminalState {
                task_id: self.task_id.clone(),
                status,
            });
        }

        let terminal = match &outcome {
            TaskOutcome::Success(result) => {
                self.store.hset(&self.key, fields::RESULT, result).await?;
                TaskStatus::Success
            },
            TaskOutcome::Failure(exception) => {
                self.store
                    .hset(&self.key, fields::EXCEPTION, exception)
                    .await?;
                TaskStatus::Failed
            },
        };
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        self.store
            .hset(&self.key, fields::COMPLETION_TIME, now.as_bytes())
            .await?;
        self.store
            .hset(
                &self.key,
                fields::INTERNAL_STATUS,
                InternalStatus::Complete.as_str().as_bytes(),
            )
            .await?;

        if terminal == TaskStatus::Success {
            self.advance_status(TaskStatus::WaitingForEp).await?;
            self.advance_status(TaskStatus::Running).await?;
        }
        self.advance_status(terminal).await?;
        Ok(terminal)
    }
}
