//! Key and channel naming for everything taskrelay keeps in the store.
//!
//! # Key Schema
//!
//! | Key Pattern | Type | Purpose |
//! |-------------|------|---------|
//! | `{prefix}:task:{task_id}` | Hash | Task record fields |
//! | `{prefix}:task_group:{group_id}` | Hash | Task group record |
//! | `{prefix}:task_group:{group_id}:tasks` | List | Group member task ids |
//! | `{prefix}:ep:{endpoint_id}:tasks` | Channel | Live task-id delivery |
//! | `{prefix}:ep:{endpoint_id}:backlog` | List | Fallback queue (FIFO) |
//! | `{prefix}:ep:{endpoint_id}:queue` | List | Direct endpoint queue |
//! | `{prefix}:ep:{endpoint_id}:status` | List | Heartbeat ring buffer |
//! | `{prefix}:ep:{endpoint_id}:meta` | Hash | Static endpoint metadata |
//! | `{prefix}:stats:total_core_hrs` | String | Global compute-hours counter |

/// Default key prefix.
pub const DEFAULT_PREFIX: &str = "taskrelay";

/// Builds store keys under a common prefix.
///
/// # Examples
///
/// ```
/// use taskrelay::keys::Keyspace;
///
/// let keys = Keyspace::new("prod");
/// assert_eq!(keys.task("abc"), "prod:task:abc");
/// assert_eq!(keys.endpoint_backlog("e1"), "prod:ep:e1:backlog");
/// assert_eq!(
///     keys.endpoint_from_channel(&keys.endpoint_channel("e1")),
///     Some("e1")
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    prefix: String,
}

impl Keyspace {
    /// Creates a keyspace with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The configured prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Hash holding a task record.
    pub fn task(&self, task_id: &str) -> String {
        format!("{}:task:{task_id}", self.prefix)
    }

    /// Hash holding a task group record.
    pub fn task_group(&self, group_id: &str) -> String {
        format!("{}:task_group:{group_id}", self.prefix)
    }

    /// List of task ids belonging to a group.
    pub fn task_group_members(&self, group_id: &str) -> String {
        format!("{}:task_group:{group_id}:tasks", self.prefix)
    }

    /// Pub/sub channel on which task ids are delivered to an endpoint.
    pub fn endpoint_channel(&self, endpoint_id: &str) -> String {
        format!("{}:ep:{endpoint_id}:tasks", self.prefix)
    }

    /// Fallback list buffering task ids while nobody is subscribed.
    pub fn endpoint_backlog(&self, endpoint_id: &str) -> String {
        format!("{}:ep:{endpoint_id}:backlog", self.prefix)
    }

    /// Direct per-endpoint queue list.
    pub fn endpoint_queue(&self, endpoint_id: &str) -> String {
        format!("{}:ep:{endpoint_id}:queue", self.prefix)
    }

    /// Heartbeat log list (most recent first).
    pub fn endpoint_status(&self, endpoint_id: &str) -> String {
        format!("{}:ep:{endpoint_id}:status", self.prefix)
    }

    /// Static endpoint metadata hash.
    pub fn endpoint_metadata(&self, endpoint_id: &str) -> String {
        format!("{}:ep:{endpoint_id}:meta", self.prefix)
    }

    /// Global compute-hours aggregate.
    pub fn compute_hours(&self) -> String {
        format!("{}:stats:total_core_hrs", self.prefix)
    }

    /// Recovers the endpoint id from a channel built by
    /// [`endpoint_channel`](Self::endpoint_channel).
    pub fn endpoint_from_channel<'a>(&self, channel: &'a str) -> Option<&'a str> {
        channel
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix(":ep:")?
            .strip_suffix(":tasks")
    }
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}
