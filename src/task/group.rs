//! Task groups: batches of tasks submitted together by one user.

use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::keys::Keyspace;
use crate::store::{decode_utf8, SharedStore};

/// Default group time-to-live: one week.
pub const DEFAULT_GROUP_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const USER_ID: &str = "user_id";

/// Handle on a task group hash and its member list.
///
/// A group exists only while its `user_id` field is set.
#[derive(Clone)]
pub struct TaskGroup {
    store: SharedStore,
    key: String,
    members_key: String,
    group_id: String,
}

impl std::fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup")
            .field("group_id", &self.group_id)
            .finish_non_exhaustive()
    }
}

impl TaskGroup {
    fn handle(store: SharedStore, keys: &Keyspace, group_id: String) -> Self {
        Self {
            key: keys.task_group(&group_id),
            members_key: keys.task_group_members(&group_id),
            store,
            group_id,
        }
    }

    /// Generates a fresh group id.
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Returns `true` if the group exists with an owning user.
    pub async fn exists(store: &SharedStore, keys: &Keyspace, group_id: &str) -> Result<bool> {
        Ok(store.hexists(&keys.task_group(group_id), USER_ID).await?)
    }

    /// Creates a group owned by `user_id`. The TTL is attached only if the
    /// group does not already carry one.
    pub async fn create(
        store: SharedStore,
        keys: &Keyspace,
        group_id: impl Into<String>,
        user_id: &str,
        ttl: Duration,
    ) -> Result<Self> {
        let group = Self::handle(store, keys, group_id.into());
        group
            .store
            .hset(&group.key, USER_ID, user_id.as_bytes())
            .await?;
        group.store.expire_if_unset(&group.key, ttl).await?;
        debug!(group_id = %group.group_id, user_id, "task group created");
        Ok(group)
    }

    /// Attaches to an existing group.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownGroup`] if no owning user is recorded.
    pub async fn attach(store: SharedStore, keys: &Keyspace, group_id: &str) -> Result<Self> {
        if !Self::exists(&store, keys, group_id).await? {
            return Err(Error::UnknownGroup {
                group_id: group_id.to_string(),
            });
        }
        Ok(Self::handle(store, keys, group_id.to_string()))
    }

    /// The group id.
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// The owning user.
    pub async fn user_id(&self) -> Result<String> {
        let raw = self
            .store
            .hget(&self.key, USER_ID)
            .await?
            .ok_or_else(|| Error::UnknownGroup {
                group_id: self.group_id.clone(),
            })?;
        decode_utf8(&self.key, USER_ID, raw)
    }

    /// Appends a task id to the member list. The list expires together with
    /// the group.
    pub async fn add_task(&self, task_id: &str) -> Result<()> {
        self.store
            .rpush(&self.members_key, task_id.as_bytes())
            .await?;
        if let Some(remaining) = self.store.ttl(&self.key).await? {
            self.store
                .expire_if_unset(&self.members_key, remaining)
                .await?;
        }
        Ok(())
    }

    /// Member task ids in insertion order.
    pub async fn task_ids(&self) -> Result<Vec<String>> {
        self.store
            .lrange(&self.members_key, 0, -1)
            .await?
            .into_iter()
            .map(|raw| decode_utf8(&self.members_key, "", raw))
            .collect()
    }

    /// Deletes the group and its member list. Member task records are left
    /// to their own lifecycle.
    pub async fn delete(&self) -> Result<bool> {
        self.store.delete(&self.members_key).await?;
        Ok(self.store.delete(&self.key).await?)
    }
}
