//! Submission-side helper: create records, resolve containers, dispatch, and
//! collect results.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::cache::BoundedCache;
use crate::dispatch::TaskPublisher;
use crate::error::{Error, Result};
use crate::keys::Keyspace;
use crate::store::SharedStore;
use crate::task::{
    NewTask, TaskGroup, TaskRecord, TaskStatus, DEFAULT_GROUP_TTL, DEFAULT_TASK_TTL, RAW_CONTAINER,
};

/// Maps a (function, endpoint) pair to the container it must run in.
#[async_trait]
pub trait ContainerRegistry: Send + Sync {
    /// The container id, or `None` to run without a container.
    async fn container_for(&self, function_id: &str, endpoint_id: &str) -> Result<Option<String>>;
}

/// Fixed in-memory mapping, useful for tests and single-tenant setups.
#[derive(Debug, Clone, Default)]
pub struct StaticContainerRegistry {
    mappings: HashMap<(String, String), String>,
}

impl StaticContainerRegistry {
    /// Creates an empty registry (every lookup yields `RAW`).
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a mapping.
    pub fn with_mapping(
        mut self,
        function_id: impl Into<String>,
        endpoint_id: impl Into<String>,
        container_id: impl Into<String>,
    ) -> Self {
        self.mappings
            .insert((function_id.into(), endpoint_id.into()), container_id.into());
        self
    }
}

#[async_trait]
impl ContainerRegistry for StaticContainerRegistry {
    async fn container_for(&self, function_id: &str, endpoint_id: &str) -> Result<Option<String>> {
        Ok(self
            .mappings
            .get(&(function_id.to_string(), endpoint_id.to_string()))
            .cloned())
    }
}

/// Read-through [`BoundedCache`] in front of another registry.
pub struct CachedContainerRegistry<R> {
    inner: R,
    cache: BoundedCache<(String, String), Option<String>>,
}

impl<R> std::fmt::Debug for CachedContainerRegistry<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedContainerRegistry")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl<R: ContainerRegistry> CachedContainerRegistry<R> {
    /// Wraps `inner` with a cache of `capacity` entries, each trusted for
    /// `max_age`.
    pub fn new(inner: R, capacity: usize, max_age: Duration) -> Self {
        Self {
            inner,
            cache: BoundedCache::new(capacity, max_age),
        }
    }
}

#[async_trait]
impl<R: ContainerRegistry> ContainerRegistry for CachedContainerRegistry<R> {
    async fn container_for(&self, function_id: &str, endpoint_id: &str) -> Result<Option<String>> {
        let key = (function_id.to_string(), endpoint_id.to_string());
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit);
        }
        let container = self.inner.container_for(function_id, endpoint_id).await?;
        self.cache.insert(key, container.clone());
        Ok(container)
    }
}

/// One unit of work to submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    /// Submitting user.
    pub user_id: String,
    /// Function to invoke.
    pub function_id: String,
    /// Target endpoint.
    pub endpoint_id: String,
    /// Serialized function and arguments.
    pub payload: Vec<u8>,
    /// Caller-chosen id; generated when absent.
    pub task_id: Option<String>,
}

impl SubmitRequest {
    /// Creates a request with a generated task id.
    pub fn new(
        user_id: impl Into<String>,
        function_id: impl Into<String>,
        endpoint_id: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            function_id: function_id.into(),
            endpoint_id: endpoint_id.into(),
            payload,
            task_id: None,
        }
    }

    /// Uses `task_id` instead of a generated id.
    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

/// What [`Submitter::fetch_result`] found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult {
    /// Not finished yet.
    Pending(TaskStatus),
    /// Finished with a result. The record has been deleted.
    Success(Vec<u8>),
    /// Finished with an exception. The record has been deleted.
    Failed(Vec<u8>),
}

/// Creates task records and dispatches them.
#[derive(Clone)]
pub struct Submitter {
    store: SharedStore,
    keys: Keyspace,
    publisher: TaskPublisher,
    registry: Option<Arc<dyn ContainerRegistry>>,
    task_ttl: Duration,
    group_ttl: Duration,
}

impl std::fmt::Debug for Submitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submitter")
            .field("keys", &self.keys)
            .field("task_ttl", &self.task_ttl)
            .field("group_ttl", &self.group_ttl)
            .finish_non_exhaustive()
    }
}

impl Submitter {
    /// Creates a submitter with default TTLs and no container registry.
    pub fn new(store: SharedStore, keys: Keyspace) -> Self {
        Self {
            publisher: TaskPublisher::new(store.clone(), keys.clone()),
            store,
            keys,
            registry: None,
            task_ttl: DEFAULT_TASK_TTL,
            group_ttl: DEFAULT_GROUP_TTL,
        }
    }

    /// Resolves containers through `registry`.
    pub fn with_registry(mut self, registry: Arc<dyn ContainerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Overrides record TTLs.
    pub fn with_ttls(mut self, task_ttl: Duration, group_ttl: Duration) -> Self {
        self.task_ttl = task_ttl;
        self.group_ttl = group_ttl;
        self
    }

    async fn container_for(&self, request: &SubmitRequest) -> Result<String> {
        let Some(registry) = &self.registry else {
            return Ok(RAW_CONTAINER.to_string());
        };
        Ok(registry
            .container_for(&request.function_id, &request.endpoint_id)
            .await?
            .unwrap_or_else(|| RAW_CONTAINER.to_string()))
    }

    async fn submit_in_group(
        &self,
        request: SubmitRequest,
        group_id: Option<&str>,
    ) -> Result<TaskRecord> {
        let container_id = self.container_for(&request).await?;
        let task_id = request.task_id.unwrap_or_else(TaskRecord::new_id);
        let mut fields = NewTask::new()
            .user_id(request.user_id)
            .function_id(request.function_id)
            .endpoint_id(request.endpoint_id.clone())
            .container_id(container_id)
            .payload(request.payload);
        if let Some(group_id) = group_id {
            fields = fields.task_group_id(group_id);
        }

        let record = TaskRecord::create_or_attach(
            self.store.clone(),
            &self.keys,
            task_id,
            fields,
            self.task_ttl,
        )
        .await?;
        self.publisher.put(&request.endpoint_id, &record).await?;
        debug!(task_id = record.task_id(), endpoint_id = %request.endpoint_id, "task submitted");
        Ok(record)
    }

    /// Creates the record and dispatches it to its endpoint.
    pub async fn submit(&self, request: SubmitRequest) -> Result<TaskRecord> {
        self.submit_in_group(request, None).await
    }

    /// Submits several tasks under a fresh group owned by `user_id`.
    pub async fn submit_batch(
        &self,
        user_id: &str,
        requests: Vec<SubmitRequest>,
    ) -> Result<(TaskGroup, Vec<TaskRecord>)> {
        let group = TaskGroup::create(
            self.store.clone(),
            &self.keys,
            TaskGroup::new_id(),
            user_id,
            self.group_ttl,
        )
        .await?;
        let mut records = Vec::with_capacity(requests.len());
        for request in requests {
            let record = self
                .submit_in_group(request, Some(group.group_id()))
                .await?;
            group.add_task(record.task_id()).await?;
            records.push(record);
        }
        info!(group_id = group.group_id(), count = records.len(), "batch submitted");
        Ok((group, records))
    }

    /// Reads a task's outcome. A terminal result is returned once: the
    /// record is deleted after it is read.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownTask`] if the record never existed or has expired.
    pub async fn fetch_result(&self, task_id: &str) -> Result<TaskResult> {
        let record = TaskRecord::attach(self.store.clone(), &self.keys, task_id);
        let status = record.status().await?;
        let result = match status {
            TaskStatus::Success => TaskResult::Success(
                record
                    .result()
                    .await?
                    .ok_or_else(|| Error::unknown_task(task_id))?,
            ),
            TaskStatus::Failed => TaskResult::Failed(
                record
                    .exception()
                    .await?
                    .ok_or_else(|| Error::unknown_task(task_id))?,
            ),
            pending => return Ok(TaskResult::Pending(pending)),
        };
        record.delete().await?;
        Ok(result)
    }

    /// Deletes a task group after its results were collected.
    pub async fn delete_group(&self, group_id: &str) -> Result<bool> {
        let group = TaskGroup::attach(self.store.clone(), &self.keys, group_id).await?;
        group.delete().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::store::MemoryStore;
    use crate::task::TaskOutcome;
    use pretty_assertions::assert_eq;

    fn request(endpoint: &str) -> SubmitRequest {
        SubmitRequest {
            user_id: "u1".into(),
            function_id: "f1".into(),
            endpoint_id: endpoint.into(),
            payload: b"payload".to_vec(),
            task_id: None,
        }
    }

    struct CountingRegistry(AtomicUsize);

    #[async_trait]
    impl ContainerRegistry for CountingRegistry {
        async fn container_for(&self, _: &str, _: &str) -> Result<Option<String>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Some("c-1".into()))
        }
    }

    #[tokio::test]
    async fn cached_registry_hits_inner_once() {
        let registry = CachedContainerRegistry::new(
            CountingRegistry(AtomicUsize::new(0)),
            8,
            Duration::from_secs(60),
        );
        for _ in 0..3 {
            assert_eq!(
                registry.container_for("f", "e").await.unwrap().as_deref(),
                Some("c-1")
            );
        }
        assert_eq!(registry.inner.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn submit_resolves_container_and_queues() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let submitter = Submitter::new(store.clone(), Keyspace::default()).with_registry(
            Arc::new(StaticContainerRegistry::new().with_mapping("f1", "e1", "docker-py")),
        );
        let record = submitter.submit(request("e1")).await.unwrap();
        assert_eq!(record.container_id().await.unwrap(), "docker-py");
        assert_eq!(record.status().await.unwrap(), TaskStatus::WaitingForEp);

        let other = submitter.submit(request("e2")).await.unwrap();
        assert_eq!(other.container_id().await.unwrap(), RAW_CONTAINER);
    }

    #[tokio::test]
    async fn fetch_result_consumes_terminal_record() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let submitter = Submitter::new(store.clone(), Keyspace::default());
        let record = submitter.submit(request("e1")).await.unwrap();
        let id = record.task_id().to_string();

        assert_eq!(
            submitter.fetch_result(&id).await.unwrap(),
            TaskResult::Pending(TaskStatus::WaitingForEp)
        );
        record
            .complete(TaskOutcome::Success(b"ok".to_vec()))
            .await
            .unwrap();
        assert_eq!(
            submitter.fetch_result(&id).await.unwrap(),
            TaskResult::Success(b"ok".to_vec())
        );
        assert!(matches!(
            submitter.fetch_result(&id).await,
            Err(Error::UnknownTask { .. })
        ));
    }

    #[tokio::test]
    async fn batch_creates_group_with_members() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let submitter = Submitter::new(store.clone(), Keyspace::default());
        let (group, records) = submitter
            .submit_batch("u1", vec![request("e1"), request("e1")])
            .await
            .unwrap();
        let ids: Vec<String> = records.iter().map(|r| r.task_id().to_string()).collect();
        assert_eq!(group.task_ids().await.unwrap(), ids);
        assert_eq!(
            records[0].task_group_id().await.unwrap().as_deref(),
            Some(group.group_id())
        );
        assert!(submitter.delete_group(group.group_id()).await.unwrap());
        assert!(matches!(
            submitter.delete_group(group.group_id()).await,
            Err(Error::UnknownGroup { .. })
        ));
    }
}
