//! End-to-end forwarder scenarios against a scripted execution backend.
//!
//! Each test wires a real dispatcher and in-memory store to a
//! [`ScriptedBackend`] whose availability, probe answers and submission
//! errors are controlled by the test.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

use taskrelay::dispatch::TaskPublisher;
use taskrelay::forwarder::{
    BackendError, ConnectionInfo, DispatchSource, ExecutionBackend, Forwarder, ForwarderConfig,
    ForwarderState, PendingResult, QueueSource, StaticGeoLocator, StatusInfo,
};
use taskrelay::queue::EndpointQueue;
use taskrelay::status_log::{EndpointMetadata, EndpointStatusLog};
use taskrelay::store::{MemoryStore, PublishOutcome, SharedStore};
use taskrelay::submit::{SubmitRequest, Submitter};
use taskrelay::task::{fields, NewTask, TaskRecord, TaskStatus, DEFAULT_TASK_TTL};
use taskrelay::{Keyspace, TaskOutcome};

// ─── Scripted Backend ───────────────────────────────────────────────────────

#[derive(Default)]
struct ScriptedBackend {
    online: AtomicBool,
    probe_busy: AtomicBool,
    submit_errors: Mutex<VecDeque<BackendError>>,
    rejected_payload: Option<Vec<u8>>,
    lose_outcomes: AtomicUsize,
    submitted: Mutex<Vec<String>>,
    probes: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedBackend {
    fn online() -> Self {
        let backend = Self::default();
        backend.online.store(true, Ordering::SeqCst);
        backend
    }

    fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::online()
        }
    }

    fn rejecting(payload: &[u8]) -> Self {
        Self {
            rejected_payload: Some(payload.to_vec()),
            ..Self::online()
        }
    }

    fn submitted(&self) -> Vec<String> {
        self.submitted.lock().clone()
    }
}

#[async_trait]
impl ExecutionBackend for ScriptedBackend {
    async fn submit(&self, task_id: &str, payload: Vec<u8>) -> Result<PendingResult, BackendError> {
        if let Some(err) = self.submit_errors.lock().pop_front() {
            return Err(err);
        }
        if self.rejected_payload.as_deref() == Some(payload.as_slice()) {
            return Err(BackendError::Rejected("payload refused".into()));
        }
        self.submitted.lock().push(task_id.to_string());
        let gate = self.gate.clone();
        let lost = self
            .lose_outcomes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Ok(Box::pin(async move {
            if let Some(gate) = gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            if lost {
                Err(BackendError::Lost("connection dropped".into()))
            } else if payload == b"fail" {
                Ok(TaskOutcome::failure("remote exception"))
            } else {
                Ok(TaskOutcome::Success(payload.into_iter().rev().collect()))
            }
        }))
    }

    async fn request_status_info(&self) -> Result<StatusInfo, BackendError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.probe_busy.load(Ordering::SeqCst) {
            return Err(BackendError::Busy("all workers occupied".into()));
        }
        if !self.online.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("no endpoint".into()));
        }
        let mut metrics = Map::new();
        metrics.insert("total_core_hrs".into(), json!(0.5));
        Ok(StatusInfo { metrics })
    }

    async fn wait_for_endpoint(&self) {
        while !self.online.load(Ordering::SeqCst) || self.probe_busy.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            address: "127.0.0.1:0".into(),
        }
    }
}

// ─── Harness ────────────────────────────────────────────────────────────────

const WAIT: Duration = Duration::from_secs(5);

fn fast_config() -> ForwarderConfig {
    ForwarderConfig {
        heartbeat_threshold: Duration::from_millis(50),
        retry_delay: Duration::from_millis(10),
        shutdown_grace: Duration::from_secs(1),
        max_submit_attempts: 5,
    }
}

struct Running {
    shutdown: tokio_util::sync::CancellationToken,
    state: watch::Receiver<ForwarderState>,
    handle: JoinHandle<taskrelay::Result<()>>,
}

impl Running {
    async fn reach(&mut self, wanted: ForwarderState) {
        tokio::time::timeout(WAIT, self.state.wait_for(|s| *s == wanted))
            .await
            .expect("state not reached")
            .expect("forwarder dropped");
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(WAIT, self.handle)
            .await
            .expect("forwarder did not stop")
            .unwrap()
            .unwrap();
    }
}

async fn start(
    store: &SharedStore,
    keys: &Keyspace,
    endpoint: &str,
    backend: Arc<ScriptedBackend>,
) -> Running {
    start_with(store, keys, endpoint, backend, fast_config()).await
}

async fn start_with(
    store: &SharedStore,
    keys: &Keyspace,
    endpoint: &str,
    backend: Arc<ScriptedBackend>,
    config: ForwarderConfig,
) -> Running {
    let source = DispatchSource::connect(store.clone(), keys.clone(), endpoint).await.unwrap();
    let forwarder = Forwarder::new(endpoint, source, backend, store.clone(), keys.clone())
        .with_config(config);
    let shutdown = forwarder.shutdown_token();
    let state = forwarder.state();
    let handle = tokio::spawn(forwarder.run());
    Running {
        shutdown,
        state,
        handle,
    }
}

async fn wait_for_status(record: &TaskRecord, wanted: TaskStatus) {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if record.status().await.unwrap() == wanted {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "task never reached {wanted}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn submit(submitter: &Submitter, endpoint: &str, payload: &[u8]) -> TaskRecord {
    submitter
        .submit(SubmitRequest::new("user", "fn", endpoint, payload.to_vec()))
        .await
        .unwrap()
}

fn setup() -> (SharedStore, Keyspace, Submitter) {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let keys = Keyspace::default();
    let submitter = Submitter::new(store.clone(), keys.clone());
    (store, keys, submitter)
}

// ─── Scenarios ──────────────────────────────────────────────────────────────

mod scenario_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn buffered_task_is_delivered_when_forwarder_starts() {
        let (store, keys, submitter) = setup();
        let publisher = TaskPublisher::new(store.clone(), keys.clone());

        let task = submit(&submitter, "E1", b"abc").await;
        assert_eq!(task.status().await.unwrap(), TaskStatus::WaitingForEp);
        assert_eq!(publisher.backlog("E1").await.unwrap(), vec![task.task_id().to_string()]);

        let backend = Arc::new(ScriptedBackend::online());
        let running = start(&store, &keys, "E1", backend.clone()).await;
        wait_for_status(&task, TaskStatus::Success).await;

        assert_eq!(task.result().await.unwrap(), Some(b"cba".to_vec()));
        assert_eq!(backend.submitted(), vec![task.task_id().to_string()]);
        assert_eq!(publisher.backlog_len("E1").await.unwrap(), 0);
        running.stop().await;
    }

    #[tokio::test]
    async fn live_tasks_are_delivered_in_order_without_buffering() {
        let (store, keys, _submitter) = setup();
        let publisher = TaskPublisher::new(store.clone(), keys.clone());
        let backend = Arc::new(ScriptedBackend::online());
        let mut running = start(&store, &keys, "E2", backend.clone()).await;
        running.reach(ForwarderState::TaskLoop).await;

        let mut ids = Vec::new();
        for payload in [b"1", b"2", b"3"] {
            let record = TaskRecord::create_or_attach(
                store.clone(),
                &keys,
                TaskRecord::new_id(),
                NewTask::new().payload(payload.to_vec()),
                DEFAULT_TASK_TTL,
            )
            .await
            .unwrap();
            assert_eq!(publisher.put("E2", &record).await.unwrap(), PublishOutcome::Published(1));
            assert_eq!(publisher.backlog_len("E2").await.unwrap(), 0);
            ids.push(record);
        }
        for record in &ids {
            wait_for_status(record, TaskStatus::Success).await;
        }
        let expected: Vec<String> = ids.iter().map(|r| r.task_id().to_string()).collect();
        assert_eq!(backend.submitted(), expected);
        running.stop().await;
    }

    #[tokio::test]
    async fn lost_outcome_runs_the_task_again() {
        let (store, keys, submitter) = setup();
        let backend = Arc::new(ScriptedBackend::online());
        backend.lose_outcomes.store(1, Ordering::SeqCst);
        let mut running = start(&store, &keys, "E12", backend.clone()).await;
        running.reach(ForwarderState::TaskLoop).await;

        let task = submit(&submitter, "E12", b"again").await;
        wait_for_status(&task, TaskStatus::Success).await;
        assert_eq!(task.result().await.unwrap(), Some(b"niaga".to_vec()));
        assert_eq!(task.exception().await.unwrap(), None);
        assert_eq!(
            backend.submitted(),
            vec![task.task_id().to_string(), task.task_id().to_string()]
        );
        running.stop().await;
    }

    #[tokio::test]
    async fn busy_probe_parks_new_work_until_endpoint_returns() {
        let (store, keys, submitter) = setup();
        let publisher = TaskPublisher::new(store.clone(), keys.clone());
        let backend = Arc::new(ScriptedBackend::online());
        let mut running = start(&store, &keys, "E3", backend.clone()).await;
        running.reach(ForwarderState::TaskLoop).await;

        backend.probe_busy.store(true, Ordering::SeqCst);
        running.reach(ForwarderState::AwaitEndpoint).await;

        let task = submit(&submitter, "E3", b"xyz").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(task.status().await.unwrap(), TaskStatus::WaitingForEp);
        assert_eq!(publisher.backlog("E3").await.unwrap(), vec![task.task_id().to_string()]);
        assert!(backend.submitted().is_empty());

        backend.probe_busy.store(false, Ordering::SeqCst);
        wait_for_status(&task, TaskStatus::Success).await;
        running.stop().await;
    }
}

// ─── Loop Behaviour ─────────────────────────────────────────────────────────

mod loop_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn busy_submission_requeues_task_at_front() {
        let (store, keys, submitter) = setup();
        let backend = Arc::new(ScriptedBackend::online());
        backend
            .submit_errors
            .lock()
            .push_back(BackendError::Busy("full".into()));

        let first = submit(&submitter, "E4", b"first").await;
        let second = submit(&submitter, "E4", b"second").await;
        let running = start(&store, &keys, "E4", backend.clone()).await;

        wait_for_status(&first, TaskStatus::Success).await;
        wait_for_status(&second, TaskStatus::Success).await;
        assert_eq!(
            backend.submitted(),
            vec![first.task_id().to_string(), second.task_id().to_string()]
        );
        running.stop().await;
    }

    #[tokio::test]
    async fn rejected_submission_is_retried_without_leaving_loop() {
        let (store, keys, submitter) = setup();
        let backend = Arc::new(ScriptedBackend::online());
        backend
            .submit_errors
            .lock()
            .push_back(BackendError::Rejected("transient".into()));

        let task = submit(&submitter, "E5", b"payload").await;
        let mut running = start(&store, &keys, "E5", backend.clone()).await;
        running.reach(ForwarderState::TaskLoop).await;

        wait_for_status(&task, TaskStatus::Success).await;
        assert_eq!(*running.state.borrow(), ForwarderState::TaskLoop);
        running.stop().await;
    }

    #[tokio::test]
    async fn always_rejected_task_does_not_block_later_work() {
        let (store, keys, submitter) = setup();
        let backend = Arc::new(ScriptedBackend::rejecting(b"poison"));
        let config = ForwarderConfig {
            retry_delay: Duration::from_millis(200),
            max_submit_attempts: 3,
            ..fast_config()
        };

        let poison = submit(&submitter, "E13", b"poison").await;
        let healthy = submit(&submitter, "E13", b"healthy").await;
        let running = start_with(&store, &keys, "E13", backend.clone(), config).await;

        wait_for_status(&healthy, TaskStatus::Success).await;
        assert_eq!(poison.status().await.unwrap(), TaskStatus::WaitingForEp);

        wait_for_status(&poison, TaskStatus::Failed).await;
        let exception = poison.exception().await.unwrap().unwrap();
        assert!(String::from_utf8_lossy(&exception).contains("rejected 3 times"));
        assert_eq!(backend.submitted(), vec![healthy.task_id().to_string()]);
        running.stop().await;
    }

    #[tokio::test]
    async fn remote_failure_marks_task_failed() {
        let (store, keys, submitter) = setup();
        let backend = Arc::new(ScriptedBackend::online());
        let task = submit(&submitter, "E6", b"fail").await;
        let running = start(&store, &keys, "E6", backend).await;

        wait_for_status(&task, TaskStatus::Failed).await;
        assert_eq!(task.exception().await.unwrap(), Some(b"remote exception".to_vec()));
        assert_eq!(task.result().await.unwrap(), None);
        running.stop().await;
    }

    #[tokio::test]
    async fn duplicate_delivery_is_not_resubmitted_while_in_flight() {
        let (store, keys, submitter) = setup();
        let publisher = TaskPublisher::new(store.clone(), keys.clone());
        let gate = Arc::new(Semaphore::new(0));
        let backend = Arc::new(ScriptedBackend::gated(gate.clone()));
        let mut running = start(&store, &keys, "E7", backend.clone()).await;
        running.reach(ForwarderState::TaskLoop).await;

        let task = submit(&submitter, "E7", b"once").await;
        wait_for_status(&task, TaskStatus::Running).await;
        publisher.put("E7", &task).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        gate.add_permits(1);
        wait_for_status(&task, TaskStatus::Success).await;
        assert_eq!(backend.submitted(), vec![task.task_id().to_string()]);
        running.stop().await;
    }

    #[tokio::test]
    async fn idle_probe_records_heartbeat() {
        let (store, keys, _submitter) = setup();
        let backend = Arc::new(ScriptedBackend::online());
        let running = start(&store, &keys, "E8", backend.clone()).await;

        let log = EndpointStatusLog::new(store.clone(), keys.clone());
        let deadline = tokio::time::Instant::now() + WAIT;
        while log.read_recent("E8", 1).await.unwrap().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "no heartbeat recorded");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(backend.probes.load(Ordering::SeqCst) >= 1);
        assert!(log.liveness("E8", Duration::from_secs(10)).await.unwrap());
        assert!(log.global_compute_hours().await.unwrap() >= 0.5);
        running.stop().await;
    }

    #[tokio::test]
    async fn shutdown_returns_unstarted_work_and_stops() {
        let (store, keys, submitter) = setup();
        let publisher = TaskPublisher::new(store.clone(), keys.clone());
        let backend = Arc::new(ScriptedBackend::default());
        let mut running = start(&store, &keys, "E9", backend).await;
        running.reach(ForwarderState::AwaitEndpoint).await;

        let task = submit(&submitter, "E9", b"later").await;
        let mut state = running.state.clone();
        running.stop().await;
        assert_eq!(*state.borrow_and_update(), ForwarderState::Stopped);
        assert_eq!(publisher.backlog("E9").await.unwrap(), vec![task.task_id().to_string()]);
    }

    #[tokio::test]
    async fn geo_metadata_is_recorded_at_startup() {
        let (store, keys, _submitter) = setup();
        let source = DispatchSource::connect(store.clone(), keys.clone(), "E10").await.unwrap();
        let locator = StaticGeoLocator::new(EndpointMetadata {
            city: Some("Chicago".into()),
            ..EndpointMetadata::default()
        });
        let forwarder = Forwarder::new("E10", source, Arc::new(ScriptedBackend::default()), store.clone(), keys.clone())
            .with_config(fast_config())
            .with_geo(Arc::new(locator), "192.0.2.10");
        let shutdown = forwarder.shutdown_token();
        let mut state = forwarder.state();
        let handle = tokio::spawn(forwarder.run());
        tokio::time::timeout(WAIT, state.wait_for(|s| *s == ForwarderState::AwaitEndpoint))
            .await
            .unwrap()
            .unwrap();

        let metadata = EndpointStatusLog::new(store.clone(), keys.clone()).metadata("E10").await.unwrap();
        assert_eq!(metadata.ip_address.as_deref(), Some("192.0.2.10"));
        assert_eq!(metadata.city.as_deref(), Some("Chicago"));
        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }
}

// ─── Direct Queue Source ────────────────────────────────────────────────────

mod queue_source_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn queued(store: &SharedStore, keys: &Keyspace, queue: &EndpointQueue, task_id: &str) -> TaskRecord {
        let record = TaskRecord::create_or_attach(
            store.clone(),
            keys,
            task_id,
            NewTask::new().status(TaskStatus::WaitingForEp),
            DEFAULT_TASK_TTL,
        )
        .await
        .unwrap();
        queue.put(task_id, fields::PAYLOAD, b"direct").await.unwrap();
        record
    }

    #[tokio::test]
    async fn lost_outcome_is_requeued_on_the_queue() {
        let (store, keys, _submitter) = setup();
        let queue = EndpointQueue::new(store.clone(), keys.clone(), "E14");
        let record = queued(&store, &keys, &queue, "q2").await;

        let backend = Arc::new(ScriptedBackend::online());
        backend.lose_outcomes.store(1, Ordering::SeqCst);
        let forwarder = Forwarder::new("E14", QueueSource::new(queue.clone()), backend.clone(), store.clone(), keys.clone())
            .with_config(fast_config());
        let shutdown = forwarder.shutdown_token();
        let handle = tokio::spawn(forwarder.run());

        wait_for_status(&record, TaskStatus::Success).await;
        assert_eq!(backend.submitted(), vec!["q2".to_string(), "q2".to_string()]);
        assert!(queue.is_empty().await.unwrap());
        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_during_a_long_pull_keeps_every_id() {
        let (store, keys, _submitter) = setup();
        let queue = EndpointQueue::new(store.clone(), keys.clone(), "E15");
        let config = ForwarderConfig {
            heartbeat_threshold: Duration::from_secs(30),
            ..fast_config()
        };
        let forwarder = Forwarder::new(
            "E15",
            QueueSource::new(queue.clone()),
            Arc::new(ScriptedBackend::online()),
            store.clone(),
            keys.clone(),
        )
        .with_config(config);
        let shutdown = forwarder.shutdown_token();
        let mut state = forwarder.state();
        let handle = tokio::spawn(forwarder.run());
        tokio::time::timeout(WAIT, state.wait_for(|s| *s == ForwarderState::TaskLoop))
            .await
            .unwrap()
            .unwrap();

        let record = queued(&store, &keys, &queue, "q3").await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("pull did not observe shutdown")
            .unwrap()
            .unwrap();

        // Either the forwarder took it before stopping or it is still queued.
        let status = record.status().await.unwrap();
        let still_queued = queue.len().await.unwrap();
        assert!(
            status == TaskStatus::Success || still_queued == 1,
            "task lost: status {status}, queued {still_queued}"
        );
        if status != TaskStatus::Success {
            assert_eq!(status, TaskStatus::WaitingForEp);
        }
    }

    #[tokio::test]
    async fn queue_source_feeds_forwarder() {
        let (store, keys, _submitter) = setup();
        let record = TaskRecord::create_or_attach(
            store.clone(),
            &keys,
            "q1",
            NewTask::new().status(TaskStatus::WaitingForEp),
            DEFAULT_TASK_TTL,
        )
        .await
        .unwrap();
        let queue = EndpointQueue::new(store.clone(), keys.clone(), "E11");
        queue.put("q1", fields::PAYLOAD, b"direct").await.unwrap();

        let backend = Arc::new(ScriptedBackend::online());
        let forwarder = Forwarder::new("E11", QueueSource::new(queue.clone()), backend, store.clone(), keys.clone())
            .with_config(fast_config());
        let shutdown = forwarder.shutdown_token();
        let handle = tokio::spawn(forwarder.run());

        wait_for_status(&record, TaskStatus::Success).await;
        assert_eq!(record.result().await.unwrap(), Some(b"tcerid".to_vec()));
        assert!(queue.is_empty().await.unwrap());
        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }
}
