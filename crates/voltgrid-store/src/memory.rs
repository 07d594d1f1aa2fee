//! MemoryStore — an in-process [`FleetStore`] with the same semantics as the
//! production adapter.
//!
//! Every cross-crate test drives the real control-plane code against this
//! implementation. Counts are derived from the rows it holds, so the
//! pre-filtered counters behave like the task service's.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Duration;

use voltgrid_state::{
    Clock, LogRecord, SystemClock, Task, TaskCounts, TaskStatus, Worker, WorkerMetadata,
    WorkerStatus,
};

use crate::error::{StoreError, StoreResult};
use crate::FleetStore;

#[derive(Default)]
struct Inner {
    workers: HashMap<String, Worker>,
    tasks: HashMap<String, Task>,
    logs: Vec<LogRecord>,
    log_batches: u64,
    log_failures_remaining: u32,
    connectivity_ok: bool,
}

/// In-process store for tests and local development.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                connectivity_ok: true,
                ..Default::default()
            }),
            clock,
        }
    }

    // ── Test helpers ───────────────────────────────────────────────

    pub fn insert_worker(&self, worker: Worker) {
        self.inner
            .lock()
            .unwrap()
            .workers
            .insert(worker.id.clone(), worker);
    }

    pub fn insert_task(&self, task: Task) {
        self.inner.lock().unwrap().tasks.insert(task.id.clone(), task);
    }

    pub fn worker(&self, id: &str) -> Option<Worker> {
        self.inner.lock().unwrap().workers.get(id).cloned()
    }

    pub fn task(&self, id: &str) -> Option<Task> {
        self.inner.lock().unwrap().tasks.get(id).cloned()
    }

    pub fn submitted_logs(&self) -> Vec<LogRecord> {
        self.inner.lock().unwrap().logs.clone()
    }

    pub fn log_batches_submitted(&self) -> u64 {
        self.inner.lock().unwrap().log_batches
    }

    /// Make the next `n` log batch submissions fail with a transient error.
    pub fn fail_log_batches(&self, n: u32) {
        self.inner.lock().unwrap().log_failures_remaining = n;
    }

    /// Toggle the connectivity probe (false simulates a missing RPC).
    pub fn set_connectivity(&self, ok: bool) {
        self.inner.lock().unwrap().connectivity_ok = ok;
    }

    fn flip_task(task: &mut Task, reason: &str) {
        task.attempts += 1;
        task.worker_id = None;
        task.generation_started_at = None;
        task.generation_processed_at = None;
        task.error_message = Some(reason.to_string());
        task.status = if task.attempts >= 3 {
            TaskStatus::Failed
        } else {
            TaskStatus::Queued
        };
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FleetStore for MemoryStore {
    async fn count_available_tasks(&self, include_active_claims: bool) -> StoreResult<TaskCounts> {
        let inner = self.inner.lock().unwrap();
        let queued_only = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued && !t.is_parent())
            .count() as u64;
        let active_only = inner
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::InProgress && t.worker_id.is_some() && !t.is_parent()
            })
            .count() as u64;
        if include_active_claims {
            Ok(TaskCounts {
                queued_only,
                active_only,
                total: queued_only + active_only,
            })
        } else {
            Ok(TaskCounts {
                queued_only,
                active_only: 0,
                total: queued_only,
            })
        }
    }

    async fn claim_task(&self, worker_id: &str) -> StoreResult<Option<Task>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        match inner.workers.get(worker_id) {
            Some(worker) if worker.status == WorkerStatus::Active => {}
            Some(_) => return Ok(None),
            None => return Err(StoreError::NotFound(format!("worker {worker_id}"))),
        }

        // FIFO over eligible queued tasks.
        let next_id = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued && !t.is_parent())
            .min_by_key(|t| t.created_at)
            .map(|t| t.id.clone());

        let Some(task_id) = next_id else {
            return Ok(None);
        };
        let task = inner.tasks.get_mut(&task_id).expect("task just selected");
        task.status = TaskStatus::InProgress;
        task.worker_id = Some(worker_id.to_string());
        task.generation_started_at = Some(now);
        task.updated_at = now;
        Ok(Some(task.clone()))
    }

    async fn mark_task_complete(
        &self,
        task_id: &str,
        result: serde_json::Value,
    ) -> StoreResult<()> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound(format!("task {task_id}")))?;
        task.status = TaskStatus::Complete;
        task.result_data = Some(result);
        task.generation_processed_at = Some(now);
        task.updated_at = now;
        Ok(())
    }

    async fn mark_task_failed(&self, task_id: &str, error: &str) -> StoreResult<()> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound(format!("task {task_id}")))?;
        Self::flip_task(task, error);
        task.updated_at = now;
        Ok(())
    }

    async fn reset_orphaned_tasks(&self, worker_ids: &[String]) -> StoreResult<u64> {
        if worker_ids.is_empty() {
            return Ok(0);
        }
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        let mut touched = 0u64;
        for task in inner.tasks.values_mut() {
            let assigned = task
                .worker_id
                .as_ref()
                .is_some_and(|id| worker_ids.contains(id));
            if task.status == TaskStatus::InProgress
                && assigned
                && task.attempts < 3
                && !task.is_parent()
            {
                Self::flip_task(task, "Reset - orphaned from failed worker");
                task.updated_at = now;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn reset_unassigned_orphaned_tasks(&self, older_than: Duration) -> StoreResult<u64> {
        let now = self.clock.now();
        let cutoff = now - older_than;
        let mut inner = self.inner.lock().unwrap();
        let mut touched = 0u64;
        for task in inner.tasks.values_mut() {
            let stuck = task
                .generation_started_at
                .is_some_and(|started| started < cutoff);
            if task.status == TaskStatus::InProgress
                && task.worker_id.is_none()
                && stuck
                && task.attempts < 3
                && !task.is_parent()
            {
                Self::flip_task(task, "Reset - stuck in progress with no worker assigned");
                task.updated_at = now;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn register_worker(
        &self,
        id: &str,
        instance_type: &str,
        metadata: WorkerMetadata,
    ) -> StoreResult<()> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        if inner.workers.contains_key(id) {
            // Primary-key uniqueness: a duplicate registration must never
            // produce a second pod request.
            return Err(StoreError::Fatal(format!("worker {id} already registered")));
        }
        let mut metadata = metadata;
        metadata.orchestrator_status = Some(WorkerStatus::Spawning.as_str().to_string());
        inner.workers.insert(
            id.to_string(),
            Worker {
                id: id.to_string(),
                instance_type: instance_type.to_string(),
                status: WorkerStatus::Spawning,
                created_at: now,
                last_heartbeat: None,
                metadata,
            },
        );
        Ok(())
    }

    async fn update_worker_status(
        &self,
        id: &str,
        status: WorkerStatus,
        patch: WorkerMetadata,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let worker = inner
            .workers
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("worker {id}")))?;
        worker.status = status;
        worker.metadata.orchestrator_status = Some(status.as_str().to_string());
        worker.metadata.merge(patch);
        Ok(())
    }

    async fn update_worker(&self, id: &str, patch: WorkerMetadata) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let worker = inner
            .workers
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("worker {id}")))?;
        worker.metadata.merge(patch);
        Ok(())
    }

    async fn get_worker(&self, id: &str) -> StoreResult<Option<Worker>> {
        Ok(self.inner.lock().unwrap().workers.get(id).cloned())
    }

    async fn list_workers(&self, statuses: &[WorkerStatus]) -> StoreResult<Vec<Worker>> {
        let inner = self.inner.lock().unwrap();
        let mut workers: Vec<Worker> = inner
            .workers
            .values()
            .filter(|w| statuses.is_empty() || statuses.contains(&w.status))
            .cloned()
            .collect();
        workers.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(workers)
    }

    async fn has_running_tasks(&self, worker_id: &str) -> StoreResult<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.tasks.values().any(|t| {
            t.status == TaskStatus::InProgress && t.worker_id.as_deref() == Some(worker_id)
        }))
    }

    async fn running_tasks_for_worker(&self, worker_id: &str) -> StoreResult<Vec<Task>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::InProgress && t.worker_id.as_deref() == Some(worker_id)
            })
            .cloned()
            .collect())
    }

    async fn update_worker_heartbeat(
        &self,
        worker_id: &str,
        vram_total_mb: Option<u64>,
        vram_used_mb: Option<u64>,
    ) -> StoreResult<()> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        let worker = inner
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| StoreError::NotFound(format!("worker {worker_id}")))?;
        worker.last_heartbeat = Some(now);
        if let Some(total) = vram_total_mb {
            worker.metadata.vram_total_mb = Some(total);
            worker.metadata.vram_used_mb = Some(vram_used_mb.unwrap_or(0));
            worker.metadata.vram_timestamp = Some(now.timestamp() as f64);
        }
        Ok(())
    }

    async fn heartbeat_with_logs(
        &self,
        worker_id: &str,
        vram_total_mb: Option<u64>,
        vram_used_mb: Option<u64>,
        logs: &[LogRecord],
    ) -> StoreResult<()> {
        self.update_worker_heartbeat(worker_id, vram_total_mb, vram_used_mb)
            .await?;
        self.insert_logs_batch(logs).await
    }

    async fn insert_logs_batch(&self, records: &[LogRecord]) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.log_failures_remaining > 0 {
            inner.log_failures_remaining -= 1;
            return Err(StoreError::Transient("log store unavailable".into()));
        }
        inner.logs.extend_from_slice(records);
        inner.log_batches += 1;
        Ok(())
    }

    async fn cleanup_old_logs(&self, retention_hours: u32) -> StoreResult<u64> {
        let cutoff = self.clock.now() - Duration::hours(retention_hours as i64);
        let mut inner = self.inner.lock().unwrap();
        let before = inner.logs.len();
        inner.logs.retain(|record| record.timestamp >= cutoff);
        Ok((before - inner.logs.len()) as u64)
    }

    async fn test_connectivity(&self) -> StoreResult<()> {
        if self.inner.lock().unwrap().connectivity_ok {
            Ok(())
        } else {
            Err(StoreError::Fatal("log insert rpc missing".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use voltgrid_state::FixedClock;

    fn clock() -> Arc<FixedClock> {
        Arc::new(FixedClock::new(Utc.timestamp_opt(1_000_000, 0).unwrap()))
    }

    fn make_worker(id: &str, status: WorkerStatus) -> Worker {
        Worker {
            id: id.to_string(),
            instance_type: "NVIDIA GeForce RTX 4090".to_string(),
            status,
            created_at: Utc.timestamp_opt(999_000, 0).unwrap(),
            last_heartbeat: None,
            metadata: WorkerMetadata::default(),
        }
    }

    fn make_task(id: &str, status: TaskStatus, worker: Option<&str>, attempts: u32) -> Task {
        Task {
            id: id.to_string(),
            status,
            attempts,
            worker_id: worker.map(String::from),
            generation_started_at: matches!(status, TaskStatus::InProgress)
                .then(|| Utc.timestamp_opt(999_500, 0).unwrap()),
            generation_processed_at: None,
            task_type: "single_image".to_string(),
            params: serde_json::json!({}),
            result_data: None,
            error_message: None,
            output_location: None,
            created_at: Utc.timestamp_opt(999_000, 0).unwrap(),
            updated_at: Utc.timestamp_opt(999_000, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn counts_split_queued_and_active() {
        let store = MemoryStore::with_clock(clock());
        store.insert_task(make_task("t-1", TaskStatus::Queued, None, 0));
        store.insert_task(make_task("t-2", TaskStatus::Queued, None, 0));
        store.insert_task(make_task("t-3", TaskStatus::InProgress, Some("gpu-1"), 0));
        store.insert_task(make_task("t-4", TaskStatus::Complete, Some("gpu-1"), 0));

        let counts = store.count_available_tasks(true).await.unwrap();
        assert_eq!(counts.queued_only, 2);
        assert_eq!(counts.active_only, 1);
        assert_eq!(counts.total, 3);

        let queued = store.count_available_tasks(false).await.unwrap();
        assert_eq!(queued.total, 2);
    }

    #[tokio::test]
    async fn counts_exclude_parent_tasks() {
        let store = MemoryStore::with_clock(clock());
        let mut parent = make_task("t-p", TaskStatus::Queued, None, 0);
        parent.task_type = "travel_orchestrator".into();
        store.insert_task(parent);
        store.insert_task(make_task("t-1", TaskStatus::Queued, None, 0));

        let counts = store.count_available_tasks(true).await.unwrap();
        assert_eq!(counts.queued_only, 1);
    }

    #[tokio::test]
    async fn claim_is_fifo_and_stamps_the_task() {
        let store = MemoryStore::with_clock(clock());
        store.insert_worker(make_worker("gpu-1", WorkerStatus::Active));
        let mut older = make_task("t-old", TaskStatus::Queued, None, 0);
        older.created_at = Utc.timestamp_opt(998_000, 0).unwrap();
        store.insert_task(older);
        store.insert_task(make_task("t-new", TaskStatus::Queued, None, 0));

        let claimed = store.claim_task("gpu-1").await.unwrap().unwrap();
        assert_eq!(claimed.id, "t-old");
        assert_eq!(claimed.status, TaskStatus::InProgress);
        assert_eq!(claimed.worker_id.as_deref(), Some("gpu-1"));
        assert!(claimed.generation_started_at.is_some());
    }

    #[tokio::test]
    async fn terminating_worker_never_receives_a_claim() {
        let store = MemoryStore::with_clock(clock());
        store.insert_worker(make_worker("gpu-1", WorkerStatus::Terminating));
        store.insert_task(make_task("t-1", TaskStatus::Queued, None, 0));

        assert!(store.claim_task("gpu-1").await.unwrap().is_none());
        assert_eq!(store.task("t-1").unwrap().status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn mark_task_failed_requeues_then_fails_at_cap() {
        let store = MemoryStore::with_clock(clock());
        store.insert_task(make_task("t-1", TaskStatus::InProgress, Some("gpu-1"), 1));

        store.mark_task_failed("t-1", "cuda oom").await.unwrap();
        let task = store.task("t-1").unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.attempts, 2);
        assert!(task.worker_id.is_none());

        store.insert_task(make_task("t-2", TaskStatus::InProgress, Some("gpu-1"), 2));
        store.mark_task_failed("t-2", "cuda oom").await.unwrap();
        let task = store.task("t-2").unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 3);
    }

    #[tokio::test]
    async fn reset_orphans_excludes_parents_and_capped_attempts() {
        let store = MemoryStore::with_clock(clock());
        store.insert_task(make_task("t-1", TaskStatus::InProgress, Some("gpu-1"), 0));
        store.insert_task(make_task("t-2", TaskStatus::InProgress, Some("gpu-1"), 3));
        let mut parent = make_task("t-p", TaskStatus::InProgress, Some("gpu-1"), 0);
        parent.task_type = "travel_orchestrator".into();
        store.insert_task(parent);
        store.insert_task(make_task("t-3", TaskStatus::InProgress, Some("gpu-2"), 0));

        let count = store
            .reset_orphaned_tasks(&["gpu-1".to_string()])
            .await
            .unwrap();
        assert_eq!(count, 1);

        let reset = store.task("t-1").unwrap();
        assert_eq!(reset.status, TaskStatus::Queued);
        assert_eq!(reset.attempts, 1);
        assert!(reset.worker_id.is_none());
        // Capped task untouched.
        assert_eq!(store.task("t-2").unwrap().status, TaskStatus::InProgress);
        // Parent untouched.
        assert_eq!(store.task("t-p").unwrap().status, TaskStatus::InProgress);
        // Other worker untouched.
        assert_eq!(
            store.task("t-3").unwrap().worker_id.as_deref(),
            Some("gpu-2")
        );
    }

    #[tokio::test]
    async fn reset_at_two_attempts_moves_to_failed() {
        let store = MemoryStore::with_clock(clock());
        store.insert_task(make_task("t-1", TaskStatus::InProgress, Some("gpu-1"), 2));

        let count = store
            .reset_orphaned_tasks(&["gpu-1".to_string()])
            .await
            .unwrap();
        assert_eq!(count, 1);
        let task = store.task("t-1").unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 3);
    }

    #[tokio::test]
    async fn no_task_left_in_progress_without_worker() {
        let store = MemoryStore::with_clock(clock());
        store.insert_task(make_task("t-1", TaskStatus::InProgress, Some("gpu-1"), 0));
        store.reset_orphaned_tasks(&["gpu-1".to_string()]).await.unwrap();

        for task in [store.task("t-1").unwrap()] {
            if task.status == TaskStatus::InProgress {
                assert!(task.worker_id.is_some());
            }
        }
    }

    #[tokio::test]
    async fn unassigned_orphans_reset_after_threshold() {
        let clock = clock();
        let store = MemoryStore::with_clock(clock.clone());
        let mut stuck = make_task("t-1", TaskStatus::InProgress, None, 0);
        stuck.generation_started_at = Some(Utc.timestamp_opt(999_000, 0).unwrap());
        store.insert_task(stuck);

        // Not yet past the threshold.
        let count = store
            .reset_unassigned_orphaned_tasks(Duration::minutes(60))
            .await
            .unwrap();
        assert_eq!(count, 0);

        let count = store
            .reset_unassigned_orphaned_tasks(Duration::minutes(15))
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(store.task("t-1").unwrap().status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn register_worker_is_unique_and_spawning() {
        let store = MemoryStore::with_clock(clock());
        store
            .register_worker("gpu-1", "RTX 4090", WorkerMetadata::default())
            .await
            .unwrap();
        let worker = store.worker("gpu-1").unwrap();
        assert_eq!(worker.status, WorkerStatus::Spawning);
        assert_eq!(
            worker.metadata.orchestrator_status.as_deref(),
            Some("spawning")
        );

        let err = store
            .register_worker("gpu-1", "RTX 4090", WorkerMetadata::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Fatal(_)));
    }

    #[tokio::test]
    async fn update_worker_status_mirrors_and_merges() {
        let store = MemoryStore::with_clock(clock());
        store.insert_worker(make_worker("gpu-1", WorkerStatus::Spawning));
        store
            .update_worker_status(
                "gpu-1",
                WorkerStatus::Error,
                WorkerMetadata {
                    error_reason: Some("Spawning timeout".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let worker = store.worker("gpu-1").unwrap();
        assert_eq!(worker.status, WorkerStatus::Error);
        assert_eq!(worker.metadata.orchestrator_status.as_deref(), Some("error"));
        assert_eq!(
            worker.metadata.error_reason.as_deref(),
            Some("Spawning timeout")
        );
    }

    #[tokio::test]
    async fn list_workers_filters_and_orders_newest_first() {
        let store = MemoryStore::with_clock(clock());
        let mut old = make_worker("gpu-old", WorkerStatus::Active);
        old.created_at = Utc.timestamp_opt(900_000, 0).unwrap();
        store.insert_worker(old);
        store.insert_worker(make_worker("gpu-new", WorkerStatus::Active));
        store.insert_worker(make_worker("gpu-dead", WorkerStatus::Terminated));

        let active = store.list_workers(&[WorkerStatus::Active]).await.unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].id, "gpu-new");

        let all = store.list_workers(&[]).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn heartbeat_updates_vram_fields() {
        let store = MemoryStore::with_clock(clock());
        store.insert_worker(make_worker("gpu-1", WorkerStatus::Active));
        store
            .update_worker_heartbeat("gpu-1", Some(24_000), Some(8_000))
            .await
            .unwrap();

        let worker = store.worker("gpu-1").unwrap();
        assert!(worker.last_heartbeat.is_some());
        assert_eq!(worker.metadata.vram_total_mb, Some(24_000));
        assert_eq!(worker.metadata.vram_used_mb, Some(8_000));
    }

    #[tokio::test]
    async fn heartbeat_with_logs_does_both() {
        let store = MemoryStore::with_clock(clock());
        store.insert_worker(make_worker("gpu-1", WorkerStatus::Active));
        let record = LogRecord {
            timestamp: Utc.timestamp_opt(1_000_000, 0).unwrap(),
            source_type: voltgrid_state::SourceType::Worker,
            source_id: "gpu-1".into(),
            log_level: voltgrid_state::LogLevel::Info,
            message: "model loaded".into(),
            task_id: None,
            worker_id: Some("gpu-1".into()),
            cycle_number: None,
            metadata: serde_json::Value::Null,
        };

        store
            .heartbeat_with_logs("gpu-1", Some(24_000), Some(4_000), &[record])
            .await
            .unwrap();

        let worker = store.worker("gpu-1").unwrap();
        assert!(worker.last_heartbeat.is_some());
        assert_eq!(worker.metadata.vram_total_mb, Some(24_000));
        assert_eq!(store.submitted_logs().len(), 1);
    }

    #[tokio::test]
    async fn log_batch_failure_injection() {
        let store = MemoryStore::with_clock(clock());
        store.fail_log_batches(1);
        let record = LogRecord {
            timestamp: Utc.timestamp_opt(1_000_000, 0).unwrap(),
            source_type: voltgrid_state::SourceType::OrchestratorGpu,
            source_id: "test".into(),
            log_level: voltgrid_state::LogLevel::Info,
            message: "hello".into(),
            task_id: None,
            worker_id: None,
            cycle_number: None,
            metadata: serde_json::Value::Null,
        };
        assert!(store.insert_logs_batch(&[record.clone()]).await.is_err());
        assert!(store.insert_logs_batch(&[record]).await.is_ok());
        assert_eq!(store.submitted_logs().len(), 1);
        assert_eq!(store.log_batches_submitted(), 1);
    }
}
