//! voltgrid-store — the task/worker store adapter.
//!
//! All reads and writes against the external task service go through the
//! [`FleetStore`] trait: the orchestrator never talks to the store's HTTP
//! surface directly. [`SupabaseStore`] is the production implementation
//! (PostgREST tables, RPC functions, edge functions); [`MemoryStore`] is a
//! full in-process implementation with the same semantics, used by tests
//! across the workspace.
//!
//! Transient errors are retried inside the adapter with capped exponential
//! backoff (max 3 attempts, 100 ms → 1 s); everything else surfaces as a
//! typed [`StoreError`].

pub mod error;
pub mod memory;
mod retry;
pub mod supabase;

use async_trait::async_trait;
use chrono::Duration;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use supabase::{StoreConfig, SupabaseStore};

use voltgrid_state::{LogRecord, Task, TaskCounts, Worker, WorkerMetadata, WorkerStatus};

/// The store surface consumed by the control plane.
///
/// Mutations rely on store-side atomicity (conditional updates, pre-filtered
/// claim queries); all operations are safe under concurrent callers.
#[async_trait]
pub trait FleetStore: Send + Sync {
    /// Pre-filtered task counts honouring per-user concurrency caps and
    /// eligibility. Never silently zero: a malformed totals block is a
    /// decode error.
    async fn count_available_tasks(&self, include_active_claims: bool) -> StoreResult<TaskCounts>;

    /// Atomically claim the next eligible task for a worker. Refuses
    /// workers that are not `active` (in particular, `terminating` workers
    /// never receive new assignments).
    async fn claim_task(&self, worker_id: &str) -> StoreResult<Option<Task>>;

    async fn mark_task_complete(&self, task_id: &str, result: serde_json::Value)
        -> StoreResult<()>;

    /// Record a failure: increments attempts and re-queues the task until
    /// attempts reach 3, at which point it moves to `Failed`.
    async fn mark_task_failed(&self, task_id: &str, error: &str) -> StoreResult<()>;

    /// Flip `In Progress` tasks of the given workers back to `Queued` with
    /// attempt accounting. Parent (orchestrator-typed) tasks and tasks at
    /// ≥ 3 attempts are never touched; a task whose incremented attempts
    /// reach 3 moves to `Failed` instead. Returns the number touched.
    async fn reset_orphaned_tasks(&self, worker_ids: &[String]) -> StoreResult<u64>;

    /// Flip `In Progress` tasks with no worker assigned that have been
    /// stuck longer than `older_than`. Same exclusions as
    /// [`reset_orphaned_tasks`](FleetStore::reset_orphaned_tasks).
    async fn reset_unassigned_orphaned_tasks(&self, older_than: Duration) -> StoreResult<u64>;

    /// Optimistic registration: the row is written with status `spawning`
    /// before any cloud call, and the primary key doubles as the pod name
    /// so uniqueness prevents duplicate pods.
    async fn register_worker(
        &self,
        id: &str,
        instance_type: &str,
        metadata: WorkerMetadata,
    ) -> StoreResult<()>;

    /// Set the worker status, mirror it into `metadata.orchestrator_status`,
    /// and merge the metadata patch (caller wins).
    async fn update_worker_status(
        &self,
        id: &str,
        status: WorkerStatus,
        patch: WorkerMetadata,
    ) -> StoreResult<()>;

    /// Merge a metadata patch without touching the status.
    async fn update_worker(&self, id: &str, patch: WorkerMetadata) -> StoreResult<()>;

    async fn get_worker(&self, id: &str) -> StoreResult<Option<Worker>>;

    /// List workers, most recent first. An empty status filter returns all.
    async fn list_workers(&self, statuses: &[WorkerStatus]) -> StoreResult<Vec<Worker>>;

    async fn has_running_tasks(&self, worker_id: &str) -> StoreResult<bool>;

    async fn running_tasks_for_worker(&self, worker_id: &str) -> StoreResult<Vec<Task>>;

    /// Worker-side heartbeat RPC. Specified here for completeness of the
    /// boundary; the orchestrator itself never calls it.
    async fn update_worker_heartbeat(
        &self,
        worker_id: &str,
        vram_total_mb: Option<u64>,
        vram_used_mb: Option<u64>,
    ) -> StoreResult<()>;

    /// Combined worker-side RPC: one round trip refreshes the heartbeat and
    /// ships buffered worker logs. Boundary completeness, like
    /// [`update_worker_heartbeat`](FleetStore::update_worker_heartbeat).
    async fn heartbeat_with_logs(
        &self,
        worker_id: &str,
        vram_total_mb: Option<u64>,
        vram_used_mb: Option<u64>,
        logs: &[LogRecord],
    ) -> StoreResult<()>;

    /// Batched log submission used by the log sink.
    async fn insert_logs_batch(&self, records: &[LogRecord]) -> StoreResult<()>;

    /// Delete log rows older than the retention window. Invoked out-of-band.
    async fn cleanup_old_logs(&self, retention_hours: u32) -> StoreResult<u64>;

    /// Cheap connectivity probe, used at startup and by sink health checks.
    async fn test_connectivity(&self) -> StoreResult<()>;
}
