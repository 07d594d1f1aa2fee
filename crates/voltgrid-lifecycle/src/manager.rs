//! The worker lifecycle manager.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use voltgrid_cloud::{CloudClient, Readiness};
use voltgrid_state::{
    Clock, OrchestratorConfig, PodSpec, Worker, WorkerMetadata, WorkerStatus,
};
use voltgrid_store::FleetStore;

/// Generate a worker id: `gpu-<UTC timestamp>-<random suffix>`. The id is
/// also the pod name requested from the cloud, so the store's primary-key
/// uniqueness prevents duplicate pods.
pub fn generate_worker_id(now: DateTime<Utc>) -> String {
    let suffix: String = Uuid::new_v4().simple().to_string()[..8].to_string();
    format!("gpu-{}-{suffix}", now.format("%Y%m%d-%H%M%S"))
}

/// Lifecycle tunables plus the pod template used for spawns.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub idle_timeout: Duration,
    pub stuck_timeout: Duration,
    pub spawning_timeout: Duration,
    pub graceful_shutdown_timeout: Duration,
    pub failsafe_stale_threshold: Duration,
    pub worker_grace_period: Duration,
    pub spawning_grace_period: Duration,
    pub pod_spec: PodSpec,
    /// RAM tier recorded at registration, when the deployment defines one.
    pub ram_tier: Option<String>,
}

impl LifecycleConfig {
    pub fn new(cfg: &OrchestratorConfig, pod_spec: PodSpec) -> Self {
        let secs = |d: std::time::Duration| Duration::seconds(d.as_secs() as i64);
        Self {
            idle_timeout: secs(cfg.idle_timeout),
            stuck_timeout: secs(cfg.stuck_timeout),
            spawning_timeout: secs(cfg.spawning_timeout),
            graceful_shutdown_timeout: secs(cfg.graceful_shutdown_timeout),
            failsafe_stale_threshold: secs(cfg.failsafe_stale_threshold),
            worker_grace_period: secs(cfg.worker_grace_period),
            spawning_grace_period: secs(cfg.spawning_grace_period),
            pod_spec,
            ram_tier: None,
        }
    }
}

/// Result of one promotion pass over the spawning workers.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PromotionOutcome {
    pub promoted: u32,
    /// Workers that entered a terminal state during the pass.
    pub failed: Vec<String>,
}

/// Drives every worker status transition through the store and the cloud.
pub struct WorkerLifecycle {
    store: Arc<dyn FleetStore>,
    cloud: Arc<dyn CloudClient>,
    clock: Arc<dyn Clock>,
    cfg: LifecycleConfig,
}

impl WorkerLifecycle {
    pub fn new(
        store: Arc<dyn FleetStore>,
        cloud: Arc<dyn CloudClient>,
        clock: Arc<dyn Clock>,
        cfg: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            cloud,
            clock,
            cfg,
        }
    }

    // ── Spawning ───────────────────────────────────────────────────

    /// Spawn up to `count` workers. Returns how many pods were requested.
    pub async fn spawn_workers(&self, count: u32) -> u32 {
        let mut spawned = 0;
        for _ in 0..count {
            if self.spawn_one().await {
                spawned += 1;
            }
        }
        spawned
    }

    async fn spawn_one(&self) -> bool {
        let worker_id = generate_worker_id(self.clock.now());

        // Optimistic registration: the row goes in first so a duplicate id
        // can never produce a second pod.
        let registration = WorkerMetadata {
            ram_tier: self.cfg.ram_tier.clone(),
            storage_volume: self.cfg.pod_spec.network_volume_name.clone(),
            ..Default::default()
        };
        if let Err(err) = self
            .store
            .register_worker(&worker_id, &self.cfg.pod_spec.gpu_type_display_name, registration)
            .await
        {
            error!(%worker_id, error = %err, "registration failed, aborting spawn before any cloud call");
            return false;
        }

        match self.cloud.create_pod(&worker_id, &self.cfg.pod_spec).await {
            Ok(created) => {
                let patch = WorkerMetadata {
                    runpod_id: Some(created.cloud_id.clone()),
                    pod_details: Some(serde_json::json!({
                        "cloud_id": created.cloud_id,
                        "initial_state": created.initial_state,
                    })),
                    ready: Some(false),
                    ..Default::default()
                };
                if let Err(err) = self.store.update_worker(&worker_id, patch).await {
                    // The pod exists but the row lost its pointer; the
                    // orphan-pod reconciliation will pick it up if this
                    // termination also fails.
                    error!(%worker_id, cloud_id = %created.cloud_id, error = %err,
                        "failed to record pod id, terminating freshly created pod");
                    let _ = self.cloud.terminate_pod(&created.cloud_id).await;
                    self.fail_worker_by_id(&worker_id, None, "Failed to record pod id")
                        .await;
                    return false;
                }
                info!(%worker_id, cloud_id = %created.cloud_id, "worker spawned");
                true
            }
            Err(err) => {
                warn!(%worker_id, error = %err, "pod creation failed");
                self.fail_worker_by_id(&worker_id, None, &format!("Failed to create pod: {err}"))
                    .await;
                false
            }
        }
    }

    // ── Promotion ──────────────────────────────────────────────────

    /// Check each spawning worker's pod and promote the ready ones.
    pub async fn promote_spawning(&self, spawning: &[Worker]) -> PromotionOutcome {
        let now = self.clock.now();
        let mut outcome = PromotionOutcome::default();

        for worker in spawning {
            // Re-promoting a worker that already left `spawning` is a no-op.
            if worker.status != WorkerStatus::Spawning {
                continue;
            }

            let Some(cloud_id) = worker.metadata.runpod_id.clone() else {
                self.fail_worker(worker, "No cloud pod id").await;
                outcome.failed.push(worker.id.clone());
                continue;
            };

            let state = match self.cloud.get_pod_state(&cloud_id).await {
                Ok(state) => state,
                Err(err) => {
                    // Transient or not-yet-visible pod: the spawning timeout
                    // is the backstop.
                    warn!(worker_id = %worker.id, %cloud_id, error = %err, "pod state unavailable");
                    if worker.age(now) > self.cfg.spawning_timeout {
                        self.fail_worker(worker, "Spawning timeout").await;
                        outcome.failed.push(worker.id.clone());
                    }
                    continue;
                }
            };

            if state.desired_status.is_dead() {
                self.fail_worker(worker, "Pod failed to provision").await;
                outcome.failed.push(worker.id.clone());
                continue;
            }

            if worker.age(now) > self.cfg.spawning_timeout {
                self.fail_worker(worker, "Spawning timeout").await;
                outcome.failed.push(worker.id.clone());
                continue;
            }

            let Some(ssh) = state.ssh_details() else {
                debug!(worker_id = %worker.id, "pod has no ssh mapping yet");
                continue;
            };

            match self.cloud.initialize_pod(&cloud_id).await {
                Ok(Readiness::Ready) => {
                    let patch = WorkerMetadata {
                        ready: Some(true),
                        promoted_to_active_at: Some(now),
                        ssh_details: Some(ssh),
                        pod_details: serde_json::to_value(&state).ok(),
                        ..Default::default()
                    };
                    match self
                        .store
                        .update_worker_status(&worker.id, WorkerStatus::Active, patch)
                        .await
                    {
                        Ok(()) => {
                            info!(worker_id = %worker.id, "worker promoted to active");
                            outcome.promoted += 1;
                        }
                        Err(err) => {
                            warn!(worker_id = %worker.id, error = %err, "promotion write failed");
                        }
                    }
                }
                Ok(Readiness::NotReady { reason }) => {
                    debug!(worker_id = %worker.id, %reason, "pod not ready yet");
                }
                Ok(Readiness::Failed { reason }) => {
                    self.fail_worker(worker, &format!("Pod initialisation failed: {reason}"))
                        .await;
                    outcome.failed.push(worker.id.clone());
                }
                Err(err) => {
                    warn!(worker_id = %worker.id, error = %err, "readiness probe errored");
                }
            }
        }

        outcome
    }

    // ── Health checks ──────────────────────────────────────────────

    /// Heartbeat-driven health checks over active workers. Returns the ids
    /// of workers that entered a terminal state.
    ///
    /// Heartbeat staleness alone is never enough: an idle-quiet worker with
    /// no demand stays up. Staleness fails a worker only when it has tasks
    /// assigned or there is queued work it should be taking.
    pub async fn run_health_checks(&self, active: &[Worker], queued_only: u64) -> Vec<String> {
        let now = self.clock.now();
        let mut failed = Vec::new();

        for worker in active {
            if worker.status != WorkerStatus::Active {
                continue;
            }
            if worker.active_age(now) < self.cfg.worker_grace_period {
                debug!(worker_id = %worker.id, "within post-promotion grace period");
                continue;
            }

            let tasks = match self.store.running_tasks_for_worker(&worker.id).await {
                Ok(tasks) => tasks,
                Err(err) => {
                    warn!(worker_id = %worker.id, error = %err, "could not list running tasks");
                    continue;
                }
            };

            // Stuck-task detector. Parent tasks run indefinitely.
            let mut stuck = None;
            for task in &tasks {
                if task.is_parent() {
                    continue;
                }
                if let Some(started) = task.generation_started_at {
                    if now - started > self.cfg.stuck_timeout {
                        stuck = Some(task.id.clone());
                        break;
                    }
                }
            }
            if let Some(task_id) = stuck {
                self.fail_worker(worker, &format!("Stuck task {task_id}")).await;
                failed.push(worker.id.clone());
                continue;
            }

            let heartbeat_age = worker.heartbeat_age(now);
            let reason = if !tasks.is_empty() {
                match heartbeat_age {
                    Some(age) if age > self.cfg.idle_timeout => Some(format!(
                        "Stale heartbeat with active tasks ({}s old)",
                        age.num_seconds()
                    )),
                    None if worker.active_age(now) > self.cfg.idle_timeout => {
                        Some("No heartbeat with active tasks".to_string())
                    }
                    _ => None,
                }
            } else if queued_only > 0 {
                match heartbeat_age {
                    Some(age) if age > self.cfg.idle_timeout => Some(format!(
                        "Idle with tasks queued (heartbeat {}s old)",
                        age.num_seconds()
                    )),
                    None if worker.active_age(now) > self.cfg.idle_timeout => {
                        Some("No heartbeat or activity".to_string())
                    }
                    _ => None,
                }
            } else {
                // Idle-quiet: no demand, no error.
                None
            };

            if let Some(reason) = reason {
                self.fail_worker(worker, &reason).await;
                failed.push(worker.id.clone());
            }
        }

        failed
    }

    /// Failsafe sweep: terminate any worker whose heartbeat (or creation,
    /// when it never heartbeated) is older than the stale threshold,
    /// regardless of status. Also sweeps rows stuck in `error` into
    /// `terminated`. Returns ids that entered a terminal state.
    pub async fn failsafe_sweep(&self, workers: &[Worker]) -> Vec<String> {
        let now = self.clock.now();
        let mut swept = Vec::new();

        for worker in workers {
            if worker.status == WorkerStatus::Terminated {
                continue;
            }

            if worker.status == WorkerStatus::Error {
                // Error rows are transient by contract; a row still in
                // `error` was left behind by an interrupted cycle.
                self.cleanup_error_row(worker).await;
                swept.push(worker.id.clone());
                continue;
            }

            let stale = match worker.heartbeat_age(now) {
                Some(age) => (age > self.cfg.failsafe_stale_threshold)
                    .then(|| format!("Failsafe: stale heartbeat ({}s old)", age.num_seconds())),
                None => (worker.age(now) > self.cfg.failsafe_stale_threshold).then(|| {
                    format!(
                        "Failsafe: no heartbeat since creation ({}s ago)",
                        worker.age(now).num_seconds()
                    )
                }),
            };

            if let Some(reason) = stale {
                warn!(worker_id = %worker.id, status = %worker.status, "failsafe tripped");
                self.fail_worker(worker, &reason).await;
                swept.push(worker.id.clone());
            }
        }

        swept
    }

    // ── Draining ───────────────────────────────────────────────────

    /// Mark a worker for graceful drain. The store refuses new claims for
    /// terminating workers from this point on.
    pub async fn mark_terminating(&self, worker: &Worker) -> bool {
        let patch = WorkerMetadata {
            terminating_since: Some(self.clock.now()),
            ..Default::default()
        };
        match self
            .store
            .update_worker_status(&worker.id, WorkerStatus::Terminating, patch)
            .await
        {
            Ok(()) => {
                info!(worker_id = %worker.id, "worker marked terminating");
                true
            }
            Err(err) => {
                warn!(worker_id = %worker.id, error = %err, "failed to mark terminating");
                false
            }
        }
    }

    /// Drive terminating workers: once a worker has no in-progress tasks,
    /// or its drain deadline expired, terminate the pod and finalise the
    /// row. Returns how many workers reached `terminated`.
    pub async fn drain_terminating(&self, terminating: &[Worker]) -> u32 {
        let now = self.clock.now();
        let mut terminated = 0;

        for worker in terminating {
            if worker.status != WorkerStatus::Terminating {
                continue;
            }

            let drained = match self.store.has_running_tasks(&worker.id).await {
                Ok(busy) => !busy,
                Err(err) => {
                    warn!(worker_id = %worker.id, error = %err, "could not check drain state");
                    continue;
                }
            };
            let since = worker
                .metadata
                .terminating_since
                .unwrap_or(worker.created_at);
            let deadline_passed = now - since > self.cfg.graceful_shutdown_timeout;

            if !drained && !deadline_passed {
                debug!(worker_id = %worker.id, "still draining");
                continue;
            }

            if let Some(cloud_id) = worker.metadata.runpod_id.as_deref() {
                match self.cloud.terminate_pod(cloud_id).await {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => {}
                    Err(err) => {
                        // Leave the row terminating; next cycle retries.
                        warn!(worker_id = %worker.id, error = %err, "pod termination failed");
                        continue;
                    }
                }
            }

            let patch = WorkerMetadata {
                terminated_at: Some(now),
                ..Default::default()
            };
            match self
                .store
                .update_worker_status(&worker.id, WorkerStatus::Terminated, patch)
                .await
            {
                Ok(()) => {
                    info!(worker_id = %worker.id, forced = deadline_passed, "worker terminated");
                    terminated += 1;
                }
                Err(err) => {
                    warn!(worker_id = %worker.id, error = %err, "failed to finalise termination");
                }
            }
        }

        terminated
    }

    /// Cancel surplus spawning workers, newest first, when capacity exceeds
    /// the desired count and no queued work remains. Workers younger than
    /// the spawning grace period are left to finish coming up.
    pub async fn cancel_surplus_spawning(
        &self,
        spawning: &[Worker],
        excess: u32,
        queued_only: u64,
    ) -> u32 {
        if excess == 0 {
            return 0;
        }
        if queued_only > 0 {
            debug!("queued work exists, keeping surplus spawning workers");
            return 0;
        }
        let now = self.clock.now();

        let mut eligible: Vec<&Worker> = spawning
            .iter()
            .filter(|w| {
                w.status == WorkerStatus::Spawning && w.age(now) > self.cfg.spawning_grace_period
            })
            .collect();
        eligible.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let mut cancelled = 0;
        for worker in eligible.into_iter().take(excess as usize) {
            if let Some(cloud_id) = worker.metadata.runpod_id.as_deref() {
                if let Err(err) = self.cloud.terminate_pod(cloud_id).await {
                    if !err.is_not_found() {
                        warn!(worker_id = %worker.id, error = %err, "could not cancel spawning pod");
                        continue;
                    }
                }
            }
            let patch = WorkerMetadata {
                terminated_at: Some(now),
                ..Default::default()
            };
            match self
                .store
                .update_worker_status(&worker.id, WorkerStatus::Terminated, patch)
                .await
            {
                Ok(()) => {
                    info!(worker_id = %worker.id, "surplus spawning worker cancelled");
                    cancelled += 1;
                }
                Err(err) => {
                    warn!(worker_id = %worker.id, error = %err, "failed to cancel spawning worker");
                }
            }
        }

        cancelled
    }

    /// Idle = active, no in-progress task, past the post-promotion grace
    /// period. Drain candidates come from here.
    pub async fn is_idle(&self, worker: &Worker) -> bool {
        if worker.status != WorkerStatus::Active {
            return false;
        }
        if worker.active_age(self.clock.now()) < self.cfg.worker_grace_period {
            return false;
        }
        match self.store.has_running_tasks(&worker.id).await {
            Ok(busy) => !busy,
            Err(err) => {
                warn!(worker_id = %worker.id, error = %err, "could not check idleness");
                false
            }
        }
    }

    // ── Error path ─────────────────────────────────────────────────

    /// Transition a worker to `error` (with a non-empty reason), terminate
    /// its pod best-effort, and finalise the row as `terminated` with the
    /// reason preserved.
    pub async fn fail_worker(&self, worker: &Worker, reason: &str) {
        self.fail_worker_by_id(&worker.id, worker.metadata.runpod_id.as_deref(), reason)
            .await;
    }

    async fn fail_worker_by_id(&self, worker_id: &str, cloud_id: Option<&str>, reason: &str) {
        let now = self.clock.now();
        error!(%worker_id, %reason, "marking worker as error");

        let error_patch = WorkerMetadata {
            error_reason: Some(reason.to_string()),
            error_time: Some(now),
            ..Default::default()
        };
        if let Err(err) = self
            .store
            .update_worker_status(worker_id, WorkerStatus::Error, error_patch)
            .await
        {
            error!(%worker_id, error = %err, "failed to record error status");
        }

        // Fetch the pod id from the row when the caller had none; the spawn
        // error path runs before the pointer is written.
        let cloud_id = match cloud_id {
            Some(id) => Some(id.to_string()),
            None => self
                .store
                .get_worker(worker_id)
                .await
                .ok()
                .flatten()
                .and_then(|w| w.metadata.runpod_id),
        };
        if let Some(cloud_id) = cloud_id {
            match self.cloud.terminate_pod(&cloud_id).await {
                Ok(()) => debug!(%worker_id, %cloud_id, "pod terminated after error"),
                Err(err) if err.is_not_found() => {}
                Err(err) => warn!(%worker_id, %cloud_id, error = %err, "pod termination failed after error"),
            }
        }

        let terminate_patch = WorkerMetadata {
            terminated_at: Some(now),
            ..Default::default()
        };
        if let Err(err) = self
            .store
            .update_worker_status(worker_id, WorkerStatus::Terminated, terminate_patch)
            .await
        {
            error!(%worker_id, error = %err, "failed to finalise errored worker");
        }
    }

    /// Sweep a row left in `error` by an interrupted cycle: terminate the
    /// pod best-effort and finalise as `terminated`, keeping the reason.
    async fn cleanup_error_row(&self, worker: &Worker) {
        warn!(worker_id = %worker.id, "cleaning up stale error row");
        if let Some(cloud_id) = worker.metadata.runpod_id.as_deref() {
            if let Err(err) = self.cloud.terminate_pod(cloud_id).await {
                if !err.is_not_found() {
                    warn!(worker_id = %worker.id, error = %err, "cleanup termination failed");
                }
            }
        }
        let patch = WorkerMetadata {
            terminated_at: Some(self.clock.now()),
            ..Default::default()
        };
        if let Err(err) = self
            .store
            .update_worker_status(&worker.id, WorkerStatus::Terminated, patch)
            .await
        {
            warn!(worker_id = %worker.id, error = %err, "cleanup finalisation failed");
        }
    }
}
