//! The control loop: one cycle at a time, in a fixed step order.

use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, error, info, warn};

use voltgrid_cloud::CloudClient;
use voltgrid_lifecycle::{LifecycleConfig, WorkerLifecycle};
use voltgrid_logsink::LogSink;
use voltgrid_scaler::{AnomalyDetector, FailureRateValve, PlanInputs, ScalingLimits, ScalingPlanner};
use voltgrid_state::{
    Clock, CycleActions, CycleSummary, FleetCounts, LogLevel, OrchestratorConfig, PodSpec,
    ScaleDecision, TaskCounts, ValveState, Worker, WorkerStatus,
};
use voltgrid_store::FleetStore;

use crate::error::OrchestratorError;

/// Age threshold for resetting `In Progress` rows with no worker assigned.
const UNASSIGNED_ORPHAN_MINUTES: i64 = 15;

/// The control loop driver. Holds no fleet state between cycles: the store
/// is the single source of truth, and only the cycle counter and the
/// anomaly detector's small memory survive from one cycle to the next.
pub struct ControlLoop {
    store: Arc<dyn FleetStore>,
    cloud: Arc<dyn CloudClient>,
    lifecycle: WorkerLifecycle,
    planner: ScalingPlanner,
    valve: FailureRateValve,
    detector: AnomalyDetector,
    sink: Option<Arc<LogSink>>,
    clock: Arc<dyn Clock>,
    cfg: OrchestratorConfig,
    cycle: u64,
    /// `sent` at the last sink health probe.
    last_sink_sent: u64,
    /// True when DB logging was requested but the sink could not start.
    sink_degraded: bool,
}

impl ControlLoop {
    pub fn new(
        store: Arc<dyn FleetStore>,
        cloud: Arc<dyn CloudClient>,
        clock: Arc<dyn Clock>,
        cfg: OrchestratorConfig,
        pod_spec: PodSpec,
        sink: Option<Arc<LogSink>>,
    ) -> Self {
        let sink_degraded = cfg.enable_db_logging && sink.is_none();
        let lifecycle = WorkerLifecycle::new(
            store.clone(),
            cloud.clone(),
            clock.clone(),
            LifecycleConfig::new(&cfg, pod_spec),
        );
        Self {
            store,
            cloud,
            lifecycle,
            planner: ScalingPlanner::new(ScalingLimits::from_config(&cfg)),
            valve: FailureRateValve::from_config(&cfg),
            detector: AnomalyDetector::new(),
            sink,
            clock,
            cfg,
            cycle: 0,
            last_sink_sent: 0,
            sink_degraded,
        }
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle
    }

    /// Run one cycle. Errors abandon the cycle; the caller logs and waits
    /// for the next interval.
    pub async fn run_cycle(&mut self) -> Result<CycleSummary, OrchestratorError> {
        self.cycle += 1;
        let cycle = self.cycle;
        if let Some(sink) = &self.sink {
            sink.set_cycle(Some(cycle));
        }
        info!(cycle, "orchestrator cycle started");

        let result = self.cycle_inner(cycle).await;

        if let Some(sink) = &self.sink {
            sink.set_cycle(None);
        }
        result
    }

    async fn cycle_inner(&mut self, cycle: u64) -> Result<CycleSummary, OrchestratorError> {
        let started_at = self.clock.now();
        let mut actions = CycleActions::default();

        // ── Sample demand and fleet ────────────────────────────────
        let counts = self.store.count_available_tasks(true).await?;
        let workers = self.store.list_workers(&[]).await?;
        let (spawning, active, terminating) = split_fleet(&workers);
        info!(
            cycle,
            queued = counts.queued_only,
            active_tasks = counts.active_only,
            spawning = spawning.len(),
            active = active.len(),
            terminating = terminating.len(),
            "fleet state sampled"
        );

        // ── Cancel surplus spawning capacity before promoting it ───
        let early = self.planner.plan(&PlanInputs {
            counts,
            spawning: spawning.len() as u32,
            active: active.len() as u32,
            terminating: terminating.len() as u32,
            idle_active: 0,
        });
        if early.capacity > early.desired {
            let cancelled = self
                .lifecycle
                .cancel_surplus_spawning(
                    &spawning,
                    early.capacity - early.desired,
                    counts.queued_only,
                )
                .await;
            actions.workers_terminated += cancelled;
        }

        // ── Promote spawning workers ───────────────────────────────
        let spawning = self.store.list_workers(&[WorkerStatus::Spawning]).await?;
        let promotion = self.lifecycle.promote_spawning(&spawning).await;
        actions.workers_promoted = promotion.promoted;
        actions.workers_failed += promotion.failed.len() as u32;
        let mut terminal_ids = promotion.failed;

        // ── Health checks, then the failsafe sweep ─────────────────
        let active_workers = self.store.list_workers(&[WorkerStatus::Active]).await?;
        let failed = self
            .lifecycle
            .run_health_checks(&active_workers, counts.queued_only)
            .await;
        actions.workers_failed += failed.len() as u32;
        terminal_ids.extend(failed);

        let all = self.store.list_workers(&[]).await?;
        let swept = self.lifecycle.failsafe_sweep(&all).await;
        actions.workers_failed += swept.len() as u32;
        terminal_ids.extend(swept);

        // ── Orphan recovery ────────────────────────────────────────
        terminal_ids.sort();
        terminal_ids.dedup();
        if !terminal_ids.is_empty() {
            let reset = self.store.reset_orphaned_tasks(&terminal_ids).await?;
            if reset > 0 {
                self.sink_log(
                    LogLevel::Warning,
                    format!("reset {reset} orphaned tasks from {} workers", terminal_ids.len()),
                );
            }
            actions.orphan_tasks_reset += reset;
        }
        actions.orphan_tasks_reset += self
            .store
            .reset_unassigned_orphaned_tasks(Duration::minutes(UNASSIGNED_ORPHAN_MINUTES))
            .await?;

        // ── Scaling plan and execution ─────────────────────────────
        let workers = self.store.list_workers(&[]).await?;
        let (spawning, active, terminating) = split_fleet(&workers);

        let mut idle: Vec<Worker> = Vec::new();
        for worker in &active {
            if self.lifecycle.is_idle(worker).await {
                idle.push(worker.clone());
            }
        }
        // Oldest-idle first: least recent activity drains before the rest.
        idle.sort_by_key(|w| w.last_heartbeat.unwrap_or(w.created_at));

        let plan = self.planner.plan(&PlanInputs {
            counts,
            spawning: spawning.len() as u32,
            active: active.len() as u32,
            terminating: terminating.len() as u32,
            idle_active: idle.len() as u32,
        });

        let mut valve_state = ValveState::Open;
        match plan.decision {
            ScaleDecision::SpawnUp { count } => {
                valve_state = self.valve.evaluate(&workers, self.clock.now());
                if valve_state.is_open() {
                    info!(cycle, count, "scaling up");
                    actions.workers_spawned = self.lifecycle.spawn_workers(count).await;
                } else {
                    let message = format!(
                        "scaling blocked: failure-rate safety valve closed, not spawning {count} workers"
                    );
                    warn!(cycle, "{message}");
                    self.sink_log(LogLevel::Warning, message);
                }
            }
            ScaleDecision::DrainDown { count } => {
                info!(cycle, count, "draining surplus idle workers");
                for worker in idle.iter().take(count as usize) {
                    self.lifecycle.mark_terminating(worker).await;
                }
            }
            ScaleDecision::Maintain => {
                debug!(cycle, "fleet matches demand");
            }
        }

        // ── Drive pre-existing terminating workers through drain ───
        actions.workers_terminated += self.lifecycle.drain_terminating(&terminating).await;

        // ── Summary, anomalies, visibility ─────────────────────────
        let fleet = FleetCounts {
            spawning: spawning.len() as u32,
            active: active.len() as u32,
            terminating: terminating.len() as u32,
            idle: idle.len() as u32,
        };
        let anomalies = self.detector.observe(
            plan.workload,
            counts.queued_only,
            fleet.active,
            actions.workers_spawned,
        );
        for anomaly in &anomalies {
            let payload = serde_json::to_value(anomaly).unwrap_or_default();
            warn!(cycle, anomaly = %payload, "scaling anomaly detected");
            self.sink_log_with(LogLevel::Warning, format!("scaling anomaly: {payload}"), payload);
        }

        let duration_ms = (self.clock.now() - started_at).num_milliseconds().max(0) as u64;
        let summary = CycleSummary {
            cycle,
            started_at,
            duration_ms,
            tasks: counts,
            fleet,
            desired_workers: plan.desired,
            capacity: plan.capacity,
            decision: plan.decision,
            valve: valve_state,
            actions,
            anomalies,
        };
        self.publish_summary(&summary, counts);

        // ── Periodic probes ────────────────────────────────────────
        if self.cfg.sink_health_every_cycles > 0 && cycle % self.cfg.sink_health_every_cycles == 0
        {
            self.probe_sink_health().await;
        }
        if self.cfg.reconcile_every_cycles > 0 && cycle % self.cfg.reconcile_every_cycles == 0 {
            match self.reconcile_orphan_pods().await {
                Ok(reaped) => {
                    if reaped > 0 {
                        self.sink_log(
                            LogLevel::Warning,
                            format!("terminated {reaped} orphan pods not present in the store"),
                        );
                    }
                }
                Err(err) => warn!(cycle, error = %err, "orphan-pod reconciliation failed"),
            }
        }

        info!(
            cycle,
            duration_ms,
            promoted = summary.actions.workers_promoted,
            failed = summary.actions.workers_failed,
            spawned = summary.actions.workers_spawned,
            terminated = summary.actions.workers_terminated,
            tasks_reset = summary.actions.orphan_tasks_reset,
            "orchestrator cycle completed"
        );
        Ok(summary)
    }

    /// The scaling tuple must stay visible even if the sink is degraded or
    /// an EnvFilter swallows everything: CRITICAL into the sink, plus the
    /// stderr channel which is always available.
    fn publish_summary(&self, summary: &CycleSummary, counts: TaskCounts) {
        let line = format!(
            "cycle {}: queued={} active_tasks={} desired={} capacity={} decision={}",
            summary.cycle,
            counts.queued_only,
            counts.active_only,
            summary.desired_workers,
            summary.capacity,
            summary.decision,
        );
        eprintln!("{line}");
        self.sink_log_with(
            LogLevel::Critical,
            line,
            serde_json::to_value(summary).unwrap_or_default(),
        );
    }

    async fn probe_sink_health(&mut self) {
        let Some(sink) = &self.sink else {
            if self.sink_degraded {
                // Requested but never started: keep reminding operators.
                let notice = "logging degraded - log sink unavailable since startup";
                eprintln!("ERROR: {notice}");
                voltgrid_logsink::record_logging_failure(
                    std::path::Path::new(voltgrid_logsink::DEFAULT_ERROR_FILE),
                    notice,
                );
            }
            return;
        };

        let stats = sink.stats();
        let advanced = stats.sent > self.last_sink_sent;
        let has_backlog = stats.queued > stats.sent + stats.dropped + stats.errors;
        let healthy = stats.alive && (advanced || !has_backlog);
        self.last_sink_sent = stats.sent;

        if healthy {
            debug!(sent = stats.sent, dropped = stats.dropped, "log sink healthy");
            return;
        }

        warn!(
            alive = stats.alive,
            sent = stats.sent,
            queued = stats.queued,
            "log sink unhealthy, attempting restart"
        );
        if let Err(err) = sink.restart().await {
            // stderr stays available even when the store does not.
            eprintln!("CRITICAL: log sink restart failed: {err}");
            error!(error = %err, "log sink restart failed");
        }
    }

    /// Terminate live cloud pods named like workers that the store no
    /// longer tracks as live. Keeps billing honest when a crash loses the
    /// row→pod pointer.
    async fn reconcile_orphan_pods(&self) -> Result<u32, OrchestratorError> {
        let pods = self.cloud.list_pods().await?;
        let workers = self.store.list_workers(&[]).await?;
        let live_names: std::collections::HashSet<&str> = workers
            .iter()
            .filter(|w| w.status != WorkerStatus::Terminated)
            .map(|w| w.id.as_str())
            .collect();

        let mut reaped = 0;
        for pod in pods {
            let is_worker_pod = pod.name.starts_with("gpu-");
            let is_live = !pod.desired_status.is_dead();
            if is_worker_pod && is_live && !live_names.contains(pod.name.as_str()) {
                warn!(pod = %pod.name, cloud_id = %pod.cloud_id, "terminating orphan pod");
                match self.cloud.terminate_pod(&pod.cloud_id).await {
                    Ok(()) => reaped += 1,
                    Err(err) => {
                        warn!(cloud_id = %pod.cloud_id, error = %err, "orphan pod termination failed")
                    }
                }
            }
        }
        Ok(reaped)
    }

    fn sink_log(&self, level: LogLevel, message: String) {
        if let Some(sink) = &self.sink {
            sink.log(level, message);
        }
    }

    fn sink_log_with(&self, level: LogLevel, message: String, metadata: serde_json::Value) {
        if let Some(sink) = &self.sink {
            sink.log_with(level, message, None, None, metadata);
        }
    }
}

fn split_fleet(workers: &[Worker]) -> (Vec<Worker>, Vec<Worker>, Vec<Worker>) {
    let mut spawning = Vec::new();
    let mut active = Vec::new();
    let mut terminating = Vec::new();
    for worker in workers {
        match worker.status {
            WorkerStatus::Spawning => spawning.push(worker.clone()),
            WorkerStatus::Active => active.push(worker.clone()),
            WorkerStatus::Terminating => terminating.push(worker.clone()),
            WorkerStatus::Terminated | WorkerStatus::Error => {}
        }
    }
    (spawning, active, terminating)
}
