//! Domain types for the voltgrid control plane.
//!
//! Worker and task rows are owned by the external task service; the
//! orchestrator exclusively writes worker `status` and the orchestrator-owned
//! metadata fields, while the worker process writes only `last_heartbeat` and
//! the VRAM fields. Log records are immutable event rows in the shared log
//! store with a 48-hour retention.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a worker (also the requested pod name).
pub type WorkerId = String;

/// Opaque identifier for a task row.
pub type TaskId = String;

/// Cloud-side identifier for a GPU pod.
pub type PodId = String;

// ── Worker ─────────────────────────────────────────────────────────

/// Lifecycle status of a GPU worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Spawning,
    Active,
    Terminating,
    Terminated,
    Error,
}

impl WorkerStatus {
    /// Terminal statuses never transition again (error rows are swept into
    /// `terminated` by cleanup).
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerStatus::Terminated | WorkerStatus::Error)
    }

    /// Fleet membership: spawning, active, and terminating workers.
    pub fn is_fleet(self) -> bool {
        matches!(
            self,
            WorkerStatus::Spawning | WorkerStatus::Active | WorkerStatus::Terminating
        )
    }

    /// Wire name used in store rows and log messages.
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Spawning => "spawning",
            WorkerStatus::Active => "active",
            WorkerStatus::Terminating => "terminating",
            WorkerStatus::Terminated => "terminated",
            WorkerStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SSH connection details for a running pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshDetails {
    pub ip: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// The worker metadata bag: a well-known core of fields plus an opaque
/// extension map for anything else the row carries.
///
/// The orchestrator writes `orchestrator_status`, the lifecycle timestamps,
/// and `error_reason`; the worker process writes the VRAM fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetadata {
    /// Mirror of the row status, kept for forensic queries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestrator_status: Option<String>,
    /// Cloud-side pod id, set once the pod is requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runpod_id: Option<PodId>,
    /// Raw pod details as last observed from the cloud API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_details: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_details: Option<SshDetails>,
    /// True once the pod passed its readiness probe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promoted_to_active_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminating_since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<DateTime<Utc>>,
    /// Non-empty for every worker that entered the error state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram_tier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_volume: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vram_total_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vram_used_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vram_timestamp: Option<f64>,
    /// Opaque remainder of the bag.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl WorkerMetadata {
    /// Merge a patch over this bag: `Some` fields in the patch win, `None`
    /// fields leave the current value untouched. Extras are merged key-wise.
    pub fn merge(&mut self, patch: WorkerMetadata) {
        macro_rules! take {
            ($field:ident) => {
                if patch.$field.is_some() {
                    self.$field = patch.$field;
                }
            };
        }
        take!(orchestrator_status);
        take!(runpod_id);
        take!(pod_details);
        take!(ssh_details);
        take!(ready);
        take!(promoted_to_active_at);
        take!(terminating_since);
        take!(terminated_at);
        take!(error_reason);
        take!(error_time);
        take!(ram_tier);
        take!(storage_volume);
        take!(vram_total_mb);
        take!(vram_used_mb);
        take!(vram_timestamp);
        for (k, v) in patch.extra {
            self.extra.insert(k, v);
        }
    }
}

/// A GPU worker row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    /// GPU type display name at registration time.
    pub instance_type: String,
    pub status: WorkerStatus,
    pub created_at: DateTime<Utc>,
    /// Updated only by the worker process; the sole liveness signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: WorkerMetadata,
}

impl Worker {
    /// Age of this row.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }

    /// Age of the last heartbeat, if one was ever received.
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_heartbeat.map(|hb| now - hb)
    }

    /// Time since promotion to active, falling back to row age for workers
    /// that carry no promotion timestamp.
    pub fn active_age(&self, now: DateTime<Utc>) -> Duration {
        match self.metadata.promoted_to_active_at {
            Some(at) => now - at,
            None => self.age(now),
        }
    }
}

// ── Task ───────────────────────────────────────────────────────────

/// Task status as stored by the task service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Queued,
    #[serde(rename = "In Progress")]
    InProgress,
    Complete,
    Failed,
    Cancelled,
}

/// A task row, as consumed by the orchestrator. Task execution itself is the
/// worker engine's business; the core reads counts and resets orphans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    /// Monotonically non-decreasing; the queue gives up at 3.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub task_type: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_location: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Parent tasks (orchestrator-typed) run indefinitely and are never
    /// reset by orphan recovery nor flagged by the stuck-task detector.
    pub fn is_parent(&self) -> bool {
        self.task_type.to_ascii_lowercase().contains("orchestrator")
    }
}

/// Pre-filtered task counts from the task service, honouring per-user
/// concurrency caps and eligibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    /// Tasks waiting to be claimed.
    pub queued_only: u64,
    /// Tasks currently claimed by cloud workers.
    pub active_only: u64,
    /// queued_only + active_only.
    pub total: u64,
}

impl TaskCounts {
    /// The number the planner scales against.
    pub fn workload(&self) -> u64 {
        self.queued_only + self.active_only
    }
}

// ── Log records ────────────────────────────────────────────────────

/// Severity of a log record in the shared log store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }

    /// Parse a level name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARNING" | "WARN" => Some(LogLevel::Warning),
            "ERROR" => Some(LogLevel::Error),
            "CRITICAL" => Some(LogLevel::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which process emitted a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    OrchestratorGpu,
    OrchestratorApi,
    Worker,
}

/// An immutable event row destined for the shared log store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub source_type: SourceType,
    pub source_id: String,
    pub log_level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle_number: Option<u64>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

// ── Pods ───────────────────────────────────────────────────────────

/// Cloud-side pod lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PodPhase {
    Provisioning,
    Running,
    Failed,
    Terminated,
}

impl PodPhase {
    /// The pod will never serve again.
    pub fn is_dead(self) -> bool {
        matches!(self, PodPhase::Failed | PodPhase::Terminated)
    }
}

/// Structured pod state returned by the cloud adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodState {
    pub cloud_id: PodId,
    pub desired_status: PodPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_password: Option<String>,
    #[serde(default)]
    pub uptime_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hourly_cost: Option<f64>,
}

impl PodState {
    /// SSH endpoint, once the cloud has published a port mapping.
    pub fn ssh_details(&self) -> Option<SshDetails> {
        match (&self.ip, self.ssh_port) {
            (Some(ip), Some(port)) => Some(SshDetails {
                ip: ip.clone(),
                port,
                password: self.ssh_password.clone(),
            }),
            _ => None,
        }
    }
}

/// Pod listing entry used by orphan-pod reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSummary {
    pub cloud_id: PodId,
    pub name: String,
    pub desired_status: PodPhase,
}

/// Specification for a new worker pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    /// GPU type display name (resolved to a cloud id by the adapter).
    pub gpu_type_display_name: String,
    pub container_image: String,
    pub container_disk_gb: u32,
    pub volume_disk_gb: u32,
    pub volume_mount_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_volume_name: Option<String>,
    /// Extra environment for the worker process. The adapter injects
    /// `WORKER_ID`, the store credentials, and the task-completion endpoint
    /// on top of these.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_public_key: Option<String>,
    /// Exposed ports, e.g. "22/tcp".
    pub ports: String,
}

// ── Scaling ────────────────────────────────────────────────────────

/// The planner's verdict for one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScaleDecision {
    /// Spawn this many workers (subject to the safety valve).
    SpawnUp { count: u32 },
    /// Mark this many idle workers terminating.
    DrainDown { count: u32 },
    /// Fleet already matches demand.
    Maintain,
}

impl std::fmt::Display for ScaleDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScaleDecision::SpawnUp { count } => write!(f, "spawn_up({count})"),
            ScaleDecision::DrainDown { count } => write!(f, "drain_down({count})"),
            ScaleDecision::Maintain => write!(f, "maintain"),
        }
    }
}

/// State of the failure-rate safety valve for one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ValveState {
    /// Spawns allowed.
    Open,
    /// Recent failures dominate; spawn intents are rejected this cycle.
    Closed {
        recent: u32,
        failed: u32,
        rate: f64,
    },
}

impl ValveState {
    pub fn is_open(&self) -> bool {
        matches!(self, ValveState::Open)
    }
}

/// Observational anomalies emitted into the log sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    /// Three or more spawn intents in a single cycle.
    RapidScaleUp { spawned: u32 },
    /// Workload jumped by an order of magnitude between cycles.
    WorkloadSpike { previous: u64, current: u64 },
    /// Queued work with zero active workers for several consecutive cycles.
    QueueStarvation { cycles: u32 },
}

// ── Cycle summary ──────────────────────────────────────────────────

/// Fleet counts grouped by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetCounts {
    pub spawning: u32,
    pub active: u32,
    pub terminating: u32,
    pub idle: u32,
}

impl FleetCounts {
    /// Capacity = active + spawning; terminating workers are excluded.
    pub fn capacity(&self) -> u32 {
        self.active + self.spawning
    }
}

/// Actions taken during a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleActions {
    pub workers_promoted: u32,
    pub workers_failed: u32,
    pub workers_spawned: u32,
    pub workers_terminated: u32,
    pub orphan_tasks_reset: u64,
}

/// Per-cycle artefact produced by the control loop driver. Written to the
/// log sink and printed in `single` mode, then discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub tasks: TaskCounts,
    pub fleet: FleetCounts,
    pub desired_workers: u32,
    pub capacity: u32,
    pub decision: ScaleDecision,
    pub valve: ValveState,
    pub actions: CycleActions,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anomalies: Vec<Anomaly>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn worker_status_serde_is_snake_case() {
        let s = serde_json::to_string(&WorkerStatus::Spawning).unwrap();
        assert_eq!(s, "\"spawning\"");
        let back: WorkerStatus = serde_json::from_str("\"terminating\"").unwrap();
        assert_eq!(back, WorkerStatus::Terminating);
    }

    #[test]
    fn task_status_in_progress_wire_name() {
        let s = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(s, "\"In Progress\"");
        let back: TaskStatus = serde_json::from_str("\"In Progress\"").unwrap();
        assert_eq!(back, TaskStatus::InProgress);
    }

    #[test]
    fn log_level_ordering_and_parse() {
        assert!(LogLevel::Critical > LogLevel::Error);
        assert!(LogLevel::Info < LogLevel::Warning);
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warning));
        assert_eq!(LogLevel::parse("CRITICAL"), Some(LogLevel::Critical));
        assert_eq!(LogLevel::parse("nope"), None);
    }

    #[test]
    fn parent_task_detection_is_case_insensitive() {
        let mut task = Task {
            id: "t-1".into(),
            status: TaskStatus::InProgress,
            attempts: 0,
            worker_id: None,
            generation_started_at: None,
            generation_processed_at: None,
            task_type: "travel_Orchestrator".into(),
            params: serde_json::Value::Null,
            result_data: None,
            error_message: None,
            output_location: None,
            created_at: ts(0),
            updated_at: ts(0),
        };
        assert!(task.is_parent());
        task.task_type = "single_image".into();
        assert!(!task.is_parent());
    }

    #[test]
    fn metadata_merge_patch_wins_and_preserves() {
        let mut base = WorkerMetadata {
            runpod_id: Some("pod-1".into()),
            ready: Some(false),
            ..Default::default()
        };
        let mut extra = serde_json::Map::new();
        extra.insert("custom".into(), serde_json::json!(42));
        base.merge(WorkerMetadata {
            ready: Some(true),
            error_reason: Some("boom".into()),
            extra,
            ..Default::default()
        });

        assert_eq!(base.runpod_id.as_deref(), Some("pod-1"));
        assert_eq!(base.ready, Some(true));
        assert_eq!(base.error_reason.as_deref(), Some("boom"));
        assert_eq!(base.extra.get("custom"), Some(&serde_json::json!(42)));
    }

    #[test]
    fn metadata_roundtrips_unknown_fields() {
        let raw = serde_json::json!({
            "orchestrator_status": "active",
            "runpod_id": "abc123",
            "some_legacy_field": {"nested": true}
        });
        let meta: WorkerMetadata = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(meta.runpod_id.as_deref(), Some("abc123"));
        assert!(meta.extra.contains_key("some_legacy_field"));

        let back = serde_json::to_value(&meta).unwrap();
        assert_eq!(back["some_legacy_field"], raw["some_legacy_field"]);
    }

    #[test]
    fn pod_state_ssh_details_requires_ip_and_port() {
        let mut pod = PodState {
            cloud_id: "p".into(),
            desired_status: PodPhase::Running,
            actual_status: None,
            ip: None,
            ssh_port: None,
            ssh_password: None,
            uptime_seconds: 0,
            hourly_cost: None,
        };
        assert!(pod.ssh_details().is_none());
        pod.ip = Some("1.2.3.4".into());
        assert!(pod.ssh_details().is_none());
        pod.ssh_port = Some(2222);
        let ssh = pod.ssh_details().unwrap();
        assert_eq!(ssh.ip, "1.2.3.4");
        assert_eq!(ssh.port, 2222);
    }

    #[test]
    fn worker_active_age_falls_back_to_created_at() {
        let worker = Worker {
            id: "w".into(),
            instance_type: "RTX 4090".into(),
            status: WorkerStatus::Active,
            created_at: ts(100),
            last_heartbeat: None,
            metadata: WorkerMetadata::default(),
        };
        assert_eq!(worker.active_age(ts(400)).num_seconds(), 300);

        let promoted = Worker {
            metadata: WorkerMetadata {
                promoted_to_active_at: Some(ts(350)),
                ..Default::default()
            },
            ..worker
        };
        assert_eq!(promoted.active_age(ts(400)).num_seconds(), 50);
    }

    #[test]
    fn fleet_counts_capacity_excludes_terminating() {
        let fleet = FleetCounts {
            spawning: 2,
            active: 3,
            terminating: 4,
            idle: 1,
        };
        assert_eq!(fleet.capacity(), 5);
    }

    #[test]
    fn workload_sums_queued_and_active() {
        let counts = TaskCounts {
            queued_only: 7,
            active_only: 3,
            total: 10,
        };
        assert_eq!(counts.workload(), 10);
    }
}
