//! SupabaseStore — the production [`FleetStore`] over the task service's
//! HTTP surface.
//!
//! Three endpoint families are consumed:
//!
//! - PostgREST tables (`/rest/v1/workers`, `/rest/v1/tasks`) for row CRUD,
//! - RPC functions (`/rest/v1/rpc/...`) for heartbeats, log batches, and
//!   log retention,
//! - edge functions (`/functions/v1/task-counts`,
//!   `/functions/v1/claim-next-task`) for the pre-filtered counters and the
//!   atomic claim. The counters honour per-user concurrency caps and the
//!   tenancy filter on the server side; this adapter refuses to treat a
//!   malformed totals block as zero.

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use voltgrid_state::{
    ConfigError, ConfigResult, LogRecord, Task, TaskCounts, Worker, WorkerMetadata, WorkerStatus,
};

use crate::error::{StoreError, StoreResult};
use crate::retry::with_retry;
use crate::FleetStore;

/// Connection settings for the task service.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// SUPABASE_URL, without a trailing slash.
    pub base_url: String,
    /// SUPABASE_SERVICE_ROLE_KEY.
    pub service_role_key: String,
    /// Per-request timeout.
    pub request_timeout: StdDuration,
}

impl StoreConfig {
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base_url = lookup("SUPABASE_URL").ok_or(ConfigError::Missing("SUPABASE_URL"))?;
        let service_role_key = lookup("SUPABASE_SERVICE_ROLE_KEY")
            .ok_or(ConfigError::Missing("SUPABASE_SERVICE_ROLE_KEY"))?;
        if base_url.trim().is_empty() {
            return Err(ConfigError::invalid("SUPABASE_URL", "must not be empty"));
        }
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_role_key,
            request_timeout: StdDuration::from_secs(15),
        })
    }
}

/// Production store adapter.
pub struct SupabaseStore {
    http: reqwest::Client,
    cfg: StoreConfig,
}

impl SupabaseStore {
    pub fn new(cfg: StoreConfig) -> StoreResult<Self> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", cfg.service_role_key))
            .map_err(|e| StoreError::Fatal(format!("invalid service role key: {e}")))?;
        let apikey = HeaderValue::from_str(&cfg.service_role_key)
            .map_err(|e| StoreError::Fatal(format!("invalid service role key: {e}")))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert("apikey", apikey);

        let http = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| StoreError::Fatal(format!("failed to build http client: {e}")))?;

        Ok(Self { http, cfg })
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.cfg.base_url)
    }

    fn rpc_url(&self, func: &str) -> String {
        format!("{}/rest/v1/rpc/{func}", self.cfg.base_url)
    }

    fn function_url(&self, name: &str) -> String {
        format!("{}/functions/v1/{name}", self.cfg.base_url)
    }

    /// Execute a request with transient-error retry, rebuilding it per
    /// attempt. Returns the decoded JSON body (or `Value::Null` for empty
    /// responses).
    async fn request_json<F>(&self, op: &'static str, build: F) -> StoreResult<Value>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        with_retry(op, || async {
            let resp = build(&self.http).send().await.map_err(map_reqwest_error)?;
            let status = resp.status();
            let body = resp.text().await.map_err(map_reqwest_error)?;
            if !status.is_success() {
                return Err(map_status(status, &body));
            }
            if body.trim().is_empty() {
                return Ok(Value::Null);
            }
            serde_json::from_str(&body).map_err(|e| StoreError::Decode(format!("{op}: {e}")))
        })
        .await
    }

    async fn fetch_metadata(&self, id: &str) -> StoreResult<WorkerMetadata> {
        let url = self.rest_url("workers");
        let id_filter = format!("eq.{id}");
        let body = self
            .request_json("workers.metadata", move |http| {
                http.get(&url)
                    .query(&[("select", "metadata"), ("id", id_filter.as_str())])
            })
            .await?;
        let rows = body
            .as_array()
            .ok_or_else(|| StoreError::Decode("workers.metadata: expected array".into()))?;
        let row = rows
            .first()
            .ok_or_else(|| StoreError::NotFound(format!("worker {id}")))?;
        match row.get("metadata") {
            Some(Value::Null) | None => Ok(WorkerMetadata::default()),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| StoreError::Decode(format!("worker {id} metadata: {e}"))),
        }
    }

    async fn patch_worker(&self, id: &str, patch: Value) -> StoreResult<()> {
        let url = self.rest_url("workers");
        let id_filter = format!("eq.{id}");
        self.request_json("workers.patch", move |http| {
            http.patch(&url)
                .query(&[("id", id_filter.as_str())])
                .header("Prefer", "return=minimal")
                .json(&patch)
        })
        .await?;
        Ok(())
    }

    async fn patch_task(&self, task_id: &str, patch: Value) -> StoreResult<()> {
        let url = self.rest_url("tasks");
        let id_filter = format!("eq.{task_id}");
        self.request_json("tasks.patch", move |http| {
            http.patch(&url)
                .query(&[("id", id_filter.as_str())])
                .header("Prefer", "return=minimal")
                .json(&patch)
        })
        .await?;
        Ok(())
    }

    /// Read id/type/attempts for reset candidates matching the filters.
    async fn reset_candidates(
        &self,
        filters: Vec<(&'static str, String)>,
    ) -> StoreResult<Vec<TaskRef>> {
        let url = self.rest_url("tasks");
        let mut query: Vec<(&str, String)> =
            vec![("select", "id,task_type,attempts".to_string())];
        query.extend(filters);
        let body = self
            .request_json("tasks.reset_candidates", move |http| {
                http.get(&url).query(&query)
            })
            .await?;
        serde_json::from_value(body)
            .map_err(|e| StoreError::Decode(format!("reset candidates: {e}")))
    }

    /// Apply the orphan flip to each candidate, skipping parent tasks.
    async fn flip_candidates(&self, candidates: Vec<TaskRef>, reason: &str) -> StoreResult<u64> {
        let mut touched = 0u64;
        for task in candidates {
            if is_parent_type(&task.task_type) {
                debug!(task_id = %task.id, task_type = %task.task_type, "skipping parent task");
                continue;
            }
            if task.attempts >= 3 {
                continue;
            }
            let patch = orphan_reset_patch(task.attempts + 1, reason);
            self.patch_task(&task.id, patch).await?;
            touched += 1;
        }
        Ok(touched)
    }
}

#[async_trait]
impl FleetStore for SupabaseStore {
    async fn count_available_tasks(&self, include_active_claims: bool) -> StoreResult<TaskCounts> {
        let url = self.function_url("task-counts");
        let payload = json!({ "run_type": "gpu", "include_active": include_active_claims });
        let body = self
            .request_json("task-counts", move |http| http.post(&url).json(&payload))
            .await?;
        parse_task_counts(&body, include_active_claims)
    }

    async fn claim_task(&self, worker_id: &str) -> StoreResult<Option<Task>> {
        // The claim is refused outright for workers that may not take new
        // work; the edge function enforces the same rule server-side.
        match self.get_worker(worker_id).await? {
            Some(worker) if worker.status == WorkerStatus::Active => {}
            Some(worker) => {
                debug!(%worker_id, status = %worker.status, "claim refused for non-active worker");
                return Ok(None);
            }
            None => return Err(StoreError::NotFound(format!("worker {worker_id}"))),
        }

        let url = self.function_url("claim-next-task");
        let payload = json!({ "worker_id": worker_id, "run_type": "gpu" });
        let body = self
            .request_json("claim-next-task", move |http| http.post(&url).json(&payload))
            .await?;
        parse_claim_response(&body)
    }

    async fn mark_task_complete(
        &self,
        task_id: &str,
        result: serde_json::Value,
    ) -> StoreResult<()> {
        self.patch_task(
            task_id,
            json!({
                "status": "Complete",
                "result_data": result,
                "generation_processed_at": Utc::now(),
            }),
        )
        .await
    }

    async fn mark_task_failed(&self, task_id: &str, error: &str) -> StoreResult<()> {
        let url = self.rest_url("tasks");
        let id_filter = format!("eq.{task_id}");
        let body = self
            .request_json("tasks.attempts", move |http| {
                http.get(&url)
                    .query(&[("select", "attempts"), ("id", id_filter.as_str())])
            })
            .await?;
        let attempts = body
            .as_array()
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("attempts"))
            .and_then(Value::as_u64)
            .ok_or_else(|| StoreError::NotFound(format!("task {task_id}")))?
            as u32;

        self.patch_task(task_id, failed_task_patch(attempts + 1, error))
            .await
    }

    async fn reset_orphaned_tasks(&self, worker_ids: &[String]) -> StoreResult<u64> {
        if worker_ids.is_empty() {
            return Ok(0);
        }
        let candidates = self
            .reset_candidates(vec![
                ("status", "eq.In Progress".to_string()),
                ("worker_id", format!("in.({})", worker_ids.join(","))),
                ("attempts", "lt.3".to_string()),
            ])
            .await?;
        let count = self
            .flip_candidates(candidates, "Reset - orphaned from failed worker")
            .await?;
        if count > 0 {
            warn!(count, workers = worker_ids.len(), "reset orphaned tasks");
        }
        Ok(count)
    }

    async fn reset_unassigned_orphaned_tasks(&self, older_than: Duration) -> StoreResult<u64> {
        let cutoff = Utc::now() - older_than;
        let candidates = self
            .reset_candidates(vec![
                ("status", "eq.In Progress".to_string()),
                ("worker_id", "is.null".to_string()),
                ("generation_started_at", format!("lt.{}", cutoff.to_rfc3339())),
                ("attempts", "lt.3".to_string()),
            ])
            .await?;
        let count = self
            .flip_candidates(
                candidates,
                "Reset - stuck in progress with no worker assigned",
            )
            .await?;
        if count > 0 {
            warn!(count, "reset unassigned orphaned tasks");
        }
        Ok(count)
    }

    async fn register_worker(
        &self,
        id: &str,
        instance_type: &str,
        metadata: WorkerMetadata,
    ) -> StoreResult<()> {
        let mut metadata = metadata;
        metadata.orchestrator_status = Some(WorkerStatus::Spawning.as_str().to_string());
        let url = self.rest_url("workers");
        let row = json!({
            "id": id,
            "instance_type": instance_type,
            "status": WorkerStatus::Spawning,
            "metadata": metadata,
            "created_at": Utc::now(),
        });
        self.request_json("workers.insert", move |http| {
            http.post(&url).header("Prefer", "return=minimal").json(&row)
        })
        .await?;
        debug!(worker_id = %id, "worker registered");
        Ok(())
    }

    async fn update_worker_status(
        &self,
        id: &str,
        status: WorkerStatus,
        patch: WorkerMetadata,
    ) -> StoreResult<()> {
        let mut metadata = self.fetch_metadata(id).await?;
        metadata.orchestrator_status = Some(status.as_str().to_string());
        metadata.merge(patch);
        self.patch_worker(id, json!({ "status": status, "metadata": metadata }))
            .await
    }

    async fn update_worker(&self, id: &str, patch: WorkerMetadata) -> StoreResult<()> {
        let mut metadata = self.fetch_metadata(id).await?;
        metadata.merge(patch);
        self.patch_worker(id, json!({ "metadata": metadata })).await
    }

    async fn get_worker(&self, id: &str) -> StoreResult<Option<Worker>> {
        let url = self.rest_url("workers");
        let id_filter = format!("eq.{id}");
        let body = self
            .request_json("workers.get", move |http| {
                http.get(&url)
                    .query(&[("select", "*"), ("id", id_filter.as_str()), ("limit", "1")])
            })
            .await?;
        let rows: Vec<WorkerRow> =
            serde_json::from_value(body).map_err(|e| StoreError::Decode(format!("worker: {e}")))?;
        Ok(rows.into_iter().next().map(WorkerRow::into_worker))
    }

    async fn list_workers(&self, statuses: &[WorkerStatus]) -> StoreResult<Vec<Worker>> {
        let url = self.rest_url("workers");
        let mut query: Vec<(&str, String)> = vec![
            ("select", "*".to_string()),
            ("order", "created_at.desc".to_string()),
        ];
        if !statuses.is_empty() {
            query.push(("status", status_filter(statuses)));
        }
        let body = self
            .request_json("workers.list", move |http| http.get(&url).query(&query))
            .await?;
        let rows: Vec<WorkerRow> = serde_json::from_value(body)
            .map_err(|e| StoreError::Decode(format!("workers: {e}")))?;
        Ok(rows.into_iter().map(WorkerRow::into_worker).collect())
    }

    async fn has_running_tasks(&self, worker_id: &str) -> StoreResult<bool> {
        let url = self.rest_url("tasks");
        let worker_filter = format!("eq.{worker_id}");
        let body = self
            .request_json("tasks.running_any", move |http| {
                http.get(&url).query(&[
                    ("select", "id"),
                    ("worker_id", worker_filter.as_str()),
                    ("status", "eq.In Progress"),
                    ("limit", "1"),
                ])
            })
            .await?;
        Ok(body.as_array().is_some_and(|rows| !rows.is_empty()))
    }

    async fn running_tasks_for_worker(&self, worker_id: &str) -> StoreResult<Vec<Task>> {
        let url = self.rest_url("tasks");
        let worker_filter = format!("eq.{worker_id}");
        let body = self
            .request_json("tasks.running", move |http| {
                http.get(&url).query(&[
                    ("select", "*"),
                    ("worker_id", worker_filter.as_str()),
                    ("status", "eq.In Progress"),
                ])
            })
            .await?;
        serde_json::from_value(body).map_err(|e| StoreError::Decode(format!("tasks: {e}")))
    }

    async fn update_worker_heartbeat(
        &self,
        worker_id: &str,
        vram_total_mb: Option<u64>,
        vram_used_mb: Option<u64>,
    ) -> StoreResult<()> {
        let url = self.rpc_url("func_update_worker_heartbeat");
        let mut params = serde_json::Map::new();
        params.insert("worker_id_param".into(), json!(worker_id));
        if let Some(total) = vram_total_mb {
            params.insert("vram_total_mb_param".into(), json!(total));
            params.insert("vram_used_mb_param".into(), json!(vram_used_mb.unwrap_or(0)));
        }
        let payload = Value::Object(params);
        self.request_json("heartbeat", move |http| http.post(&url).json(&payload))
            .await?;
        Ok(())
    }

    async fn heartbeat_with_logs(
        &self,
        worker_id: &str,
        vram_total_mb: Option<u64>,
        vram_used_mb: Option<u64>,
        logs: &[LogRecord],
    ) -> StoreResult<()> {
        let url = self.rpc_url("func_heartbeat_with_logs");
        let mut params = serde_json::Map::new();
        params.insert("worker_id_param".into(), json!(worker_id));
        if let Some(total) = vram_total_mb {
            params.insert("vram_total_mb_param".into(), json!(total));
            params.insert("vram_used_mb_param".into(), json!(vram_used_mb.unwrap_or(0)));
        }
        params.insert("logs".into(), json!(logs));
        let payload = Value::Object(params);
        self.request_json("heartbeat_with_logs", move |http| http.post(&url).json(&payload))
            .await?;
        Ok(())
    }

    async fn insert_logs_batch(&self, records: &[LogRecord]) -> StoreResult<()> {
        let url = self.rpc_url("func_insert_logs_batch");
        let payload = json!({ "logs": records });
        self.request_json("insert_logs_batch", move |http| http.post(&url).json(&payload))
            .await?;
        Ok(())
    }

    async fn cleanup_old_logs(&self, retention_hours: u32) -> StoreResult<u64> {
        let url = self.rpc_url("func_cleanup_old_logs");
        let payload = json!({ "retention_hours": retention_hours });
        let body = self
            .request_json("cleanup_old_logs", move |http| http.post(&url).json(&payload))
            .await?;
        Ok(body
            .as_u64()
            .or_else(|| body.get("deleted").and_then(Value::as_u64))
            .unwrap_or(0))
    }

    async fn test_connectivity(&self) -> StoreResult<()> {
        let url = self.rest_url("workers");
        self.request_json("connectivity", move |http| {
            http.get(&url).query(&[("select", "id"), ("limit", "1")])
        })
        .await?;
        Ok(())
    }
}

// ── Wire shapes and pure helpers ───────────────────────────────────

/// Worker row as stored; `metadata` may be null for legacy rows.
#[derive(Debug, Deserialize)]
struct WorkerRow {
    id: String,
    #[serde(default)]
    instance_type: String,
    status: WorkerStatus,
    created_at: chrono::DateTime<Utc>,
    #[serde(default)]
    last_heartbeat: Option<chrono::DateTime<Utc>>,
    #[serde(default)]
    metadata: Option<WorkerMetadata>,
}

impl WorkerRow {
    fn into_worker(self) -> Worker {
        Worker {
            id: self.id,
            instance_type: self.instance_type,
            status: self.status,
            created_at: self.created_at,
            last_heartbeat: self.last_heartbeat,
            metadata: self.metadata.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TaskRef {
    id: String,
    #[serde(default)]
    task_type: String,
    #[serde(default)]
    attempts: u32,
}

fn is_parent_type(task_type: &str) -> bool {
    task_type.to_ascii_lowercase().contains("orchestrator")
}

fn status_filter(statuses: &[WorkerStatus]) -> String {
    let names: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
    format!("in.({})", names.join(","))
}

/// Patch applied when a task is flipped back from a failed worker.
fn orphan_reset_patch(new_attempts: u32, reason: &str) -> Value {
    if new_attempts >= 3 {
        json!({
            "status": "Failed",
            "attempts": new_attempts,
            "worker_id": null,
            "generation_started_at": null,
            "error_message": reason,
        })
    } else {
        json!({
            "status": "Queued",
            "attempts": new_attempts,
            "worker_id": null,
            "generation_started_at": null,
            "generation_processed_at": null,
            "error_message": reason,
        })
    }
}

/// Patch applied when a worker reports a task failure.
fn failed_task_patch(new_attempts: u32, error: &str) -> Value {
    if new_attempts >= 3 {
        json!({
            "status": "Failed",
            "attempts": new_attempts,
            "worker_id": null,
            "error_message": error,
        })
    } else {
        json!({
            "status": "Queued",
            "attempts": new_attempts,
            "worker_id": null,
            "generation_started_at": null,
            "error_message": error,
        })
    }
}

/// Decode the task-counts totals block. Missing or non-numeric totals are a
/// decode error, never zero.
fn parse_task_counts(body: &Value, include_active_claims: bool) -> StoreResult<TaskCounts> {
    let totals = body
        .get("totals")
        .ok_or_else(|| StoreError::Decode("task-counts: missing totals block".into()))?;
    let queued_only = totals
        .get("queued_only")
        .and_then(Value::as_u64)
        .ok_or_else(|| StoreError::Decode("task-counts: missing totals.queued_only".into()))?;
    let active_only = totals
        .get("active_only")
        .and_then(Value::as_u64)
        .ok_or_else(|| StoreError::Decode("task-counts: missing totals.active_only".into()))?;
    let total = totals
        .get("queued_plus_active")
        .and_then(Value::as_u64)
        .unwrap_or(queued_only + active_only);

    if include_active_claims {
        Ok(TaskCounts {
            queued_only,
            active_only,
            total,
        })
    } else {
        Ok(TaskCounts {
            queued_only,
            active_only: 0,
            total: queued_only,
        })
    }
}

fn parse_claim_response(body: &Value) -> StoreResult<Option<Task>> {
    let candidate = match body.get("task") {
        Some(Value::Null) => return Ok(None),
        Some(task) => task,
        None if body.is_null() => return Ok(None),
        None => body,
    };
    if candidate.is_null() {
        return Ok(None);
    }
    serde_json::from_value(candidate.clone())
        .map(Some)
        .map_err(|e| StoreError::Decode(format!("claimed task: {e}")))
}

fn map_reqwest_error(err: reqwest::Error) -> StoreError {
    if err.is_timeout() || err.is_connect() {
        StoreError::Transient(err.to_string())
    } else if err.is_decode() {
        StoreError::Decode(err.to_string())
    } else {
        StoreError::Transient(err.to_string())
    }
}

fn map_status(status: StatusCode, body: &str) -> StoreError {
    let detail = format!("{status}: {}", body.chars().take(200).collect::<String>());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::Auth(detail),
        StatusCode::NOT_FOUND => StoreError::NotFound(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            StoreError::Transient(detail)
        }
        s if s.is_server_error() => StoreError::Transient(detail),
        _ => StoreError::Fatal(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_requires_credentials() {
        let err = StoreConfig::from_lookup(|_| None).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("SUPABASE_URL")));

        let cfg = StoreConfig::from_lookup(|key| match key {
            "SUPABASE_URL" => Some("https://proj.supabase.co/".to_string()),
            "SUPABASE_SERVICE_ROLE_KEY" => Some("secret".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(cfg.base_url, "https://proj.supabase.co");
    }

    #[test]
    fn url_builders() {
        let cfg = StoreConfig {
            base_url: "https://proj.supabase.co".into(),
            service_role_key: "k".into(),
            request_timeout: StdDuration::from_secs(5),
        };
        let store = SupabaseStore::new(cfg).unwrap();
        assert_eq!(
            store.rest_url("workers"),
            "https://proj.supabase.co/rest/v1/workers"
        );
        assert_eq!(
            store.rpc_url("func_insert_logs_batch"),
            "https://proj.supabase.co/rest/v1/rpc/func_insert_logs_batch"
        );
        assert_eq!(
            store.function_url("task-counts"),
            "https://proj.supabase.co/functions/v1/task-counts"
        );
    }

    #[test]
    fn status_filter_formats_postgrest_in() {
        let filter = status_filter(&[WorkerStatus::Spawning, WorkerStatus::Active]);
        assert_eq!(filter, "in.(spawning,active)");
    }

    #[test]
    fn task_counts_parse_happy_path() {
        let body = json!({
            "totals": {"queued_only": 7, "active_only": 3, "queued_plus_active": 10}
        });
        let counts = parse_task_counts(&body, true).unwrap();
        assert_eq!(counts.queued_only, 7);
        assert_eq!(counts.active_only, 3);
        assert_eq!(counts.total, 10);
    }

    #[test]
    fn task_counts_queued_only_mode() {
        let body = json!({
            "totals": {"queued_only": 7, "active_only": 3, "queued_plus_active": 10}
        });
        let counts = parse_task_counts(&body, false).unwrap();
        assert_eq!(counts.queued_only, 7);
        assert_eq!(counts.active_only, 0);
        assert_eq!(counts.total, 7);
    }

    #[test]
    fn task_counts_missing_totals_is_decode_error_not_zero() {
        let body = json!({"users": []});
        let err = parse_task_counts(&body, true).unwrap_err();
        assert!(matches!(err, StoreError::Decode(_)));

        let body = json!({"totals": {"queued_only": "seven"}});
        assert!(parse_task_counts(&body, true).is_err());
    }

    #[test]
    fn claim_response_parsing() {
        assert!(parse_claim_response(&json!({"task": null})).unwrap().is_none());
        assert!(parse_claim_response(&Value::Null).unwrap().is_none());

        let task = json!({
            "id": "t-1",
            "status": "In Progress",
            "attempts": 0,
            "worker_id": "gpu-1",
            "task_type": "single_image",
            "params": {},
            "created_at": "2025-06-01T00:00:00Z",
            "updated_at": "2025-06-01T00:00:00Z"
        });
        let claimed = parse_claim_response(&json!({ "task": task })).unwrap().unwrap();
        assert_eq!(claimed.id, "t-1");
    }

    #[test]
    fn orphan_reset_patch_requeues_below_cap() {
        let patch = orphan_reset_patch(1, "reset");
        assert_eq!(patch["status"], "Queued");
        assert_eq!(patch["attempts"], 1);
        assert_eq!(patch["worker_id"], Value::Null);
    }

    #[test]
    fn orphan_reset_patch_fails_at_cap() {
        let patch = orphan_reset_patch(3, "reset");
        assert_eq!(patch["status"], "Failed");
        assert_eq!(patch["attempts"], 3);
    }

    #[test]
    fn failed_task_patch_respects_attempt_cap() {
        assert_eq!(failed_task_patch(2, "err")["status"], "Queued");
        assert_eq!(failed_task_patch(3, "err")["status"], "Failed");
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            map_status(StatusCode::UNAUTHORIZED, ""),
            StoreError::Auth(_)
        ));
        assert!(matches!(
            map_status(StatusCode::SERVICE_UNAVAILABLE, ""),
            StoreError::Transient(_)
        ));
        assert!(matches!(
            map_status(StatusCode::TOO_MANY_REQUESTS, ""),
            StoreError::Transient(_)
        ));
        assert!(matches!(
            map_status(StatusCode::NOT_FOUND, ""),
            StoreError::NotFound(_)
        ));
        assert!(matches!(
            map_status(StatusCode::UNPROCESSABLE_ENTITY, ""),
            StoreError::Fatal(_)
        ));
    }

    #[test]
    fn worker_row_with_null_metadata_decodes() {
        let row = json!({
            "id": "gpu-1",
            "instance_type": "NVIDIA GeForce RTX 4090",
            "status": "active",
            "created_at": "2025-06-01T00:00:00Z",
            "last_heartbeat": null,
            "metadata": null
        });
        let worker: WorkerRow = serde_json::from_value(row).unwrap();
        let worker = worker.into_worker();
        assert_eq!(worker.status, WorkerStatus::Active);
        assert_eq!(worker.metadata, WorkerMetadata::default());
    }

    #[test]
    fn parent_type_detection() {
        assert!(is_parent_type("travel_orchestrator"));
        assert!(is_parent_type("Travel_ORCHESTRATOR"));
        assert!(!is_parent_type("single_image"));
    }
}
