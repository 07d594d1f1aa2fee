//! RunpodClient — production [`CloudClient`] over the RunPod GraphQL API.
//!
//! GPU type ids and network volume ids are resolved from their display
//! names once and cached for the process lifetime. Transient API errors are
//! retried with capped backoff inside each call.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use voltgrid_state::{ConfigError, ConfigResult, PodPhase, PodSpec, PodState, PodSummary};

use crate::error::{CloudError, CloudResult};
use crate::probe::{tcp_probe, ProbeOutcome};
use crate::{CloudClient, CreatedPod, Readiness};

const DEFAULT_API_URL: &str = "https://api.runpod.io/graphql";
const DEFAULT_WORKER_IMAGE: &str = "runpod/pytorch:2.4.0-py3.11-cuda12.4.1-devel-ubuntu22.04";
const DEFAULT_GPU_TYPE: &str = "NVIDIA GeForce RTX 4090";

const MAX_ATTEMPTS: u32 = 3;
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// RunPod connection and pod-template settings.
#[derive(Debug, Clone)]
pub struct RunpodConfig {
    /// RUNPOD_API_KEY.
    pub api_key: String,
    /// GraphQL endpoint; overridable for self-hosted gateways.
    pub api_url: String,
    /// RUNPOD_GPU_TYPE — display name, resolved to a cloud id.
    pub gpu_type: String,
    /// RUNPOD_WORKER_IMAGE.
    pub worker_image: String,
    /// RUNPOD_STORAGE_NAME — network volume display name.
    pub storage_name: Option<String>,
    /// RUNPOD_VOLUME_MOUNT_PATH.
    pub volume_mount_path: String,
    /// RUNPOD_DISK_SIZE_GB.
    pub disk_size_gb: u32,
    /// RUNPOD_CONTAINER_DISK_GB.
    pub container_disk_gb: u32,
    /// RUNPOD_SSH_PUBLIC_KEY — injected as PUBLIC_KEY so the image installs
    /// it into authorized_keys.
    pub ssh_public_key: Option<String>,
    pub request_timeout: Duration,
}

impl RunpodConfig {
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup("RUNPOD_API_KEY").ok_or(ConfigError::Missing("RUNPOD_API_KEY"))?;
        let parse_gb = |var: &'static str, default: u32| -> ConfigResult<u32> {
            match lookup(var) {
                Some(raw) => raw
                    .trim()
                    .parse::<u32>()
                    .map_err(|e| ConfigError::invalid(var, e.to_string())),
                None => Ok(default),
            }
        };
        Ok(Self {
            api_key,
            api_url: lookup("RUNPOD_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            gpu_type: lookup("RUNPOD_GPU_TYPE").unwrap_or_else(|| DEFAULT_GPU_TYPE.to_string()),
            worker_image: lookup("RUNPOD_WORKER_IMAGE")
                .unwrap_or_else(|| DEFAULT_WORKER_IMAGE.to_string()),
            storage_name: lookup("RUNPOD_STORAGE_NAME"),
            volume_mount_path: lookup("RUNPOD_VOLUME_MOUNT_PATH")
                .unwrap_or_else(|| "/workspace".to_string()),
            disk_size_gb: parse_gb("RUNPOD_DISK_SIZE_GB", 20)?,
            container_disk_gb: parse_gb("RUNPOD_CONTAINER_DISK_GB", 10)?,
            ssh_public_key: lookup("RUNPOD_SSH_PUBLIC_KEY"),
            request_timeout: Duration::from_secs(30),
        })
    }

    /// The pod template used for every worker spawn.
    pub fn pod_spec(&self) -> PodSpec {
        PodSpec {
            gpu_type_display_name: self.gpu_type.clone(),
            container_image: self.worker_image.clone(),
            container_disk_gb: self.container_disk_gb,
            volume_disk_gb: self.disk_size_gb,
            volume_mount_path: self.volume_mount_path.clone(),
            network_volume_name: self.storage_name.clone(),
            env: HashMap::new(),
            ssh_public_key: self.ssh_public_key.clone(),
            ports: "22/tcp".to_string(),
        }
    }
}

/// Environment wiring injected into every worker pod. Built in exactly one
/// place so the completion endpoint cannot drift: workers must report to the
/// edge function that creates downstream generation records, not the
/// status-only surface.
#[derive(Debug, Clone)]
pub struct WorkerWiring {
    pub supabase_url: String,
    pub service_role_key: String,
    pub task_complete_url: String,
}

impl WorkerWiring {
    pub fn new(supabase_url: &str, service_role_key: &str) -> Self {
        let base = supabase_url.trim_end_matches('/');
        Self {
            supabase_url: base.to_string(),
            service_role_key: service_role_key.to_string(),
            task_complete_url: format!("{base}/functions/v1/complete-task"),
        }
    }

    /// Environment for one worker. Entries here override the pod spec's.
    fn env_for(&self, worker_id: &str) -> HashMap<String, String> {
        HashMap::from([
            ("WORKER_ID".to_string(), worker_id.to_string()),
            ("SUPABASE_URL".to_string(), self.supabase_url.clone()),
            (
                "SUPABASE_SERVICE_ROLE_KEY".to_string(),
                self.service_role_key.clone(),
            ),
            (
                "TASK_COMPLETE_URL".to_string(),
                self.task_complete_url.clone(),
            ),
        ])
    }
}

/// Production RunPod adapter.
pub struct RunpodClient {
    http: reqwest::Client,
    cfg: RunpodConfig,
    wiring: WorkerWiring,
    /// Resolved gpu type id, cached for the process lifetime.
    gpu_type_id: Mutex<Option<String>>,
    /// Resolved network volume id; inner None = configured name not found.
    volume_id: Mutex<Option<Option<String>>>,
}

impl RunpodClient {
    pub fn new(cfg: RunpodConfig, wiring: WorkerWiring) -> CloudResult<Self> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", cfg.api_key))
            .map_err(|e| CloudError::fatal(format!("invalid api key: {e}")))?;
        headers.insert(AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| CloudError::fatal(format!("failed to build http client: {e}")))?;

        Ok(Self {
            http,
            cfg,
            wiring,
            gpu_type_id: Mutex::new(None),
            volume_id: Mutex::new(None),
        })
    }

    /// Execute a GraphQL operation with transient-error retry.
    async fn graphql(&self, op: &'static str, query: &str, variables: Value) -> CloudResult<Value> {
        let mut attempt = 1;
        loop {
            let result = self.graphql_once(query, &variables).await;
            match result {
                Ok(data) => return Ok(data),
                Err(err) if err.is_transient() && attempt < MAX_ATTEMPTS => {
                    let delay = Duration::from_millis(250 * 2u64.pow(attempt - 1));
                    warn!(op, attempt, error = %err, "transient cloud error, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn graphql_once(&self, query: &str, variables: &Value) -> CloudResult<Value> {
        let resp = self
            .http
            .post(&self.cfg.api_url)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = resp.status();
        let body: Value = match resp.json().await {
            Ok(body) => body,
            Err(e) if status.is_success() => {
                return Err(CloudError::fatal(format!("malformed api response: {e}")))
            }
            Err(_) => Value::Null,
        };

        if !status.is_success() {
            return Err(map_status(status, &body));
        }
        if let Some(errors) = body.get("errors").and_then(Value::as_array) {
            if let Some(first) = errors.first() {
                let message = first
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown graphql error");
                return Err(classify_graphql_error(message));
            }
        }
        Ok(body.get("data").cloned().unwrap_or(Value::Null))
    }

    /// Resolve the configured GPU display name to a cloud id, once.
    async fn gpu_type_id(&self) -> CloudResult<String> {
        if let Some(id) = self.gpu_type_id.lock().unwrap().clone() {
            return Ok(id);
        }
        let data = self
            .graphql(
                "gpuTypes",
                "query GpuTypes { gpuTypes { id displayName } }",
                json!({}),
            )
            .await?;
        let gpus = data
            .get("gpuTypes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let wanted = &self.cfg.gpu_type;
        let found = gpus.iter().find(|gpu| {
            gpu.get("displayName").and_then(Value::as_str) == Some(wanted.as_str())
                || gpu.get("id").and_then(Value::as_str) == Some(wanted.as_str())
        });
        match found.and_then(|gpu| gpu.get("id")).and_then(Value::as_str) {
            Some(id) => {
                info!(gpu_type = %wanted, gpu_type_id = %id, "resolved gpu type");
                *self.gpu_type_id.lock().unwrap() = Some(id.to_string());
                Ok(id.to_string())
            }
            None => Err(CloudError::fatal(format!("gpu type {wanted:?} not available"))),
        }
    }

    /// Resolve the configured network volume name to an id, once. A missing
    /// volume logs a warning and the pod is created without it.
    async fn network_volume_id(&self) -> CloudResult<Option<String>> {
        if let Some(cached) = self.volume_id.lock().unwrap().clone() {
            return Ok(cached);
        }
        let Some(name) = self.cfg.storage_name.clone() else {
            *self.volume_id.lock().unwrap() = Some(None);
            return Ok(None);
        };
        let data = self
            .graphql(
                "networkVolumes",
                "query NetworkVolumes { myself { networkVolumes { id name size } } }",
                json!({}),
            )
            .await?;
        let volumes = data
            .pointer("/myself/networkVolumes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let id = volumes
            .iter()
            .find(|vol| vol.get("name").and_then(Value::as_str) == Some(name.as_str()))
            .and_then(|vol| vol.get("id"))
            .and_then(Value::as_str)
            .map(String::from);
        if id.is_none() {
            warn!(storage = %name, "network volume not found, pods will launch without it");
        }
        *self.volume_id.lock().unwrap() = Some(id.clone());
        Ok(id)
    }
}

#[async_trait]
impl CloudClient for RunpodClient {
    async fn create_pod(&self, worker_id: &str, spec: &PodSpec) -> CloudResult<CreatedPod> {
        let gpu_type_id = self.gpu_type_id().await?;
        let volume_id = self.network_volume_id().await?;

        let mut env = spec.env.clone();
        env.extend(self.wiring.env_for(worker_id));
        if let Some(key) = spec.ssh_public_key.as_deref().or(self.cfg.ssh_public_key.as_deref()) {
            env.insert("PUBLIC_KEY".to_string(), key.to_string());
        } else {
            warn!(%worker_id, "no ssh public key configured; readiness probing may fail");
        }

        let input = deploy_input(worker_id, spec, &gpu_type_id, volume_id.as_deref(), &env);
        let data = self
            .graphql(
                "podFindAndDeployOnDemand",
                "mutation Deploy($input: PodFindAndDeployOnDemandInput) { \
                 podFindAndDeployOnDemand(input: $input) { id desiredStatus } }",
                json!({ "input": input }),
            )
            .await?;

        let pod = data
            .get("podFindAndDeployOnDemand")
            .filter(|v| !v.is_null())
            .ok_or_else(|| {
                CloudError::quota(format!(
                    "no pod returned for {worker_id}; gpu capacity likely exhausted"
                ))
            })?;
        let cloud_id = pod
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| CloudError::fatal("pod creation returned no id"))?;

        info!(%worker_id, cloud_id, "pod requested");
        Ok(CreatedPod {
            cloud_id: cloud_id.to_string(),
            initial_state: PodPhase::Provisioning,
        })
    }

    async fn terminate_pod(&self, cloud_id: &str) -> CloudResult<()> {
        let result = self
            .graphql(
                "podTerminate",
                "mutation Terminate($input: PodTerminateInput!) { podTerminate(input: $input) }",
                json!({ "input": { "podId": cloud_id } }),
            )
            .await;
        match result {
            Ok(_) => {
                debug!(cloud_id, "pod terminated");
                Ok(())
            }
            // Idempotent: a pod the cloud no longer knows is already gone.
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn get_pod_state(&self, cloud_id: &str) -> CloudResult<PodState> {
        let data = self
            .graphql(
                "pod",
                "query Pod($input: PodFilter) { pod(input: $input) { id desiredStatus \
                 lastStatusChange costPerHr runtime { uptimeInSeconds sshPassword \
                 ports { ip isIpPublic privatePort publicPort } } } }",
                json!({ "input": { "podId": cloud_id } }),
            )
            .await?;
        let pod = data.get("pod").filter(|v| !v.is_null()).ok_or_else(|| {
            CloudError::not_found(format!("pod {cloud_id} not known to the cloud"))
        })?;
        Ok(parse_pod_state(cloud_id, pod))
    }

    async fn list_pods(&self) -> CloudResult<Vec<PodSummary>> {
        let data = self
            .graphql(
                "myPods",
                "query MyPods { myself { pods { id name desiredStatus } } }",
                json!({}),
            )
            .await?;
        let pods = data
            .pointer("/myself/pods")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(pods.iter().map(parse_pod_summary).collect())
    }

    async fn initialize_pod(&self, cloud_id: &str) -> CloudResult<Readiness> {
        let state = self.get_pod_state(cloud_id).await?;
        match state.desired_status {
            PodPhase::Failed | PodPhase::Terminated => Ok(Readiness::Failed {
                reason: format!("pod {}", phase_name(state.desired_status)),
            }),
            PodPhase::Provisioning => Ok(Readiness::NotReady {
                reason: "pod still provisioning".to_string(),
            }),
            PodPhase::Running => match state.ssh_details() {
                Some(ssh) => match tcp_probe(&ssh.ip, ssh.port, PROBE_TIMEOUT).await {
                    ProbeOutcome::Open => Ok(Readiness::Ready),
                    ProbeOutcome::Closed | ProbeOutcome::TimedOut => Ok(Readiness::NotReady {
                        reason: format!("ssh endpoint {}:{} not reachable yet", ssh.ip, ssh.port),
                    }),
                },
                None => Ok(Readiness::NotReady {
                    reason: "waiting for ssh port mapping".to_string(),
                }),
            },
        }
    }

    async fn test_connectivity(&self) -> CloudResult<()> {
        self.graphql("myself", "query Me { myself { id } }", json!({}))
            .await?;
        Ok(())
    }
}

// ── Wire mapping helpers ───────────────────────────────────────────

fn phase_name(phase: PodPhase) -> &'static str {
    match phase {
        PodPhase::Provisioning => "provisioning",
        PodPhase::Running => "running",
        PodPhase::Failed => "failed",
        PodPhase::Terminated => "terminated",
    }
}

/// Map RunPod's desiredStatus strings onto pod phases.
fn parse_pod_phase(raw: Option<&str>) -> PodPhase {
    match raw {
        Some("RUNNING") => PodPhase::Running,
        Some("FAILED") => PodPhase::Failed,
        Some("TERMINATED") | Some("EXITED") => PodPhase::Terminated,
        _ => PodPhase::Provisioning,
    }
}

fn parse_pod_state(cloud_id: &str, pod: &Value) -> PodState {
    let runtime = pod.get("runtime").filter(|v| !v.is_null());
    let (ip, ssh_port) = runtime
        .and_then(|r| r.get("ports"))
        .and_then(Value::as_array)
        .map(|ports| extract_ssh_endpoint(ports))
        .unwrap_or((None, None));

    PodState {
        cloud_id: cloud_id.to_string(),
        desired_status: parse_pod_phase(pod.get("desiredStatus").and_then(Value::as_str)),
        actual_status: pod
            .get("lastStatusChange")
            .and_then(Value::as_str)
            .map(String::from),
        ip,
        ssh_port,
        ssh_password: runtime
            .and_then(|r| r.get("sshPassword"))
            .and_then(Value::as_str)
            .map(String::from),
        uptime_seconds: runtime
            .and_then(|r| r.get("uptimeInSeconds"))
            .and_then(Value::as_u64)
            .unwrap_or(0),
        hourly_cost: pod.get("costPerHr").and_then(Value::as_f64),
    }
}

/// SSH endpoint = the public mapping of container port 22.
fn extract_ssh_endpoint(ports: &[Value]) -> (Option<String>, Option<u16>) {
    for mapping in ports {
        if mapping.get("privatePort").and_then(Value::as_u64) == Some(22) {
            let ip = mapping.get("ip").and_then(Value::as_str).map(String::from);
            let port = mapping
                .get("publicPort")
                .and_then(Value::as_u64)
                .and_then(|p| u16::try_from(p).ok());
            return (ip, port);
        }
    }
    (None, None)
}

fn parse_pod_summary(pod: &Value) -> PodSummary {
    PodSummary {
        cloud_id: pod
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        name: pod
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        desired_status: parse_pod_phase(pod.get("desiredStatus").and_then(Value::as_str)),
    }
}

/// Build the deploy mutation input from a pod spec.
fn deploy_input(
    worker_id: &str,
    spec: &PodSpec,
    gpu_type_id: &str,
    volume_id: Option<&str>,
    env: &HashMap<String, String>,
) -> Value {
    let mut env_list: Vec<(&String, &String)> = env.iter().collect();
    env_list.sort();
    let env_json: Vec<Value> = env_list
        .into_iter()
        .map(|(key, value)| json!({ "key": key, "value": value }))
        .collect();

    let mut input = json!({
        "name": worker_id,
        "imageName": spec.container_image,
        "gpuTypeId": gpu_type_id,
        "gpuCount": 1,
        "cloudType": "SECURE",
        "volumeInGb": spec.volume_disk_gb,
        "containerDiskInGb": spec.container_disk_gb,
        "volumeMountPath": spec.volume_mount_path,
        "ports": spec.ports,
        "env": env_json,
    });
    if let Some(id) = volume_id {
        input["networkVolumeId"] = json!(id);
    }
    input
}

fn classify_graphql_error(message: &str) -> CloudError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("not found") || lower.contains("does not exist") {
        CloudError::not_found(message)
    } else if lower.contains("unauthorized") || lower.contains("api key") {
        CloudError::auth(message)
    } else if lower.contains("quota")
        || lower.contains("no longer any instances")
        || lower.contains("insufficient")
    {
        CloudError::quota(message)
    } else {
        CloudError::fatal(message)
    }
}

fn map_reqwest_error(err: reqwest::Error) -> CloudError {
    if err.is_timeout() || err.is_connect() {
        CloudError::transient(err.to_string())
    } else {
        CloudError::transient(err.to_string())
    }
}

fn map_status(status: StatusCode, body: &Value) -> CloudError {
    let detail = format!("{status}: {body}");
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CloudError::auth(detail),
        StatusCode::NOT_FOUND => CloudError::not_found(detail),
        StatusCode::TOO_MANY_REQUESTS => CloudError::transient(detail),
        s if s.is_server_error() => CloudError::transient(detail),
        _ => CloudError::fatal(detail),
    }
}
