//! voltgrid-cloud — the GPU cloud adapter.
//!
//! [`CloudClient`] is the only way the control plane touches the GPU cloud:
//! pod creation, termination, state queries, fleet listing, and the bounded
//! readiness probe. [`RunpodClient`] speaks the RunPod GraphQL API;
//! [`FakeCloud`] is a scriptable in-memory implementation for tests.
//!
//! The adapter is the single point of truth for worker environment wiring:
//! `create_pod` injects `WORKER_ID`, the task-store credentials, and the
//! task-completion endpoint URL so workers report completions to the
//! endpoint that produces downstream generation records.

pub mod error;
pub mod fake;
pub mod probe;
pub mod runpod;

use async_trait::async_trait;

pub use error::{CloudError, CloudErrorKind, CloudResult};
pub use fake::FakeCloud;
pub use probe::{tcp_probe, ProbeOutcome};
pub use runpod::{RunpodClient, RunpodConfig, WorkerWiring};

use voltgrid_state::{PodPhase, PodId, PodSpec, PodState, PodSummary};

/// Result of a pod creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedPod {
    pub cloud_id: PodId,
    pub initial_state: PodPhase,
}

/// Outcome of the bounded readiness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// The pod is reachable and initialisation completed.
    Ready,
    /// Transient: the pod is still coming up, try again next cycle.
    NotReady { reason: String },
    /// The pod will never become ready.
    Failed { reason: String },
}

/// The cloud surface consumed by the control plane.
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Request a pod named after the worker id. The store row must already
    /// exist (optimistic registration) so id uniqueness prevents duplicates.
    async fn create_pod(&self, worker_id: &str, spec: &PodSpec) -> CloudResult<CreatedPod>;

    /// Terminate a pod. An already-terminated or unknown pod is success.
    async fn terminate_pod(&self, cloud_id: &str) -> CloudResult<()>;

    async fn get_pod_state(&self, cloud_id: &str) -> CloudResult<PodState>;

    /// List pods for orphan-pod reconciliation.
    async fn list_pods(&self) -> CloudResult<Vec<PodSummary>>;

    /// Idempotent readiness probe over the pod's SSH endpoint.
    async fn initialize_pod(&self, cloud_id: &str) -> CloudResult<Readiness>;

    /// Cheap credential/endpoint check used at startup.
    async fn test_connectivity(&self) -> CloudResult<()>;
}
