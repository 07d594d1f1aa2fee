//! FakeCloud — scriptable in-memory [`CloudClient`] for tests.
//!
//! Pods start in `Provisioning`; tests drive phases and SSH reachability
//! explicitly and can inject failures for the next create or terminate.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use voltgrid_state::{PodPhase, PodSpec, PodState, PodSummary};

use crate::error::{CloudError, CloudResult};
use crate::{CloudClient, CreatedPod, Readiness};

#[derive(Debug, Clone)]
struct FakePod {
    name: String,
    phase: PodPhase,
    ssh_open: bool,
    ip: String,
    ssh_port: u16,
}

#[derive(Default)]
struct Inner {
    pods: BTreeMap<String, FakePod>,
    next_id: u64,
    terminated: Vec<String>,
    fail_next_create: Option<CloudError>,
    fail_next_terminate: Option<CloudError>,
}

/// In-memory cloud for tests.
#[derive(Default)]
pub struct FakeCloud {
    inner: Mutex<Inner>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move a pod to a phase. Unknown ids are ignored.
    pub fn set_phase(&self, cloud_id: &str, phase: PodPhase) {
        if let Some(pod) = self.inner.lock().unwrap().pods.get_mut(cloud_id) {
            pod.phase = phase;
        }
    }

    /// Toggle SSH reachability for the readiness probe.
    pub fn set_ssh_open(&self, cloud_id: &str, open: bool) {
        if let Some(pod) = self.inner.lock().unwrap().pods.get_mut(cloud_id) {
            pod.ssh_open = open;
        }
    }

    /// Mark every live pod running with SSH reachable.
    pub fn make_all_ready(&self) {
        for pod in self.inner.lock().unwrap().pods.values_mut() {
            if !pod.phase.is_dead() {
                pod.phase = PodPhase::Running;
                pod.ssh_open = true;
            }
        }
    }

    pub fn fail_next_create(&self, err: CloudError) {
        self.inner.lock().unwrap().fail_next_create = Some(err);
    }

    pub fn fail_next_terminate(&self, err: CloudError) {
        self.inner.lock().unwrap().fail_next_terminate = Some(err);
    }

    /// Register a pod that exists in the cloud but not in the store
    /// (orphan-pod reconciliation tests).
    pub fn add_unmanaged_pod(&self, cloud_id: &str, name: &str, phase: PodPhase) {
        self.inner.lock().unwrap().pods.insert(
            cloud_id.to_string(),
            FakePod {
                name: name.to_string(),
                phase,
                ssh_open: false,
                ip: "198.51.100.9".to_string(),
                ssh_port: 10022,
            },
        );
    }

    pub fn pod_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .pods
            .values()
            .filter(|p| !p.phase.is_dead())
            .count()
    }

    /// Ids passed to `terminate_pod`, in order.
    pub fn terminated_ids(&self) -> Vec<String> {
        self.inner.lock().unwrap().terminated.clone()
    }

    pub fn live_pod_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .pods
            .iter()
            .filter(|(_, p)| !p.phase.is_dead())
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[async_trait]
impl CloudClient for FakeCloud {
    async fn create_pod(&self, worker_id: &str, _spec: &PodSpec) -> CloudResult<CreatedPod> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = inner.fail_next_create.take() {
            return Err(err);
        }
        inner.next_id += 1;
        let cloud_id = format!("pod-{}", inner.next_id);
        let ssh_port = 10_000 + inner.next_id as u16;
        inner.pods.insert(
            cloud_id.clone(),
            FakePod {
                name: worker_id.to_string(),
                phase: PodPhase::Provisioning,
                ssh_open: false,
                ip: "203.0.113.7".to_string(),
                ssh_port,
            },
        );
        Ok(CreatedPod {
            cloud_id,
            initial_state: PodPhase::Provisioning,
        })
    }

    async fn terminate_pod(&self, cloud_id: &str) -> CloudResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = inner.fail_next_terminate.take() {
            return Err(err);
        }
        inner.terminated.push(cloud_id.to_string());
        // Unknown pod ids are success: the pod is already gone.
        if let Some(pod) = inner.pods.get_mut(cloud_id) {
            pod.phase = PodPhase::Terminated;
        }
        Ok(())
    }

    async fn get_pod_state(&self, cloud_id: &str) -> CloudResult<PodState> {
        let inner = self.inner.lock().unwrap();
        let pod = inner
            .pods
            .get(cloud_id)
            .ok_or_else(|| CloudError::not_found(format!("pod {cloud_id}")))?;
        let running = pod.phase == PodPhase::Running;
        Ok(PodState {
            cloud_id: cloud_id.to_string(),
            desired_status: pod.phase,
            actual_status: None,
            ip: running.then(|| pod.ip.clone()),
            ssh_port: running.then_some(pod.ssh_port),
            ssh_password: None,
            uptime_seconds: if running { 60 } else { 0 },
            hourly_cost: Some(0.69),
        })
    }

    async fn list_pods(&self) -> CloudResult<Vec<PodSummary>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .pods
            .iter()
            .map(|(id, pod)| PodSummary {
                cloud_id: id.clone(),
                name: pod.name.clone(),
                desired_status: pod.phase,
            })
            .collect())
    }

    async fn initialize_pod(&self, cloud_id: &str) -> CloudResult<Readiness> {
        let inner = self.inner.lock().unwrap();
        let pod = inner
            .pods
            .get(cloud_id)
            .ok_or_else(|| CloudError::not_found(format!("pod {cloud_id}")))?;
        Ok(match pod.phase {
            PodPhase::Failed | PodPhase::Terminated => Readiness::Failed {
                reason: "pod failed".to_string(),
            },
            PodPhase::Provisioning => Readiness::NotReady {
                reason: "pod still provisioning".to_string(),
            },
            PodPhase::Running if pod.ssh_open => Readiness::Ready,
            PodPhase::Running => Readiness::NotReady {
                reason: "ssh endpoint not reachable yet".to_string(),
            },
        })
    }

    async fn test_connectivity(&self) -> CloudResult<()> {
        Ok(())
    }
}
