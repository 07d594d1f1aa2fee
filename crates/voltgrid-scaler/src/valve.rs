//! The failure-rate safety valve.
//!
//! Blocks spawn intents when recent worker terminations dominate the
//! failure window: a high rate indicates a systemic problem (SSH auth,
//! image defects, quota) where every new pod would burn money and fail the
//! same way. The valve reopens by itself as failures age out of the window;
//! no manual reset exists. It only gates *new* spawns, never existing work.

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use voltgrid_state::{OrchestratorConfig, ValveState, Worker, WorkerStatus};

/// Windowed failure-ratio gate over the fleet history.
#[derive(Debug, Clone, Copy)]
pub struct FailureRateValve {
    /// Rate at or above which the valve closes.
    pub threshold: f64,
    pub window: Duration,
    /// Below this many recent workers the valve stays open.
    pub min_sample: u32,
}

impl FailureRateValve {
    pub fn from_config(cfg: &OrchestratorConfig) -> Self {
        Self {
            threshold: cfg.max_failure_rate,
            window: Duration::from_std(cfg.failure_window).unwrap_or_else(|_| Duration::minutes(30)),
            min_sample: cfg.min_workers_for_rate_check,
        }
    }

    /// Evaluate the valve over the full worker history.
    pub fn evaluate(&self, workers: &[Worker], now: DateTime<Utc>) -> ValveState {
        let cutoff = now - self.window;
        let recent: Vec<&Worker> = workers.iter().filter(|w| w.created_at >= cutoff).collect();

        if (recent.len() as u32) < self.min_sample {
            return ValveState::Open;
        }

        let failed = recent.iter().filter(|w| is_failure(w)).count();
        let rate = failed as f64 / recent.len() as f64;

        if rate >= self.threshold {
            warn!(
                recent = recent.len(),
                failed,
                rate = format!("{:.0}%", rate * 100.0),
                threshold = format!("{:.0}%", self.threshold * 100.0),
                "failure rate above threshold, blocking spawns"
            );
            ValveState::Closed {
                recent: recent.len() as u32,
                failed: failed as u32,
                rate,
            }
        } else {
            info!(
                recent = recent.len(),
                failed,
                rate = format!("{:.0}%", rate * 100.0),
                "failure rate within threshold"
            );
            ValveState::Open
        }
    }
}

/// A recent worker counts as failed when it errored, or when it reached
/// `terminated` through the error path (which preserves `error_reason`).
/// Graceful drains never set a reason and are not failures.
fn is_failure(worker: &Worker) -> bool {
    match worker.status {
        WorkerStatus::Error => true,
        WorkerStatus::Terminated => worker
            .metadata
            .error_reason
            .as_deref()
            .is_some_and(|reason| !reason.is_empty()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use voltgrid_state::WorkerMetadata;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn valve() -> FailureRateValve {
        FailureRateValve {
            threshold: 0.8,
            window: Duration::minutes(30),
            min_sample: 5,
        }
    }

    fn worker(id: &str, status: WorkerStatus, age_minutes: i64, reason: Option<&str>) -> Worker {
        Worker {
            id: id.to_string(),
            instance_type: "NVIDIA GeForce RTX 4090".to_string(),
            status,
            created_at: now() - Duration::minutes(age_minutes),
            last_heartbeat: None,
            metadata: WorkerMetadata {
                error_reason: reason.map(String::from),
                ..Default::default()
            },
        }
    }

    #[test]
    fn open_below_min_sample() {
        let workers = vec![
            worker("w1", WorkerStatus::Error, 5, Some("Spawning timeout")),
            worker("w2", WorkerStatus::Error, 5, Some("Spawning timeout")),
            worker("w3", WorkerStatus::Error, 5, Some("Spawning timeout")),
            worker("w4", WorkerStatus::Error, 5, Some("Spawning timeout")),
        ];
        assert_eq!(valve().evaluate(&workers, now()), ValveState::Open);
    }

    #[test]
    fn closes_at_threshold_boundary() {
        // 5 in window, 4 failed → 0.8 ≥ 0.8 → closed.
        let workers = vec![
            worker("w1", WorkerStatus::Terminated, 5, Some("Spawning timeout")),
            worker("w2", WorkerStatus::Terminated, 10, Some("Spawning timeout")),
            worker("w3", WorkerStatus::Terminated, 15, Some("Spawning timeout")),
            worker("w4", WorkerStatus::Terminated, 20, Some("Spawning timeout")),
            worker("w5", WorkerStatus::Active, 25, None),
        ];
        let state = valve().evaluate(&workers, now());
        assert!(matches!(
            state,
            ValveState::Closed { recent: 5, failed: 4, .. }
        ));
    }

    #[test]
    fn reopens_as_failures_age_out() {
        let mut workers = vec![
            worker("w1", WorkerStatus::Terminated, 5, Some("Spawning timeout")),
            worker("w2", WorkerStatus::Terminated, 10, Some("Spawning timeout")),
            worker("w3", WorkerStatus::Terminated, 15, Some("Spawning timeout")),
            worker("w4", WorkerStatus::Terminated, 20, Some("Spawning timeout")),
            worker("w5", WorkerStatus::Active, 25, None),
        ];
        assert!(!valve().evaluate(&workers, now()).is_open());

        // Oldest failure ages past the window: sample shrinks below minimum.
        workers[3].created_at = now() - Duration::minutes(45);
        assert!(valve().evaluate(&workers, now()).is_open());
    }

    #[test]
    fn graceful_drains_are_not_failures() {
        // Five recent workers, four drained gracefully (no error_reason).
        let workers = vec![
            worker("w1", WorkerStatus::Terminated, 5, None),
            worker("w2", WorkerStatus::Terminated, 10, None),
            worker("w3", WorkerStatus::Terminated, 15, None),
            worker("w4", WorkerStatus::Terminated, 20, None),
            worker("w5", WorkerStatus::Active, 25, None),
        ];
        assert!(valve().evaluate(&workers, now()).is_open());
    }

    #[test]
    fn old_workers_are_ignored() {
        let mut workers: Vec<Worker> = (0..6)
            .map(|i| {
                worker(
                    &format!("old-{i}"),
                    WorkerStatus::Error,
                    60 + i,
                    Some("Spawning timeout"),
                )
            })
            .collect();
        workers.push(worker("fresh", WorkerStatus::Active, 1, None));

        // The failures are all outside the window.
        assert!(valve().evaluate(&workers, now()).is_open());
    }

    #[test]
    fn error_status_counts_without_reason_check() {
        let workers: Vec<Worker> = (0..5)
            .map(|i| worker(&format!("w{i}"), WorkerStatus::Error, 5, Some("boom")))
            .collect();
        let state = valve().evaluate(&workers, now());
        assert!(matches!(state, ValveState::Closed { failed: 5, .. }));
    }
}
