//! Observational anti-thrash detection.
//!
//! These checks never gate anything; they emit [`Anomaly`] events the
//! driver writes into the log sink so operators see thrash patterns early.

use voltgrid_state::Anomaly;

/// Spawn intents at or above this in one cycle flag a rapid scale-up.
const RAPID_SCALE_UP_SPAWNS: u32 = 3;
/// Workload growth factor (or absolute jump from zero) that flags a spike.
const SPIKE_FACTOR: u64 = 10;
/// Consecutive starved cycles before the zero-workers anomaly fires.
const STARVATION_CYCLES: u32 = 3;

/// Carries the only cross-cycle state the driver keeps: the previous
/// workload and the starvation streak. Losing it on restart is harmless.
#[derive(Debug, Default)]
pub struct AnomalyDetector {
    prev_workload: Option<u64>,
    starved_cycles: u32,
}

impl AnomalyDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe one cycle and return any anomalies it exhibits.
    pub fn observe(
        &mut self,
        workload: u64,
        queued_only: u64,
        active_workers: u32,
        spawned: u32,
    ) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();

        if spawned >= RAPID_SCALE_UP_SPAWNS {
            anomalies.push(Anomaly::RapidScaleUp { spawned });
        }

        if let Some(previous) = self.prev_workload {
            let spiked = if previous == 0 {
                workload >= SPIKE_FACTOR
            } else {
                workload >= previous.saturating_mul(SPIKE_FACTOR)
            };
            if spiked {
                anomalies.push(Anomaly::WorkloadSpike {
                    previous,
                    current: workload,
                });
            }
        }
        self.prev_workload = Some(workload);

        if queued_only > 0 && active_workers == 0 {
            self.starved_cycles += 1;
            if self.starved_cycles >= STARVATION_CYCLES {
                anomalies.push(Anomaly::QueueStarvation {
                    cycles: self.starved_cycles,
                });
            }
        } else {
            self.starved_cycles = 0;
        }

        anomalies
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rapid_scale_up_fires_at_three_spawns() {
        let mut detector = AnomalyDetector::new();
        assert!(detector.observe(10, 10, 0, 2).is_empty());
        let anomalies = detector.observe(10, 10, 0, 3);
        assert!(anomalies.contains(&Anomaly::RapidScaleUp { spawned: 3 }));
    }

    #[test]
    fn workload_spike_requires_order_of_magnitude() {
        let mut detector = AnomalyDetector::new();
        detector.observe(2, 2, 1, 0);
        assert!(detector.observe(19, 19, 1, 0).is_empty());
        let anomalies = detector.observe(190, 190, 1, 0);
        assert!(anomalies.contains(&Anomaly::WorkloadSpike {
            previous: 19,
            current: 190
        }));
    }

    #[test]
    fn spike_from_zero_needs_absolute_jump() {
        let mut detector = AnomalyDetector::new();
        detector.observe(0, 0, 1, 0);
        assert!(detector.observe(9, 9, 1, 0).is_empty());

        let mut detector = AnomalyDetector::new();
        detector.observe(0, 0, 1, 0);
        let anomalies = detector.observe(10, 10, 1, 0);
        assert!(anomalies.contains(&Anomaly::WorkloadSpike {
            previous: 0,
            current: 10
        }));
    }

    #[test]
    fn first_cycle_never_spikes() {
        let mut detector = AnomalyDetector::new();
        assert!(detector.observe(1000, 1000, 0, 0).is_empty());
    }

    #[test]
    fn starvation_needs_three_consecutive_cycles() {
        let mut detector = AnomalyDetector::new();
        assert!(detector.observe(5, 5, 0, 0).is_empty());
        assert!(detector.observe(5, 5, 0, 0).is_empty());
        let anomalies = detector.observe(5, 5, 0, 0);
        assert!(anomalies.contains(&Anomaly::QueueStarvation { cycles: 3 }));
    }

    #[test]
    fn starvation_streak_resets_on_active_worker() {
        let mut detector = AnomalyDetector::new();
        detector.observe(5, 5, 0, 0);
        detector.observe(5, 5, 0, 0);
        // A worker came up: streak resets.
        assert!(detector.observe(5, 5, 1, 0).is_empty());
        assert!(detector.observe(5, 5, 0, 0).is_empty());
        assert!(detector.observe(5, 5, 0, 0).is_empty());
        let anomalies = detector.observe(5, 5, 0, 0);
        assert!(anomalies.contains(&Anomaly::QueueStarvation { cycles: 3 }));
    }
}
