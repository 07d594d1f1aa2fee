//! Desired-count computation and the per-cycle scaling decision.

use tracing::debug;

use voltgrid_state::{OrchestratorConfig, ScaleDecision, TaskCounts};

/// Fleet limits the planner operates under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingLimits {
    pub min_fleet: u32,
    pub max_fleet: u32,
    pub tasks_per_worker: u32,
    pub machines_to_keep_idle: u32,
}

impl ScalingLimits {
    pub fn from_config(cfg: &OrchestratorConfig) -> Self {
        Self {
            min_fleet: cfg.min_fleet,
            max_fleet: cfg.max_fleet,
            tasks_per_worker: cfg.tasks_per_worker,
            machines_to_keep_idle: cfg.machines_to_keep_idle,
        }
    }
}

/// Snapshot the planner consumes each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanInputs {
    pub counts: TaskCounts,
    pub spawning: u32,
    pub active: u32,
    pub terminating: u32,
    /// Active workers with no in-progress task, past the grace period.
    pub idle_active: u32,
}

/// The computed plan for one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalePlan {
    pub workload: u64,
    pub ideal: u32,
    pub desired: u32,
    pub capacity: u32,
    pub decision: ScaleDecision,
}

/// Pure desired-count planner; the driver executes its decisions.
#[derive(Debug, Clone, Copy)]
pub struct ScalingPlanner {
    limits: ScalingLimits,
}

impl ScalingPlanner {
    pub fn new(limits: ScalingLimits) -> Self {
        Self { limits }
    }

    pub fn plan(&self, inputs: &PlanInputs) -> ScalePlan {
        let limits = &self.limits;
        let workload = inputs.counts.workload();

        let ideal = if workload > 0 {
            u32::try_from(workload.div_ceil(limits.tasks_per_worker as u64))
                .unwrap_or(limits.max_fleet)
        } else {
            0
        };

        let desired = (ideal + limits.machines_to_keep_idle)
            .max(limits.min_fleet)
            .min(limits.max_fleet);

        let capacity = inputs.active + inputs.spawning;

        let decision = if desired > capacity {
            // Never request beyond the ceiling even if capacity accounting
            // drifted.
            let count = (desired - capacity).min(limits.max_fleet.saturating_sub(capacity));
            if count > 0 {
                ScaleDecision::SpawnUp { count }
            } else {
                ScaleDecision::Maintain
            }
        } else if capacity > desired {
            let surplus = capacity - desired;
            let drainable = surplus
                .min(inputs.idle_active)
                .min(inputs.active.saturating_sub(limits.min_fleet));
            if drainable > 0 {
                ScaleDecision::DrainDown { count: drainable }
            } else {
                ScaleDecision::Maintain
            }
        } else {
            ScaleDecision::Maintain
        };

        debug!(
            workload,
            ideal,
            desired,
            capacity,
            decision = %decision,
            "scaling plan computed"
        );

        ScalePlan {
            workload,
            ideal,
            desired,
            capacity,
            decision,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ScalingLimits {
        ScalingLimits {
            min_fleet: 2,
            max_fleet: 10,
            tasks_per_worker: 3,
            machines_to_keep_idle: 0,
        }
    }

    fn inputs(
        queued: u64,
        active_tasks: u64,
        spawning: u32,
        active: u32,
        idle_active: u32,
    ) -> PlanInputs {
        PlanInputs {
            counts: TaskCounts {
                queued_only: queued,
                active_only: active_tasks,
                total: queued + active_tasks,
            },
            spawning,
            active,
            terminating: 0,
            idle_active,
        }
    }

    #[test]
    fn empty_queue_at_min_fleet_maintains() {
        let planner = ScalingPlanner::new(limits());
        let plan = planner.plan(&inputs(0, 0, 0, 2, 2));
        assert_eq!(plan.desired, 2);
        assert_eq!(plan.capacity, 2);
        assert_eq!(plan.decision, ScaleDecision::Maintain);
    }

    #[test]
    fn cold_start_spawns_to_ideal() {
        // 7 queued, nothing running: ideal = ceil(7/3) = 3.
        let planner = ScalingPlanner::new(limits());
        let plan = planner.plan(&inputs(7, 0, 0, 0, 0));
        assert_eq!(plan.ideal, 3);
        assert_eq!(plan.desired, 3);
        assert_eq!(plan.decision, ScaleDecision::SpawnUp { count: 3 });
    }

    #[test]
    fn spawning_workers_count_as_capacity() {
        // Cycle 2 of a cold start: the 3 are still spawning.
        let planner = ScalingPlanner::new(limits());
        let plan = planner.plan(&inputs(7, 0, 3, 0, 0));
        assert_eq!(plan.capacity, 3);
        assert_eq!(plan.decision, ScaleDecision::Maintain);
    }

    #[test]
    fn desired_caps_at_max_fleet() {
        // 60 queued → ideal 20, capped at 10.
        let planner = ScalingPlanner::new(limits());
        let plan = planner.plan(&inputs(60, 0, 0, 0, 0));
        assert_eq!(plan.ideal, 20);
        assert_eq!(plan.desired, 10);
        assert_eq!(plan.decision, ScaleDecision::SpawnUp { count: 10 });
    }

    #[test]
    fn small_workload_still_gets_min_fleet() {
        // 3 queued → ideal 1, below the floor of 2.
        let planner = ScalingPlanner::new(limits());
        let plan = planner.plan(&inputs(3, 0, 0, 0, 0));
        assert_eq!(plan.desired, 2);
        assert_eq!(plan.decision, ScaleDecision::SpawnUp { count: 2 });
    }

    #[test]
    fn idle_buffer_adds_to_desired() {
        let planner = ScalingPlanner::new(ScalingLimits {
            machines_to_keep_idle: 2,
            ..limits()
        });
        let plan = planner.plan(&inputs(9, 0, 0, 0, 0));
        // ideal 3 + 2 idle buffer.
        assert_eq!(plan.desired, 5);
    }

    #[test]
    fn active_claims_count_toward_workload() {
        let planner = ScalingPlanner::new(limits());
        let plan = planner.plan(&inputs(2, 4, 0, 2, 0));
        assert_eq!(plan.workload, 6);
        assert_eq!(plan.ideal, 2);
        assert_eq!(plan.decision, ScaleDecision::Maintain);
    }

    #[test]
    fn surplus_idle_worker_is_drained() {
        // Scenario: 5 active, 4 busy with one task each, 1 idle, min 2.
        // workload 4 → desired 2; surplus 3 but only 1 idle.
        let planner = ScalingPlanner::new(limits());
        let plan = planner.plan(&inputs(0, 4, 0, 5, 1));
        assert_eq!(plan.desired, 2);
        assert_eq!(plan.decision, ScaleDecision::DrainDown { count: 1 });
    }

    #[test]
    fn drain_never_goes_below_min_fleet() {
        // Everything idle, no work: desired = min = 2; 3 active all idle.
        let planner = ScalingPlanner::new(limits());
        let plan = planner.plan(&inputs(0, 0, 0, 3, 3));
        assert_eq!(plan.decision, ScaleDecision::DrainDown { count: 1 });

        // Already at the floor: nothing to drain.
        let plan = planner.plan(&inputs(0, 0, 0, 2, 2));
        assert_eq!(plan.decision, ScaleDecision::Maintain);
    }

    #[test]
    fn busy_workers_are_not_drained() {
        // Over capacity but nobody idle: hold until tasks finish.
        let planner = ScalingPlanner::new(limits());
        let plan = planner.plan(&inputs(0, 3, 0, 5, 0));
        assert_eq!(plan.decision, ScaleDecision::Maintain);
    }

    #[test]
    fn terminating_workers_do_not_count_as_capacity() {
        let planner = ScalingPlanner::new(limits());
        let mut input = inputs(7, 0, 0, 2, 0);
        input.terminating = 4;
        let plan = planner.plan(&input);
        assert_eq!(plan.capacity, 2);
        assert_eq!(plan.decision, ScaleDecision::SpawnUp { count: 1 });
    }

    #[test]
    fn spawn_count_respects_ceiling_with_existing_capacity() {
        let planner = ScalingPlanner::new(limits());
        let plan = planner.plan(&inputs(60, 0, 4, 4, 0));
        assert_eq!(plan.capacity, 8);
        assert_eq!(plan.decision, ScaleDecision::SpawnUp { count: 2 });
    }
}
