//! voltgrid-scaler — scaling decisions and their guardrails.
//!
//! [`ScalingPlanner`] turns the sampled workload and fleet snapshot into a
//! desired worker count and a spawn/drain decision:
//!
//! ```text
//! workload = queued_only + active_only
//! ideal    = ceil(workload / tasks_per_worker)    (0 when workload is 0)
//! desired  = clamp(max(min_fleet, ideal + idle_buffer), ..=max_fleet)
//! capacity = active + spawning                    (terminating excluded)
//!
//! desired > capacity  → spawn the difference (safety valve permitting)
//! capacity > desired  → drain surplus idle workers, oldest-idle first,
//!                       never below min_fleet
//! ```
//!
//! [`FailureRateValve`] blocks spawn intents while recent worker failures
//! dominate the failure window, and reopens by itself as failures age out.
//! [`AnomalyDetector`] emits the observational anti-thrash events.

mod anomaly;
mod planner;
mod valve;

pub use anomaly::AnomalyDetector;
pub use planner::{PlanInputs, ScalePlan, ScalingLimits, ScalingPlanner};
pub use valve::FailureRateValve;
