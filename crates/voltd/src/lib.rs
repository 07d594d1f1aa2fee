//! voltd — the voltgrid control loop driver.
//!
//! One logical loop, invoked every `ORCHESTRATOR_POLL_SEC` seconds. Each
//! cycle samples demand and fleet state from the store, promotes and
//! health-checks workers, recovers orphaned tasks, plans scaling (gated by
//! the failure-rate safety valve), executes spawn/drain intents, and writes
//! a summary into the log sink. Cycles never overlap; a failed step
//! abandons the cycle and the next one starts fresh from store state.

pub mod driver;
pub mod error;

pub use driver::ControlLoop;
pub use error::OrchestratorError;
