//! voltgrid-state — shared domain types for the voltgrid control plane.
//!
//! These types represent workers, tasks, log records, pod state, scaling
//! decisions, and per-cycle summaries as they cross crate boundaries. The
//! worker/task rows live in the external task service; everything here is
//! the orchestrator's typed view of them.
//!
//! Also home to the [`Clock`] abstraction (injected into planners and health
//! checks so tests are deterministic) and [`OrchestratorConfig`] parsed from
//! the environment.

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::OrchestratorConfig;
pub use error::{ConfigError, ConfigResult};
pub use types::*;
