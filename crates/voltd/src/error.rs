//! The driver-level error taxonomy.

use thiserror::Error;

use voltgrid_cloud::CloudError;
use voltgrid_logsink::SinkError;
use voltgrid_state::ConfigError;
use voltgrid_store::StoreError;

/// Everything that can abort a cycle or startup. Per-worker failures are
/// absorbed below this level; what reaches the driver is cycle-fatal.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Logging(#[from] SinkError),
}

impl OrchestratorError {
    /// Short classification used in cycle-failure logs. Matched
    /// exhaustively so new variants cannot be silently mislabelled.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::Store(err) if err.is_transient() => "store_transient",
            OrchestratorError::Store(_) => "store",
            OrchestratorError::Cloud(err) if err.is_transient() => "cloud_transient",
            OrchestratorError::Cloud(_) => "cloud",
            OrchestratorError::Config(_) => "config",
            OrchestratorError::Logging(_) => "logging",
        }
    }
}
