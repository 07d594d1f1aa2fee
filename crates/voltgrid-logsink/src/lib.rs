//! voltgrid-logsink — the orchestrator's channel into the shared log store.
//!
//! A single explicitly-constructed [`LogSink`] instance is injected into the
//! driver (no process-wide globals). Enqueue is non-blocking and never
//! raises: records go into a mutex-guarded queue, a background task batches
//! and submits them through the store's `insert_logs_batch` RPC, and
//! overflow drops the oldest unsubmitted records with accounting.
//!
//! Initialisation fails loudly. When the log store cannot be reached the
//! failure is written to a local file, logged at CRITICAL to stderr, and
//! surfaced as an error the caller turns fatal when `DB_LOGGING_REQUIRED`
//! is set. Silent catch-and-continue is exactly the historical bug this
//! contract forbids.

mod sink;

pub use sink::{
    record_logging_failure, LogSink, SinkConfig, SinkError, SinkStats, DEFAULT_ERROR_FILE,
};
