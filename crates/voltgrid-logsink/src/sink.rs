//! The batched asynchronous log sink.

use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use voltgrid_state::{LogLevel, LogRecord, OrchestratorConfig, SourceType};
use voltgrid_store::FleetStore;

/// Default local file receiving logging failures for post-mortem.
pub const DEFAULT_ERROR_FILE: &str = "db_logging_errors.log";

/// Errors surfaced by the sink lifecycle.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The log store could not be reached or the insert RPC is missing.
    /// Fatal iff `DB_LOGGING_REQUIRED=true`.
    #[error("log sink initialisation failed: {0}")]
    InitFailed(String),
}

/// Sink tunables.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub source_type: SourceType,
    pub source_id: String,
    /// Records below this level are not shipped.
    pub min_level: LogLevel,
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Queue bound; beyond it the oldest unsubmitted records are dropped.
    pub max_queue: usize,
    /// Per-batch submission attempts before the batch is discarded.
    pub max_submit_attempts: u32,
    /// Upper bound on the shutdown drain.
    pub shutdown_drain: Duration,
    /// Local file that receives initialisation failures for post-mortem.
    pub error_file: PathBuf,
}

impl SinkConfig {
    pub fn from_orchestrator(cfg: &OrchestratorConfig) -> Self {
        Self {
            source_type: SourceType::OrchestratorGpu,
            source_id: cfg.instance_id.clone(),
            min_level: cfg.db_log_level,
            batch_size: cfg.db_log_batch_size,
            flush_interval: cfg.db_log_flush_interval,
            max_queue: 2000,
            max_submit_attempts: 3,
            shutdown_drain: Duration::from_secs(10),
            error_file: PathBuf::from(DEFAULT_ERROR_FILE),
        }
    }
}

/// Point-in-time sink statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkStats {
    pub queued: u64,
    pub sent: u64,
    pub dropped: u64,
    pub errors: u64,
    pub batches: u64,
    pub alive: bool,
}

struct SinkInner {
    store: Arc<dyn FleetStore>,
    cfg: SinkConfig,
    queue: Mutex<VecDeque<LogRecord>>,
    /// Cycle context stamped onto records at enqueue time. One value per
    /// sink instance; never thread-local, so unrelated callers in the same
    /// process cannot leak into each other's context.
    cycle: Mutex<Option<u64>>,
    queued: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
    batches: AtomicU64,
    alive: AtomicBool,
}

/// The log sink. Construct with [`LogSink::connect`], then [`start`]
/// explicitly; [`stop`] drains up to a bounded deadline.
///
/// [`start`]: LogSink::start
/// [`stop`]: LogSink::stop
pub struct LogSink {
    inner: Arc<SinkInner>,
    worker: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl LogSink {
    /// Probe the log store and build a sink. On failure the diagnostic is
    /// appended to the configured local file and written to stderr, which
    /// is always available even when the store is not.
    pub async fn connect(store: Arc<dyn FleetStore>, cfg: SinkConfig) -> Result<Self, SinkError> {
        if let Err(err) = store.test_connectivity().await {
            let detail = format!("log store unreachable: {err}");
            record_init_failure(&cfg, &detail);
            return Err(SinkError::InitFailed(detail));
        }
        info!(source_id = %cfg.source_id, "log sink connected");
        Ok(Self::assemble(store, cfg))
    }

    fn assemble(store: Arc<dyn FleetStore>, cfg: SinkConfig) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                store,
                cfg,
                queue: Mutex::new(VecDeque::new()),
                cycle: Mutex::new(None),
                queued: AtomicU64::new(0),
                sent: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                batches: AtomicU64::new(0),
                alive: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start the background flush task. Idempotent.
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = self.inner.clone();
        inner.alive.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(run_flush_loop(inner, shutdown_rx));
        *worker = Some((shutdown_tx, handle));
        debug!("log sink flush task started");
    }

    /// Stop the flush task, draining the queue up to the configured
    /// deadline. Records still pending after the deadline are dropped and
    /// counted.
    pub async fn stop(&self) {
        let taken = self.worker.lock().unwrap().take();
        if let Some((shutdown_tx, handle)) = taken {
            let _ = shutdown_tx.send(true);
            let _ = handle.await;
        }
    }

    /// Attempt a single restart after a failed health probe.
    pub async fn restart(&self) -> Result<(), SinkError> {
        warn!("restarting log sink");
        self.stop().await;
        if let Err(err) = self.inner.store.test_connectivity().await {
            let detail = format!("log store unreachable on restart: {err}");
            record_init_failure(&self.inner.cfg, &detail);
            return Err(SinkError::InitFailed(detail));
        }
        self.start();
        Ok(())
    }

    /// Set (or clear) the cycle number attached to subsequent records.
    pub fn set_cycle(&self, cycle: Option<u64>) {
        *self.inner.cycle.lock().unwrap() = cycle;
    }

    /// Enqueue a plain record. Non-blocking; never raises.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.log_with(level, message, None, None, serde_json::Value::Null);
    }

    /// Enqueue a record with worker/task context and metadata.
    pub fn log_with(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        worker_id: Option<String>,
        task_id: Option<String>,
        metadata: serde_json::Value,
    ) {
        if level < self.inner.cfg.min_level {
            return;
        }
        let record = LogRecord {
            timestamp: Utc::now(),
            source_type: self.inner.cfg.source_type,
            source_id: self.inner.cfg.source_id.clone(),
            log_level: level,
            message: message.into(),
            task_id,
            worker_id,
            cycle_number: *self.inner.cycle.lock().unwrap(),
            metadata,
        };
        self.enqueue(record);
    }

    fn enqueue(&self, record: LogRecord) {
        let mut queue = self.inner.queue.lock().unwrap();
        queue.push_back(record);
        self.inner.queued.fetch_add(1, Ordering::Relaxed);
        while queue.len() > self.inner.cfg.max_queue {
            queue.pop_front();
            let dropped = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % 100 == 1 {
                eprintln!("WARNING: log sink queue full, dropped {dropped} records total");
            }
        }
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            queued: self.inner.queued.load(Ordering::Relaxed),
            sent: self.inner.sent.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            errors: self.inner.errors.load(Ordering::Relaxed),
            batches: self.inner.batches.load(Ordering::Relaxed),
            alive: self.inner.alive.load(Ordering::SeqCst),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    /// Pending records not yet submitted.
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }
}

async fn run_flush_loop(inner: Arc<SinkInner>, mut shutdown: watch::Receiver<bool>) {
    // Short poll so the batch-size trigger fires promptly between interval
    // flushes.
    let poll = Duration::from_millis(200).min(inner.cfg.flush_interval);
    let mut last_flush = tokio::time::Instant::now();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(poll) => {
                let pending = inner.queue.lock().unwrap().len();
                let interval_due = pending > 0 && last_flush.elapsed() >= inner.cfg.flush_interval;
                if pending >= inner.cfg.batch_size || interval_due {
                    flush_once(&inner).await;
                    last_flush = tokio::time::Instant::now();
                }
            }
            _ = shutdown.changed() => {
                drain(&inner).await;
                break;
            }
        }
    }

    inner.alive.store(false, Ordering::SeqCst);
    debug!("log sink flush task stopped");
}

/// Pop one batch and submit it with bounded retry. On exhaustion the batch
/// is discarded and counted.
async fn flush_once(inner: &Arc<SinkInner>) {
    let batch: Vec<LogRecord> = {
        let mut queue = inner.queue.lock().unwrap();
        let take = queue.len().min(inner.cfg.batch_size);
        queue.drain(..take).collect()
    };
    if batch.is_empty() {
        return;
    }

    let mut attempt = 1;
    loop {
        match inner.store.insert_logs_batch(&batch).await {
            Ok(()) => {
                inner.sent.fetch_add(batch.len() as u64, Ordering::Relaxed);
                inner.batches.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(err) if attempt < inner.cfg.max_submit_attempts => {
                let delay = Duration::from_millis(100 * 2u64.pow(attempt - 1));
                warn!(attempt, error = %err, "log batch submission failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                inner.errors.fetch_add(batch.len() as u64, Ordering::Relaxed);
                error!(
                    batch = batch.len(),
                    error = %err,
                    "log batch discarded after retry exhaustion"
                );
                return;
            }
        }
    }
}

/// Shutdown drain: flush until empty or the deadline passes, then drop and
/// count the remainder. Never silent loss without accounting.
async fn drain(inner: &Arc<SinkInner>) {
    let deadline = tokio::time::Instant::now() + inner.cfg.shutdown_drain;
    while !inner.queue.lock().unwrap().is_empty() && tokio::time::Instant::now() < deadline {
        flush_once(inner).await;
    }
    let remainder = {
        let mut queue = inner.queue.lock().unwrap();
        let n = queue.len();
        queue.clear();
        n
    };
    if remainder > 0 {
        inner.dropped.fetch_add(remainder as u64, Ordering::Relaxed);
        eprintln!("WARNING: log sink dropped {remainder} records at shutdown");
    }
}

/// Append the initialisation failure to the local error file and stderr.
fn record_init_failure(cfg: &SinkConfig, detail: &str) {
    eprintln!("CRITICAL: {detail}");
    record_logging_failure(&cfg.error_file, detail);
}

/// Append a logging failure to the local post-mortem file. Used both for
/// initialisation failures and for the driver's periodic degraded notices;
/// the file stays writable when the store is not.
pub fn record_logging_failure(error_file: &std::path::Path, detail: &str) {
    let line = format!("{} {detail}\n", Utc::now().to_rfc3339());
    let written = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(error_file)
        .and_then(|mut file| file.write_all(line.as_bytes()));
    match written {
        Ok(()) => error!(file = %error_file.display(), "logging failure recorded"),
        Err(io_err) => error!(error = %io_err, "could not record logging failure to file"),
    }
}
