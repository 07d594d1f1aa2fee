//! voltd — the voltgrid daemon.
//!
//! Two modes:
//!
//! - **single** — run one orchestrator cycle, print the structured summary,
//!   exit 0 on success.
//! - **continuous** — loop every `ORCHESTRATOR_POLL_SEC` seconds until
//!   SIGINT/SIGTERM, then drain the log sink and exit 0.
//!
//! # Usage
//!
//! ```text
//! voltd single
//! voltd continuous
//! ```
//!
//! Configuration comes entirely from the environment; see
//! `OrchestratorConfig`, `StoreConfig`, and `RunpodConfig`.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use voltd::ControlLoop;
use voltgrid_cloud::{CloudClient, RunpodClient, RunpodConfig, WorkerWiring};
use voltgrid_logsink::{LogSink, SinkConfig};
use voltgrid_state::{OrchestratorConfig, SystemClock};
use voltgrid_store::{FleetStore, StoreConfig, SupabaseStore};

#[derive(Parser)]
#[command(name = "voltd", about = "voltgrid GPU fleet orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one cycle, print a structured summary, and exit.
    Single,
    /// Run the control loop until SIGINT/SIGTERM.
    Continuous,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,voltd=debug,voltgrid=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    // Fatal-at-startup configuration errors exit non-zero here.
    let cfg = OrchestratorConfig::from_env()?;
    let store_cfg = StoreConfig::from_env()?;
    let runpod_cfg = RunpodConfig::from_env()?;
    log_environment(&cfg, &runpod_cfg);

    let store: Arc<dyn FleetStore> = Arc::new(SupabaseStore::new(store_cfg.clone())?);
    let wiring = WorkerWiring::new(&store_cfg.base_url, &store_cfg.service_role_key);
    let cloud: Arc<dyn CloudClient> = Arc::new(RunpodClient::new(runpod_cfg.clone(), wiring)?);

    // The sink starts explicitly; its failure is fatal only when required.
    let sink = if cfg.enable_db_logging {
        match LogSink::connect(store.clone(), SinkConfig::from_orchestrator(&cfg)).await {
            Ok(sink) => {
                sink.start();
                info!(source_id = %cfg.instance_id, "database logging enabled");
                Some(Arc::new(sink))
            }
            Err(err) if cfg.db_logging_required => {
                error!(error = %err, "database logging required but unavailable");
                return Err(err.into());
            }
            Err(err) => {
                warn!(error = %err, "continuing with database logging disabled");
                None
            }
        }
    } else {
        None
    };

    let mut control_loop = ControlLoop::new(
        store,
        cloud,
        Arc::new(SystemClock),
        cfg.clone(),
        runpod_cfg.pod_spec(),
        sink.clone(),
    );

    let result = match cli.command {
        Command::Single => run_single(&mut control_loop).await,
        Command::Continuous => {
            run_continuous(&mut control_loop, cfg.poll_interval).await;
            Ok(())
        }
    };

    if let Some(sink) = sink {
        sink.stop().await;
        let stats = sink.stats();
        info!(
            sent = stats.sent,
            dropped = stats.dropped,
            errors = stats.errors,
            "log sink drained"
        );
    }

    result
}

async fn run_single(control_loop: &mut ControlLoop) -> anyhow::Result<()> {
    let summary = control_loop.run_cycle().await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn run_continuous(control_loop: &mut ControlLoop, poll_interval: Duration) {
    info!(
        poll_secs = poll_interval.as_secs(),
        "starting continuous mode"
    );

    loop {
        match control_loop.run_cycle().await {
            Ok(summary) => {
                info!(
                    cycle = summary.cycle,
                    decision = %summary.decision,
                    "cycle completed"
                );
            }
            Err(err) => {
                // The cycle is abandoned; state lives in the store, so the
                // next cycle starts fresh.
                error!(kind = err.kind(), error = %err, "cycle failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = shutdown_signal() => {
                info!("shutdown signal received");
                break;
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

/// Startup validation summary: which knobs are set, which credentials are
/// present. Key material itself never hits the logs.
fn log_environment(cfg: &OrchestratorConfig, runpod: &RunpodConfig) {
    info!(
        min_fleet = cfg.min_fleet,
        max_fleet = cfg.max_fleet,
        tasks_per_worker = cfg.tasks_per_worker,
        idle_buffer = cfg.machines_to_keep_idle,
        "scaling configuration"
    );
    info!(
        idle_timeout_s = cfg.idle_timeout.as_secs(),
        stuck_timeout_s = cfg.stuck_timeout.as_secs(),
        spawning_timeout_s = cfg.spawning_timeout.as_secs(),
        graceful_shutdown_s = cfg.graceful_shutdown_timeout.as_secs(),
        failsafe_stale_s = cfg.failsafe_stale_threshold.as_secs(),
        "timeout configuration"
    );
    info!(
        gpu_type = %runpod.gpu_type,
        image = %runpod.worker_image,
        storage = runpod.storage_name.as_deref().unwrap_or("<none>"),
        ssh_key_present = runpod.ssh_public_key.is_some(),
        "cloud configuration"
    );
    if runpod.ssh_public_key.is_none() {
        warn!("no SSH public key configured; pod readiness probes will not succeed");
    }
    // Two replicas double-scale the same fleet; the design assumes one.
    info!("single orchestrator replica assumed for this fleet");
}
