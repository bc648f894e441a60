//! Wires the CLI, config, and core components together and drives one run (§6, §7).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::cli::Args;
use crate::config::Config;
use crate::db::Database;
use crate::enumerator::Enumerator;
use crate::error::{AppError, RunOutcome};
use crate::filter::BaseModelFilter;
use crate::http::HttpClient;
use crate::queue::{TaskStatus, TaskStore};
use crate::rate::RateGovernor;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::supervisor;

/// How often the emergency-stop sentinel is polled (§7).
const EMERGENCY_STOP_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Parses arguments, wires the core, and runs one batch to completion (§6.5).
///
/// # Errors
/// Returns [`AppError`] for configuration, database, or enumeration failures that should
/// abort the run rather than fail a single task.
pub async fn run(args: Args) -> Result<RunOutcome, AppError> {
    let config = Config::from_args(args)?;
    init_tracing(config.verbose, config.quiet);

    info!(target = ?config.target, output_dir = %config.output_dir.display(), "starting run");

    if supervisor::emergency_stop_requested(&config.state_dir) {
        warn!("emergency stop sentinel already present at startup, aborting");
        return Ok(RunOutcome::EmergencyStop);
    }

    let db = Database::new(&config.task_db_path()).await?;
    let store = TaskStore::new(db);

    let resumed = store.resume().await?;
    if resumed > 0 {
        info!(resumed, "moved in-flight tasks back to pending after restart");
    }

    let recovery = supervisor::recover_orphan_tmp_files(&config.output_dir, &store).await?;
    info!(
        deleted = recovery.deleted,
        left_for_resume = recovery.left_for_resume,
        "startup orphan .tmp scan complete"
    );

    let client = Arc::new(HttpClient::new(config.api_token.clone())?);
    let rate = RateGovernor::new(&[]);
    let (events, mut event_rx) = crate::events::channel();
    tokio::spawn(async move { while event_rx.recv().await.is_some() {} });

    let filter = BaseModelFilter::new(&config.base_model_whitelist);
    let mut enumerator = Enumerator::new(
        Arc::clone(&client),
        rate.clone(),
        store.clone(),
        config.output_dir.clone(),
        filter,
    );
    let enumeration_stats = enumerator.run(&config.target).await?;
    info!(
        models_seen = enumeration_stats.models_seen,
        accepted = enumeration_stats.versions_accepted,
        rejected = enumeration_stats.versions_rejected,
        enqueued = enumeration_stats.tasks_enqueued,
        "enumeration complete"
    );

    let scheduler_config = SchedulerConfig::from_max_concurrent_downloads(
        config.max_concurrent_downloads,
    );
    let scheduler = Scheduler::new(
        store.clone(),
        client,
        rate,
        config.output_dir.clone(),
        scheduler_config,
        events.clone(),
    );

    spawn_cancellation_watchers(scheduler.clone(), config.state_dir.clone());

    let stats = scheduler.run().await;
    info!(
        completed = stats.completed,
        skipped = stats.skipped,
        failed = stats.failed,
        requeued = stats.requeued,
        "scheduler run complete"
    );

    write_failed_summary(&config.output_dir, &store).await?;

    if scheduler.is_global_halt() && supervisor::emergency_stop_requested(&config.state_dir) {
        return Ok(RunOutcome::EmergencyStop);
    }

    if stats.failed > 0 {
        Ok(RunOutcome::PartialFailure)
    } else {
        Ok(RunOutcome::Success)
    }
}

/// Installs a Ctrl-C listener and an emergency-stop poller, both of which cancel and halt
/// the scheduler (§4.9 Cancellation, §7 Emergency stop).
fn spawn_cancellation_watchers(scheduler: Scheduler, state_dir: std::path::PathBuf) {
    let ctrl_c_scheduler = scheduler.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("received interrupt signal, cancelling in-flight work");
            ctrl_c_scheduler.cancel();
            ctrl_c_scheduler.set_global_halt(true);
        }
    });

    let halted = Arc::new(AtomicBool::new(false));
    tokio::spawn(async move {
        loop {
            if supervisor::emergency_stop_requested(&state_dir) {
                if !halted.swap(true, Ordering::SeqCst) {
                    warn!("emergency stop sentinel detected, halting all pipelines");
                    scheduler.cancel();
                    scheduler.set_global_halt(true);
                }
                break;
            }
            tokio::time::sleep(EMERGENCY_STOP_POLL_INTERVAL).await;
        }
    });
}

/// Writes `<root>/failed.txt`: one line per failed/quarantined task, machine-readable (§7).
async fn write_failed_summary(root: &std::path::Path, store: &TaskStore) -> Result<(), AppError> {
    let mut failed = store.list_by_status(TaskStatus::Failed).await?;
    failed.extend(store.list_by_status(TaskStatus::Quarantined).await?);

    if failed.is_empty() {
        return Ok(());
    }

    let mut contents = String::new();
    for task in &failed {
        contents.push_str(&format!(
            "{}\t{}\t{}\t{}\n",
            task.id,
            task.kind,
            task.last_error_class.as_deref().unwrap_or(""),
            task.last_error_message.as_deref().unwrap_or("").replace('\n', " "),
        ));
    }

    tokio::fs::write(root.join("failed.txt"), contents).await?;
    Ok(())
}

fn init_tracing(verbose: u8, quiet: bool) {
    let default_level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
