mod background_service;
mod config;
mod dto;
mod infrastructure;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use colored::Colorize;
use domain::error::DispatchError;
use domain::model::entity::JobState;
use service::prelude::*;
use tokio_util::sync::CancellationToken;

use self::background_service::prelude::*;
use self::config::{build_config, AppConfig};
use self::infrastructure::database::JsonCheckpoint;
use self::infrastructure::ioc::build_manager;
use self::infrastructure::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1);
    let config = build_config(config_path.as_deref()).with_context(|| "Failed to build config".red())?;
    let app_config: AppConfig = config.try_deserialize().with_context(|| "Invalid config".red())?;

    init_telemetry(&app_config.log_level).with_context(|| "Failed to initialize logger".red())?;

    let store = Arc::new(JsonCheckpoint::new(&app_config.save_path));
    let records = store.load().await.with_context(|| "Cannot load checkpoint".red())?;

    let manager = build_manager(&app_config).await.with_context(|| "Cannot set up backends".red())?;
    let manager = Arc::new(manager);
    if !records.is_empty() {
        tracing::info!(records = records.len(), "Restoring jobs from checkpoint");
        manager.registry().restore(records);
        manager.resume().await;
    }

    let shutdown = CancellationToken::new();
    let mut background_services = manager.spawn_pollers(shutdown.clone());
    background_services.push(tokio::spawn(checkpoint(
        manager.clone(),
        store.clone(),
        Duration::from_secs(app_config.checkpoint_interval.max(1)),
        shutdown.clone(),
    )));
    background_services.push(tokio::spawn(report_events(manager.events(), shutdown.clone())));
    tracing::info!("jobq started");

    if let Some(jobs_file) = &app_config.jobs_file {
        let jobs = dto::load_manifest(jobs_file).await.with_context(|| "Cannot load jobs".red())?;
        for job in jobs {
            match manager.submit(job).await {
                Ok(id) => tracing::debug!(job_id = %id, "Accepted job"),
                Err(DispatchError::AlreadySubmitted(id)) => {
                    tracing::info!(job_id = %id, "Job is already tracked, skipping")
                }
                Err(e) => tracing::error!("{e}"),
            }
        }
    }

    let report_interval = Duration::from_secs(app_config.report_interval.max(1));
    tokio::select! {
        _ = wait_for_completion(manager.clone(), report_interval) => {
            tracing::info!("All jobs are done");
        }
        signal = tokio::signal::ctrl_c() => {
            signal.with_context(|| "Cannot listen for ctrl-c".red())?;
            tracing::info!("Stopping services (ctrl-c handling), unfinished jobs stay in the checkpoint");
        }
    }

    shutdown.cancel();
    for handle in background_services {
        if let Err(e) = handle.await {
            tracing::warn!("Background service ended abnormally: {e}");
        }
    }
    store
        .save(&manager.registry().snapshot())
        .await
        .with_context(|| "Cannot save final checkpoint".red())?;

    print_summary(&manager);
    Ok(())
}

fn print_summary(manager: &DispatchManager) {
    const STATES: [JobState; 8] = [
        JobState::Pending,
        JobState::Submitted,
        JobState::Queued,
        JobState::Running,
        JobState::Completed,
        JobState::Failed,
        JobState::Cancelled,
        JobState::Lost,
    ];

    for state in STATES {
        let ids = manager.list_by_state(state);
        if ids.is_empty() {
            continue;
        }
        let line = format!("{state}: {}", ids.len());
        let line = match state {
            JobState::Completed => line.green(),
            JobState::Failed | JobState::Lost => line.red(),
            JobState::Cancelled => line.yellow(),
            _ => line.normal(),
        };
        println!("{line}");
    }

    for record in manager.registry().snapshot() {
        if let Some(failure) = &record.result.failure {
            println!("  {} {}: {failure:?}", record.id(), record.state);
        }
    }
}
