use crate::config::{AppState, ReelflowConfig};
use anyhow::{Context, Result};
use reelflow_core::pipeline::{cancel_detached, RunMonitor, RunReport, Scheduler};
use reelflow_core::storage::StateStore;
use reelflow_core::types::{PipelineRun, RunId, RunState};
use reelflow_core::{PipelineError, SchedulerError, StoreError};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILED: u8 = 1;
pub const EXIT_CANCELED: u8 = 2;
pub const EXIT_RUNNING: u8 = 3;
pub const EXIT_USAGE: u8 = 64;

const CANCEL_POLL: Duration = Duration::from_millis(500);
const SNAPSHOT_INTERVAL: Duration = Duration::from_millis(500);

pub fn exit_code(state: RunState) -> u8 {
    match state {
        RunState::Success => EXIT_SUCCESS,
        RunState::Failed => EXIT_FAILED,
        RunState::Canceled => EXIT_CANCELED,
        RunState::Running => EXIT_RUNNING,
    }
}

/// Exit code for an error that ended a command
pub fn error_exit_code(err: &anyhow::Error) -> u8 {
    let usage = err.chain().any(|cause| {
        cause.is::<PipelineError>()
            || cause.is::<toml::de::Error>()
            || cause.is::<uuid::Error>()
            || matches!(
                cause.downcast_ref::<SchedulerError>(),
                Some(SchedulerError::DefinitionMismatch { .. })
                    | Some(SchedulerError::Store(StoreError::RunNotFound(_)))
            )
            || matches!(cause.downcast_ref::<StoreError>(), Some(StoreError::RunNotFound(_)))
    });
    if usage {
        EXIT_USAGE
    } else {
        EXIT_FAILED
    }
}

fn parse_run_id(run_id: &str) -> Result<RunId> {
    RunId::parse(run_id).with_context(|| format!("Invalid run id '{}'", run_id))
}

/// Whether opening the state store failed because another process holds it
fn store_in_use(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<redb::DatabaseError>(),
            Some(redb::DatabaseError::DatabaseAlreadyOpen)
        )
    })
}

fn with_version(mut config: ReelflowConfig, pipeline_version: Option<String>) -> ReelflowConfig {
    if let Some(version) = pipeline_version {
        config.pipeline.version = version;
    }
    config
}

pub async fn start(
    config: ReelflowConfig,
    partition: String,
    pipeline_version: Option<String>,
) -> Result<u8> {
    let app = AppState::new(with_version(config, pipeline_version))?;
    let scheduler = app.scheduler()?;
    let run_id = scheduler.start(&partition)?;
    println!("Started run {}", run_id);

    drive(&app, &scheduler, run_id).await
}

pub async fn resume(
    config: ReelflowConfig,
    run_id: &str,
    pipeline_version: Option<String>,
) -> Result<u8> {
    let run_id = parse_run_id(run_id)?;
    let app = AppState::new(with_version(config, pipeline_version))?;
    let scheduler = app.scheduler()?;
    println!("Resuming run {}", run_id);

    drive(&app, &scheduler, run_id).await
}

/// Drive a run in this process, cancelling on Ctrl-C or a cancel marker
async fn drive(app: &AppState, scheduler: &Scheduler, run_id: RunId) -> Result<u8> {
    let cancel = CancellationToken::new();
    let marker = app.config.cancel_marker(&run_id);

    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, cancelling run");
                cancel.cancel();
            }
        })
    };
    let watcher = tokio::spawn(watch_marker(marker.clone(), cancel.clone()));
    let snapshot = app.config.status_snapshot(&run_id);
    let publisher = tokio::spawn(publish_snapshots(monitor(app), run_id, snapshot.clone()));

    let result = scheduler.drive(run_id, cancel).await;

    ctrl_c.abort();
    watcher.abort();
    publisher.abort();
    // Wait out an in-flight write so the final snapshot is the last one
    let _ = publisher.await;
    if marker.exists() {
        std::fs::remove_file(&marker).context("Failed to remove cancel marker")?;
    }
    if let Err(err) = write_snapshot(&monitor(app), &run_id, &snapshot) {
        tracing::warn!("Failed to write status snapshot: {:#}", err);
    }

    let run = result?;
    report(app, &run, false)?;
    Ok(exit_code(run.state))
}

async fn watch_marker(marker: PathBuf, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(CANCEL_POLL);
    loop {
        interval.tick().await;
        if marker.exists() {
            tracing::warn!("Cancel requested through {}", marker.display());
            cancel.cancel();
            return;
        }
    }
}

async fn publish_snapshots(monitor: RunMonitor, run_id: RunId, path: PathBuf) {
    let mut interval = tokio::time::interval(SNAPSHOT_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(err) = write_snapshot(&monitor, &run_id, &path) {
            tracing::warn!("Failed to write status snapshot: {:#}", err);
        }
    }
}

/// Replace the snapshot atomically so readers never see a partial file
fn write_snapshot(monitor: &RunMonitor, run_id: &RunId, path: &Path) -> Result<()> {
    let report = monitor.report(run_id)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create status directory")?;
    }
    let content = serde_json::to_vec_pretty(&report).context("Failed to serialize report")?;
    let staged = path.with_extension("json.tmp");
    std::fs::write(&staged, content).context("Failed to write status snapshot")?;
    std::fs::rename(&staged, path).context("Failed to publish status snapshot")?;
    Ok(())
}

fn monitor(app: &AppState) -> RunMonitor {
    RunMonitor::new(app.store.clone()).with_definition(app.definition.clone())
}

fn report(app: &AppState, run: &PipelineRun, json: bool) -> Result<()> {
    let report = monitor(app).report(&run.run_id)?;
    print_report(&report, json)
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?
        );
    } else {
        print!("{}", report);
    }
    Ok(())
}

/// Status of a run whose store is held by the process driving it
fn snapshot_status(path: &Path, json: bool) -> Result<u8> {
    if !path.exists() {
        println!("Run store is in use by an active run and no status snapshot exists yet");
        return Ok(EXIT_RUNNING);
    }

    let content = std::fs::read(path).context("Failed to read status snapshot")?;
    let report: RunReport =
        serde_json::from_slice(&content).context("Failed to parse status snapshot")?;
    if !json {
        println!("Store in use, showing the latest snapshot from the driving process");
    }
    print_report(&report, json)?;
    Ok(exit_code(report.run.state))
}

pub fn status(config: ReelflowConfig, run_id: &str, json: bool) -> Result<u8> {
    let run_id = parse_run_id(run_id)?;
    let snapshot = config.status_snapshot(&run_id);
    let app = match AppState::new(config) {
        Ok(app) => app,
        Err(err) if store_in_use(&err) => return snapshot_status(&snapshot, json),
        Err(err) => return Err(err),
    };

    let run = app.store.get_run(&run_id)?;
    report(&app, &run, json)?;
    Ok(exit_code(run.state))
}

pub fn cancel(config: ReelflowConfig, run_id: &str) -> Result<u8> {
    let run_id = parse_run_id(run_id)?;
    let marker = config.cancel_marker(&run_id);

    let app = match AppState::new(config) {
        Ok(app) => app,
        Err(err) if store_in_use(&err) => {
            // The driving process polls for this file
            if let Some(parent) = marker.parent() {
                std::fs::create_dir_all(parent).context("Failed to create cancel directory")?;
            }
            std::fs::write(&marker, b"").context("Failed to write cancel marker")?;
            println!("Cancel requested for active run {}", run_id);
            return Ok(EXIT_SUCCESS);
        }
        Err(err) => return Err(err),
    };

    // Nobody is driving the run, settle it here
    let run = cancel_detached(app.store.as_ref(), &run_id)?;
    report(&app, &run, false)?;
    Ok(exit_code(run.state))
}

pub fn validate(config: ReelflowConfig) -> Result<u8> {
    let definition = config.definition()?;

    println!(
        "Pipeline {}@{} is valid: {} tasks, max concurrency {}",
        definition.name(),
        definition.version(),
        definition.tasks().len(),
        definition.max_concurrency()
    );
    println!("Fingerprint: {}", definition.fingerprint());
    for (rank, task_id) in definition.dag().topological_order().iter().enumerate() {
        let upstream: Vec<String> = definition
            .dag()
            .dependencies(task_id)
            .iter()
            .map(|t| t.to_string())
            .collect();
        if upstream.is_empty() {
            println!("{:>3}. {}", rank + 1, task_id);
        } else {
            println!("{:>3}. {} <- {}", rank + 1, task_id, upstream.join(", "));
        }
    }
    Ok(EXIT_SUCCESS)
}

pub fn runs(config: ReelflowConfig) -> Result<u8> {
    let app = AppState::new(config)?;
    let monitor = RunMonitor::new(app.store.clone());

    let runs = monitor.list_runs()?;
    if runs.is_empty() {
        println!("No runs");
        return Ok(EXIT_SUCCESS);
    }

    println!(
        "{:<36}  {:<9}  {:<12}  {:<8}  STARTED",
        "RUN", "STATE", "PARTITION", "VERSION"
    );
    for run in runs {
        println!(
            "{:<36}  {:<9}  {:<12}  {:<8}  {}",
            run.run_id.to_string(),
            run.state.to_string(),
            run.partition,
            run.pipeline_version.to_string(),
            run.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(EXIT_SUCCESS)
}
