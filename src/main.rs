//! WebUI Launcher - Bootstrap, supervise and recover a local Open WebUI container
//!
//! Headless host for the lifecycle engine: loads the configuration, runs the
//! setup pipeline, reports progress through the log and keeps the container
//! supervised until Ctrl-C.

#![allow(dead_code)] // Parts of the engine API are only used by embedding hosts

mod core;
mod persistence;
mod platform;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use single_instance::SingleInstance;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::core::{
    AppConfiguration, EngineComponents, ExportFormat, LifecycleState, LogBuffer, Orchestrator,
    UpdateOutcome,
};
use crate::persistence::{Database, DATABASE_FILE};

/// Application name constant
pub const APP_NAME: &str = "WebUILauncher";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Days of lifecycle history kept in the database
const HISTORY_RETENTION_DAYS: u32 = 30;

const LOG_FILE: &str = "launcher.log";

#[tokio::main]
async fn main() -> Result<()> {
    let db = Arc::new(Database::open(
        &AppConfiguration::default()
            .get_data_directory()
            .join(DATABASE_FILE),
    )?);
    db.initialize()?;

    let mut config = match db.load_configuration()? {
        Some(config) => config,
        None => {
            let config = AppConfiguration::default();
            db.save_configuration(&config)?;
            config
        }
    };
    config.apply_env_overrides();
    config.validate();

    let app_logs = config
        .enable_diagnostics
        .then(|| LogBuffer::new(config.app_log_capacity));
    let _log_guard = init_logging(&config.get_logs_directory(), app_logs.clone())?;

    info!("{} v{} starting...", APP_NAME, APP_VERSION);

    // Ensure only one launcher manages the container
    let instance = SingleInstance::new(APP_NAME).context("Failed to create single instance lock")?;
    if !instance.is_single() {
        error!("Another instance of {} is already running!", APP_NAME);
        eprintln!("{} is already running!", APP_NAME);
        return Ok(());
    }

    match db.cleanup_history(HISTORY_RETENTION_DAYS) {
        Ok(0) => {}
        Ok(removed) => info!("Pruned {} old lifecycle history entries", removed),
        Err(e) => warn!("Failed to prune lifecycle history: {}", e),
    }

    let components = EngineComponents::standard(&config, Some(db.clone()), app_logs)?;
    let orchestrator = Arc::new(Orchestrator::new(config, components));
    let reporter = tokio::spawn(report_progress(orchestrator.clone()));

    if orchestrator.config().auto_start_container {
        orchestrator.start().await;
    } else {
        info!("Auto-start is disabled; waiting for Ctrl-C");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("{} shutting down", APP_NAME);
    orchestrator.stop().await;
    reporter.abort();
    Ok(())
}

/// Initialize logging: console, a log file and optionally the diagnostics ring
fn init_logging(log_dir: &Path, app_logs: Option<LogBuffer>) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir).context(format!("Failed to create {:?}", log_dir))?;

    let file_appender = tracing_appender::rolling::never(log_dir, LOG_FILE);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("webui_launcher=info"));

    let buffer_layer = app_logs.map(|buffer| {
        tracing_subscriber::fmt::layer()
            .with_writer(buffer)
            .with_ansi(false)
            .with_target(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .with(buffer_layer)
        .init();

    Ok(guard)
}

/// Follow lifecycle changes: open the browser once ready, save a report on failure
async fn report_progress(orchestrator: Arc<Orchestrator>) {
    let mut rx = orchestrator.subscribe();
    let mut last = rx.borrow().state.kind();
    let mut update_checked = false;

    while rx.changed().await.is_ok() {
        let state = rx.borrow_and_update().state.clone();
        if state.kind() == last {
            continue;
        }
        last = state.kind();

        match &state {
            LifecycleState::Ready => {
                let config = orchestrator.config();
                println!("{} is ready at {}", APP_NAME, config.service_url());
                if config.open_browser_when_ready {
                    if let Err(e) = open::that(config.service_url()) {
                        warn!("Failed to open browser: {}", e);
                    }
                }
                // Once per launch; the restart onto a new image is Ready again
                if config.check_for_updates && config.allow_registry_pull && !update_checked {
                    update_checked = true;
                    tokio::spawn(apply_update(orchestrator.clone()));
                }
            }
            LifecycleState::Error(message) => {
                eprintln!("{}", message);
                if orchestrator.config().enable_diagnostics {
                    save_report(&orchestrator).await;
                }
            }
            other => println!("{}", other.describe()),
        }
    }
}

async fn save_report(orchestrator: &Orchestrator) {
    let collector = orchestrator.diagnostics();
    let report = collector.collect().await;
    let dir = orchestrator.config().get_logs_directory();
    match collector.export_to(&report, ExportFormat::Markdown, &dir).await {
        Ok(path) => eprintln!("Diagnostic report saved to {}", path.display()),
        Err(e) => warn!("Could not save diagnostic report: {}", e),
    }
}

async fn apply_update(orchestrator: Arc<Orchestrator>) {
    match orchestrator.update().await {
        Ok(UpdateOutcome::Updated) => info!("Now running the newest image"),
        Ok(UpdateOutcome::UpToDate) => {}
        Err(e) => warn!("Update check failed: {}", e.user_message()),
    }
}
