use anyhow::{Context, Result};
use colored::Colorize;
use lifecycle::prelude::*;
use lifecycle::{SERVER_NAME, VERSION};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load the configuration: an optional TOML file plus LIFECYCLE__* variables.
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = ServerConfig::load(config_path.as_deref()).context("failed to load configuration")?;

    // 2. Initialize structured logging. RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    info!("{} v{} ({})", SERVER_NAME, VERSION, config.server_name);

    // 3. Build the server from the builtin catalog.
    let grace = Duration::from_millis(config.shutdown_grace_ms);
    let server = Server::new(config, &ComponentCatalog::builtin())?;
    spawn_report_listener(&server);

    // 4. Bring every component up. A failure tears down what was started.
    if let Err(err) = bring_up(&server).await {
        report_failure(&err);
        shutdown(&server, grace).await;
        std::process::exit(1);
    }
    info!(
        "{} is running with {} component(s). Press Ctrl+C to shut down.",
        SERVER_NAME,
        server.registry().len()
    );

    // 5. Wait for the shutdown signal.
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received.");
    shutdown(&server, grace).await;
    Ok(())
}

async fn bring_up(server: &Server) -> Result<(), LifecycleError> {
    server.init().await?;
    server.start().await
}

/// Stops (when something was started) and destroys the server, giving up
/// after `grace`.
async fn shutdown(server: &Server, grace: Duration) {
    let teardown = async {
        if matches!(
            server.state(),
            ServerState::Started | ServerState::Failed(Phase::Start)
        ) {
            if let Err(err) = server.stop().await {
                report_failure(&err);
            }
        }
        if let Err(err) = server.destroy().await {
            report_failure(&err);
        }
    };
    if tokio::time::timeout(grace, teardown).await.is_err() {
        warn!("Shutdown did not complete within {:?}; exiting anyway.", grace);
    } else {
        info!("Server is {}.", server.state());
    }
}

/// Logs every per-component step of each phase.
fn spawn_report_listener(server: &Server) {
    let mut reports = server.subscribe_reports();
    tokio::spawn(async move {
        while let Ok(report) = reports.recv().await {
            match report.kind {
                ReportKind::Dispatched { order } => {
                    info!("[{}] dispatching to [{}]", report.phase, order.join(", "));
                }
                ReportKind::ComponentSucceeded { component, .. } => {
                    info!("[{}] {} done", report.phase, component);
                }
                ReportKind::ComponentFailed { failure } => {
                    warn!("[{}] {} failed: {}", report.phase, failure.sender, failure);
                }
                ReportKind::Completed { .. } | ReportKind::Failed { .. } => {}
            }
        }
    });
}

fn report_failure(err: &LifecycleError) {
    error!("[{}] {}", err.as_label(), err);
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        error!("  caused by: {}", cause);
        source = cause.source();
    }
    match err {
        LifecycleError::Phase(failure) => eprintln!(
            "{} component '{}' failed to {} (root cause in '{}')",
            "error:".red().bold(),
            failure.sender,
            failure.phase,
            failure.root_sender()
        ),
        other => eprintln!("{} {}", "error:".red().bold(), other),
    }
}
