//! Entry point: parses the CLI, loads the mode's TOML config, wires up
//! structured logging and the metrics server, and runs the pipeline until
//! `SIGINT`/`SIGTERM` or the source is exhausted (spec.md §4.8, §6).

use clap::Parser;
use sql_replay::cli::{Cli, Mode};
use sql_replay::config::{FileModeConfig, StreamModeConfig};
use sql_replay::metrics::{run_metrics_server, ReplayMetrics};
use sql_replay::{error::AppResult, supervisor};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    let exit_code = match run(cli).await {
        Ok(true) => 1, // stop-on-error fired
        Ok(false) => 0,
        Err(e) => {
            tracing::error!(error = %e, "sql-replay exited with error");
            1
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

/// Runs the selected mode to completion. Returns `Ok(true)` if stop-on-error
/// fired during the run, which `main` reports as a nonzero exit code.
async fn run(cli: Cli) -> AppResult<bool> {
    let cancel = CancellationToken::new();
    install_signal_handler(cancel.clone());

    match cli.mode {
        Mode::Replay { config } => {
            let cfg = FileModeConfig::load(&config)?;
            let metrics = Arc::new(ReplayMetrics::new()?);
            let metrics_task = spawn_metrics_server(&cfg.metrics_bind_addr, cfg.metrics_port, metrics.clone(), cancel.clone());
            let fatal = supervisor::run_file(cfg, metrics, cancel.clone()).await?;
            cancel.cancel();
            let _ = metrics_task.await;
            Ok(fatal)
        }
        Mode::ReplayStream { config } => {
            let cfg = StreamModeConfig::load(&config)?;
            tracing::info!(sasl = %cfg.sasl_summary(), brokers = ?cfg.brokers, topic = %cfg.topic, "starting replay-stream");
            let metrics = Arc::new(ReplayMetrics::new()?);
            let metrics_task = spawn_metrics_server(&cfg.metrics_bind_addr, cfg.metrics_port, metrics.clone(), cancel.clone());
            let fatal = supervisor::run_stream(cfg, metrics, cancel.clone()).await?;
            cancel.cancel();
            let _ = metrics_task.await;
            Ok(fatal)
        }
    }
}

fn spawn_metrics_server(
    bind_addr: &str,
    port: u16,
    metrics: Arc<ReplayMetrics>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let bind_addr = bind_addr.to_string();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&bind_addr, port, metrics, cancel).await {
            tracing::error!(error = %e, "metrics server stopped with an error");
        }
    })
}

/// Cancels the root token on `SIGINT`/`SIGTERM` (spec.md §4.8: the pipeline
/// drains in place of being killed out from under an in-flight execution).
fn install_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(error = %e, "failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::info!("shutdown signal received, draining pipeline");
        cancel.cancel();
    });
}
