use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use devrun::clienv;
use devrun::dashboard::{Dashboard, DashboardConfig, DEFAULT_DASHBOARD_HOST, DEFAULT_DASHBOARD_PORT};
use devrun::orchestrator::log_buffer::DEFAULT_MAX_LINES;
use devrun::orchestrator::{LogBuffer, LogEntry, Orchestrator, StreamKind, DEFAULT_GRACE_PERIOD};
use devrun::user_config::UserConfig;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::args::RunArgs;

pub(crate) async fn cmd_run(args: RunArgs) -> anyhow::Result<()> {
    let user = UserConfig::load()?;
    let plan = super::resolve_plan(&args.source, &user)?;

    for err in &plan.errors {
        error!("{}", err);
    }
    if plan.configs.is_empty() {
        anyhow::bail!("no runnable services in {}", plan.manifest_path.display());
    }

    let grace = args
        .grace_period_ms
        .or(user.grace_period_ms)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_GRACE_PERIOD);
    let logs = Arc::new(LogBuffer::new(
        user.log_buffer_lines.unwrap_or(DEFAULT_MAX_LINES),
    ));
    let orchestrator = Arc::new(Orchestrator::new(plan.configs, logs)?.with_grace_period(grace));

    let dashboard = if args.no_dashboard {
        None
    } else {
        let config = DashboardConfig {
            host: clienv::dashboard_host().unwrap_or_else(|| DEFAULT_DASHBOARD_HOST.to_string()),
            port: args
                .dashboard_port
                .or_else(clienv::dashboard_port)
                .or(user.dashboard_port)
                .unwrap_or(DEFAULT_DASHBOARD_PORT),
        };
        let dashboard = Dashboard::bind(&config, Arc::clone(&orchestrator))
            .await
            .context("Failed to start the dashboard API")?;
        Some(dashboard)
    };

    let stop = CancellationToken::new();
    let printer = tokio::spawn(print_logs(orchestrator.logs().subscribe(), stop.clone()));
    let server = dashboard.map(|d| tokio::spawn(d.serve(stop.clone())));

    orchestrator.launch();
    for svc in orchestrator.snapshot() {
        match svc.url {
            Some(url) => info!("{} -> {}", svc.name, url),
            None => info!("{} (no port)", svc.name),
        }
    }
    info!("Press Ctrl+C to stop all services");

    wait_for_shutdown_signal().await?;

    orchestrator.shutdown().await;
    stop.cancel();

    if let Some(server) = server {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Dashboard API stopped with an error: {}", e),
            Err(e) => warn!("Dashboard API task failed: {}", e),
        }
    }
    let _ = printer.await;

    for svc in orchestrator.snapshot() {
        match svc.exit_code {
            Some(code) => info!("{}: {} (exit code {})", svc.name, svc.status, code),
            None => info!("{}: {}", svc.name, svc.status),
        }
    }
    Ok(())
}

/// Interleave every service's output on our own stdout/stderr, prefixed with its name.
async fn print_logs(mut rx: broadcast::Receiver<LogEntry>, stop: CancellationToken) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            entry = rx.recv() => match entry {
                Ok(entry) => match entry.stream {
                    StreamKind::Stdout => println!("[{}] {}", entry.service, entry.text),
                    StreamKind::Stderr => eprintln!("[{}] {}", entry.service, entry.text),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Console fell behind, skipped {} log line(s)", skipped)
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
