use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::{config, forward, logging, telemetry, tunnel::TunnelMode};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _logrt_guard = logging::init(&cfg.logging)?;

    if cfg.forwards.is_empty() {
        anyhow::bail!("config: nothing to run (add at least one [[forwards]] entry)");
    }

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        server = %cfg.tunnel.server_addr,
        transport = %cfg.tunnel.transport,
        mode = %cfg.tunnel.mode,
        forwards = cfg.forwards.len(),
        metrics_addr = %cfg.metrics_addr,
        "konnect: starting"
    );

    if !cfg.metrics_addr.is_empty() {
        telemetry::init_prometheus(&cfg.metrics_addr)?;
    }

    let dialer = Arc::new(forward::TunnelDialer::from_config(&cfg.tunnel));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut tasks = JoinSet::new();

    // Shared tunnel upkeep.
    if cfg.tunnel.mode == TunnelMode::Reusable {
        let dialer = dialer.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { dialer.maintain(shutdown).await });
    }

    for fwd in &cfg.forwards {
        let fwd = fwd.clone();
        let dialer = dialer.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { forward::serve_forward_with_shutdown(fwd, dialer, shutdown).await });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            let _ = shutdown_tx.send(true);
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => return Err(err),
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    let drain = async {
        while let Some(res) = tasks.join_next().await {
            if let Ok(Err(err)) = res {
                tracing::debug!(err = %format!("{err:#}"), "shutdown: task ended with error");
            }
        }
    };

    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(
            timeout = %humantime::format_duration(DRAIN_TIMEOUT),
            "shutdown: drain timed out; aborting tasks"
        );
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
