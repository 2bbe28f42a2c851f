//! Worker process: one HTTP server sharing the listening port with its
//! siblings, plus the optional real-time and metrics listeners.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinSet;
use tracing::{info, info_span, Instrument};

use crate::broadcast::EventBroadcaster;
use crate::cache::connect_cache;
use crate::config::Config;
use crate::routes::{build_router, metrics_router};
use crate::scorer::ProcessScorer;
use crate::shutdown::shutdown_signal;
use crate::state::AppState;

const LISTEN_BACKLOG: u32 = 1024;

/// Runs one worker until a shutdown signal arrives. Every log line emitted
/// inside carries the worker pid.
pub async fn run(config: Config) -> Result<()> {
    let span = info_span!("worker", pid = std::process::id());
    serve(config).instrument(span).await
}

async fn serve(config: Config) -> Result<()> {
    let pid = std::process::id();

    // In production a missing shared cache is fatal; the supervisor restarts us.
    let cache = connect_cache(&config)
        .await
        .context("Cache backend unavailable")?;
    info!("Using {} cache backend", cache.name());

    let scorer = Arc::new(ProcessScorer::from_config(&config));
    let broadcaster = config
        .broadcast_enabled()
        .then(|| EventBroadcaster::new(config.environment));

    let state = AppState::new(config.clone(), cache, scorer, broadcaster.clone());

    let mut listeners = JoinSet::new();

    match &broadcaster {
        Some(broadcaster) => {
            let listener = bind_shared(config.websocket_port)
                .with_context(|| format!("Failed to bind real-time port {}", config.websocket_port))?;
            info!("Worker {pid} WebSocket monitoring on port {}", config.websocket_port);
            let router = broadcaster.clone().router();
            listeners.spawn(async move { axum::serve(listener, router).await });
        }
        None => info!("WebSocket disabled in local mode"),
    }

    if let Some(port) = config.metrics_port {
        let listener = bind_shared(port)
            .with_context(|| format!("Failed to bind metrics port {port}"))?;
        info!("Worker {pid} serving metrics on port {port}");
        let router = metrics_router(state.clone());
        listeners.spawn(async move { axum::serve(listener, router).await });
    }

    let app = build_router(state);
    let listener = bind_shared(config.port)
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    info!(
        "Worker {pid} listening on port {} in {} environment",
        config.port, config.environment
    );

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .into_future();

    tokio::select! {
        result = server => result.context("HTTP server failed")?,
        Some(joined) = listeners.join_next() => {
            joined
                .context("Listener task panicked")?
                .context("Listener failed")?;
            bail!("Listener stopped unexpectedly");
        }
    }

    listeners.shutdown().await;
    info!("Worker {pid} stopped");
    Ok(())
}

/// Binds `0.0.0.0:port` with address and port reuse, so every worker on the
/// host can accept on the same port and the kernel spreads connections.
pub fn bind_shared(port: u16) -> std::io::Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}
