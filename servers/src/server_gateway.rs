//! # Gateway Server
//!
//! Serves the command/event gateway over WebSocket. The backend is the
//! in-memory one, optionally seeded from a JSON file, which makes this binary
//! a development transport rather than a production deployment.
//!
//! Startup order: `.env`, configuration layers, logging, settings, backend,
//! router, then the event pump and the listener. Ctrl-C or SIGTERM cancels a
//! shared token that the listener, every socket loop and the router observe.

use std::sync::Arc;

use anyhow::Result;
use lib_gateway::Router;
use lib_gateway::backend::{MemoryBackend, MemorySessionStore};
use lib_gateway::retrieve::HttpCatalog;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod gateway_logic;
use gateway_logic::{config, downstream, logger};

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = signal::ctrl_c() => info!("Ctrl-C received, initiating shutdown"),
                    _ = term.recv() => info!("SIGTERM received, initiating shutdown"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                let _ = signal::ctrl_c().await;
                info!("Ctrl-C received, initiating shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        info!("Ctrl-C received, initiating shutdown");
    }
}

fn report(result: Result<Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => info!("Downstream server stopped"),
        Ok(Err(e)) => warn!(error = %e, "Downstream server failed"),
        Err(e) => warn!(error = %e, "Downstream task aborted"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = config::load_config()?;
    let _log_guard = logger::setup_logging(&config.log_dir(), config.log_level())?;

    let settings = config.gateway_settings()?;
    let seed = config.seed()?;
    let sessions = seed.sessions.clone();
    let backend = Arc::new(MemoryBackend::with_seed(seed));
    let store = Arc::new(MemorySessionStore::from_records(sessions));
    let events = backend.take_events();

    let catalog = HttpCatalog::from_settings(&settings.remote)?;
    let mut builder = Router::builder(settings, backend.clone(), store);
    if catalog.is_configured() {
        builder = builder.catalog(Arc::new(catalog));
    }
    if config.admin() {
        builder = builder.admin();
    }
    let router = builder.build();
    router.start();
    info!(commands = router.commands().len(), auth = router.settings().auth, "Router started");

    let shutdown = CancellationToken::new();

    let pump = events.map(|mut rx| {
        let router = Arc::clone(&router);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => { router.ingest(event); }
                        None => break,
                    },
                }
            }
        })
    });

    let state = downstream::AppState {
        router: Arc::clone(&router),
        shutdown: shutdown.clone(),
    };
    let mut downstream_handle = tokio::spawn(downstream::run(config.clone(), state));

    let mut downstream_done = false;
    tokio::select! {
        _ = wait_for_signal() => {}
        result = &mut downstream_handle => {
            downstream_done = true;
            report(result);
        }
    }

    shutdown.cancel();
    router.shutdown();
    if !downstream_done {
        report(downstream_handle.await);
    }
    if let Some(pump) = pump {
        let _ = pump.await;
    }
    info!("Shutdown complete");
    Ok(())
}
