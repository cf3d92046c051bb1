//! Pulse engine - standalone entry point
//!
//! Runs the live engine over in-memory collaborators and logs every
//! notification. Useful for local development and load experiments.

use std::sync::Arc;

use pulse_core::{
    config::Config,
    engine::LiveEngine,
    events::{spawn_dispatcher, EventBus, LoggingSink},
    store::{InMemoryEntityStore, InMemoryRoomDirectory},
    telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = match std::env::var("PULSE_CONFIG_FILE") {
        Ok(path) => Config::from_file(&path)?,
        Err(_) => Config::load().unwrap_or_else(|e| {
            eprintln!("Warning: Could not load config: {}. Using defaults.", e);
            Config::default()
        }),
    };

    telemetry::init_telemetry(&config.telemetry())?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Pulse engine"
    );

    let store = Arc::new(InMemoryEntityStore::new());
    let rooms = Arc::new(InMemoryRoomDirectory::new());

    let (events, stream) = EventBus::channel(config.engine.event_channel_capacity);
    let dispatcher = spawn_dispatcher(stream, Arc::new(LoggingSink));

    let engine = LiveEngine::new(config.engine.clone(), store, rooms.clone(), rooms, events);
    let handle = engine.start();

    shutdown_signal().await;

    let outcome = handle.shutdown().await;
    tracing::info!(final_flush = ?outcome, "Engine stopped");

    // The dispatcher exits once every bus handle is gone.
    drop(engine);
    if let Err(e) = dispatcher.await {
        tracing::warn!(error = %e, "Event dispatcher ended abnormally");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
