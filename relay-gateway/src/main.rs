//! The HTTP/WebSocket front door binary: loads configuration, builds the
//! `relay_core::Gateway`, wires it into an Axum router, and serves it with
//! graceful shutdown.
//!
//! Grounded on `dwctl::main`: `clap::Parser` args, `--validate` early exit,
//! `tokio::select!` between `ctrl_c` and `SIGTERM`, and a final
//! `gateway.shutdown()` call so background tasks stop cleanly once the HTTP
//! listener drains.

use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use relay_core::events::Event;
use relay_core::store::sqlite::SqliteStore;
use relay_core::store::Storage;
use relay_core::Gateway;

use relay_gateway::api;
use relay_gateway::config::{Args, Config};
use relay_gateway::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args)?;

    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    telemetry::init_telemetry()?;

    let store = SqliteStore::connect(&config.storage.path).await?;
    let storage: Arc<dyn relay_core::store::Storage> = Arc::new(store);

    let gateway = Arc::new(Gateway::new(
        storage,
        config.providers.clone(),
        config.limits(),
        config.health_config(),
        config.worker_config(),
    )?);

    let recovered = gateway.storage.startup_recovery().await?;
    if !recovered.is_empty() {
        tracing::warn!(count = recovered.len(), "recovered non-terminal requests from a previous run");
    }
    for request_id in recovered {
        gateway.bus.publish(Event::RequestFailed {
            request_id,
            error_code: "interrupted",
            at: Utc::now(),
        });
    }

    gateway.spawn_background_tasks();

    let router = api::build_router(gateway.clone());
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!(listen = %config.listen, "relay-gateway listening");

    axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await?;

    gateway.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl_c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
