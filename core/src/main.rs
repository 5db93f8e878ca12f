//! Zelana Coordinator
//!
//! Entry point: loads configuration, opens the task store, and runs the
//! worker server, the session manager and the debug API until Ctrl-C.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use zelana_config::CoordinatorConfig;
use zelana_coordinator::api::{ApiState, create_router};
use zelana_coordinator::coordinator::{Manager, ManagerConfig};
use zelana_coordinator::server::{ServerConfig, WorkerServer};
use zelana_coordinator::store::{MemoryTaskStore, RocksTaskStore, TaskStore};
use zelana_coordinator::verifier::verifier_from_config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = CoordinatorConfig::load()?;

    info!("============================================");
    info!(
        "        ZELANA COORDINATOR v{}             ",
        env!("CARGO_PKG_VERSION")
    );
    info!("============================================");
    info!("Worker listen     : {}", config.server.listen_addr);
    info!("Dispatch interval : {}ms", config.manager.dispatch_interval_ms);
    info!("Collection time   : {}s", config.manager.collection_time_secs);
    info!("Task order        : {}", config.manager.order_session);
    info!(
        "Database          : {}",
        if config.database.in_memory {
            "in-memory"
        } else {
            config.database.path.as_str()
        }
    );
    info!(
        "Verifier          : {}",
        if config.verifier.mock_mode {
            "mock"
        } else {
            config.verifier.endpoint.as_deref().unwrap_or("<unset>")
        }
    );
    info!("============================================");

    // Open task store
    let store: Arc<dyn TaskStore> = if config.database.in_memory {
        Arc::new(MemoryTaskStore::new())
    } else {
        Arc::new(RocksTaskStore::open(&config.database.path)?)
    };
    info!("Task store opened");

    // Start session manager
    let verifier = verifier_from_config(&config.verifier)?;
    let manager = Manager::new(ManagerConfig::from(&config.manager), store, verifier);
    manager.start()?;

    // Start worker server
    let server = WorkerServer::bind(ServerConfig::from(&config.server), Arc::clone(&manager)).await?;
    let worker_addr = server.local_addr()?;
    let server_shutdown = server.shutdown_token();
    let server_handle = tokio::spawn(server.run());

    // Start debug API
    if config.api.enabled {
        let addr: SocketAddr = format!("{}:{}", config.api.host, config.api.debug_port)
            .parse()
            .context("Invalid api.host / api.debug_port")?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind debug API on {addr}"))?;
        let router = create_router(ApiState::new(Arc::clone(&manager)));
        info!("Debug API listening on {}", addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!("Debug API stopped: {}", e);
            }
        });
    }

    info!("============================================");
    info!("  Zelana coordinator is ready!");
    info!("  Workers: {}", worker_addr);
    info!("============================================");

    // Wait for shutdown signal
    signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Connections close before the manager stops dispatching.
    info!("Closing worker connections...");
    server_shutdown.cancel();
    match server_handle.await {
        Ok(Err(e)) => error!("Worker server error: {}", e),
        Err(e) => error!("Worker server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    info!("Stopping session manager...");
    manager.stop().await;

    info!("Zelana coordinator stopped");
    Ok(())
}
