//! Worker Transport
//!
//! TCP listener for prover workers. Each accepted socket runs the
//! `Handshaking -> Registered -> Closed` state machine in [`connection`].

pub mod connection;
pub mod handshake;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::coordinator::Manager;

pub use handshake::{HandshakeError, ReplayGuard};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub handshake_timeout: Duration,
    /// Interval between liveness probes.
    pub ping_interval: Duration,
    /// Read deadline; a connection silent for this long is dropped.
    pub pong_wait: Duration,
    pub max_frame_bytes: usize,
    /// Freshness window for register envelopes.
    pub auth_max_age: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&zelana_config::ServerConfig::default())
    }
}

impl From<&zelana_config::ServerConfig> for ServerConfig {
    fn from(toml: &zelana_config::ServerConfig) -> Self {
        Self {
            listen_addr: toml.listen_addr.clone(),
            handshake_timeout: Duration::from_secs(toml.handshake_timeout_secs),
            ping_interval: Duration::from_secs(toml.ping_interval_secs.max(1)),
            pong_wait: Duration::from_secs(toml.pong_wait_secs.max(1)),
            max_frame_bytes: toml.max_frame_bytes,
            auth_max_age: Duration::from_secs(toml.auth_max_age_secs),
        }
    }
}

pub struct WorkerServer {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    manager: Arc<Manager>,
    replay_guard: Arc<ReplayGuard>,
    shutdown: CancellationToken,
    connections: TaskTracker,
}

impl WorkerServer {
    pub async fn bind(config: ServerConfig, manager: Arc<Manager>) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind worker listener on {}", config.listen_addr))?;
        Ok(Self {
            listener,
            replay_guard: Arc::new(ReplayGuard::new(config.auth_max_age)),
            config: Arc::new(config),
            manager,
            shutdown: CancellationToken::new(),
            connections: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    /// Cancelling this token stops accepting and closes every live connection.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accepts workers until shutdown, then waits for their connections to
    /// finish closing.
    pub async fn run(self) -> Result<()> {
        info!(addr = %self.local_addr()?, "worker server listening");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "worker connection accepted");
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(%peer, error = %e, "failed to set TCP_NODELAY");
                        }
                        self.connections.spawn(connection::serve(
                            stream,
                            peer,
                            Arc::clone(&self.config),
                            Arc::clone(&self.manager),
                            Arc::clone(&self.replay_guard),
                            self.shutdown.child_token(),
                        ));
                    }
                    Err(e) => error!(error = %e, "accept failed"),
                },
            }
        }

        self.connections.close();
        info!(open = self.connections.len(), "closing worker connections");
        self.connections.wait().await;
        info!("worker server stopped");
        Ok(())
    }
}
