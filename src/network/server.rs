//! Bus Server
//!
//! Accepts inbound bus connections and runs the accepting side of the
//! join protocol on each of them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

use super::accept_join;
use crate::cluster::ClusterState;
use crate::error::{Error, Result};

/// Listener on this node's bus port
pub struct BusServer {
    /// Bound listener
    listener: TcpListener,
    /// Shared cluster state updated on every join
    state: Arc<ClusterState>,
    /// Timeout for reading the peer's hello
    handshake_timeout: Duration,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl BusServer {
    /// Bind the bus listener. Fails if the port is taken.
    pub async fn bind(
        bind_address: &str,
        state: Arc<ClusterState>,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind_address).await.map_err(|e| {
            Error::Network(format!("Failed to bind bus listener on {}: {}", bind_address, e))
        })?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            listener,
            state,
            handshake_timeout,
            shutdown,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until stopped
    pub async fn run(&self) -> Result<()> {
        tracing::info!("Bus server listening on {}", self.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let state = Arc::clone(&self.state);
                            let handshake_timeout = self.handshake_timeout;

                            tokio::spawn(async move {
                                if let Err(e) = socket.set_nodelay(true) {
                                    tracing::debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
                                }
                                if let Err(e) = accept_join(&state, socket, handshake_timeout).await {
                                    tracing::warn!("Join from {} failed: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Bus server stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}
