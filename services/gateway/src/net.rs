//! Device-facing TCP listener.

use crate::gateway::Gateway;
use crate::session::run_session;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

/// Handle to the bound device listener.
pub struct DeviceListener {
    local_addr: SocketAddr,
}

impl DeviceListener {
    /// Bind the device port and start accepting connections; each accepted
    /// socket gets its own session task.
    pub async fn start(
        gateway: Arc<Gateway>,
        bind: &str,
        shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(bind).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "device listener bound");

        let mut accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    changed = accept_shutdown.changed() => {
                        if changed.is_err() || *accept_shutdown.borrow() { break; }
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _peer)) => {
                                tokio::spawn(run_session(
                                    gateway.clone(),
                                    stream,
                                    shutdown.clone(),
                                ));
                            }
                            Err(e) => {
                                warn!(error = %e, "accept error");
                            }
                        }
                    }
                }
            }
            info!("device listener stopped");
        });

        Ok(DeviceListener { local_addr })
    }

    /// The bound listen address (useful when port 0 was requested).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
