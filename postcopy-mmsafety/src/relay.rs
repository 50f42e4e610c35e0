//! Loopback TCP relay between the source's outbound migration URI and the
//! destination's incoming one.
//!
//! The two URIs are deliberately distinct so migration traffic passes
//! through something in the middle. When no external component fills that
//! spot, this relay does: it listens on the outbound address and pipes each
//! connection to the destination.

use crate::uri::MigrationUri;
use std::io;
use std::net::SocketAddr;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

pub struct MigrationRelay {
    listen: MigrationUri,
    target: MigrationUri,
}

impl MigrationRelay {
    pub fn new(listen: MigrationUri, target: MigrationUri) -> Self {
        Self { listen, target }
    }

    /// Bind the listening socket and start forwarding in the background.
    ///
    /// Binding happens before this returns, so a `migrate` issued afterwards
    /// cannot race the listener.
    pub async fn start(self) -> io::Result<RelayHandle> {
        let listener = TcpListener::bind(self.listen.socket_address()).await?;
        let local_addr = listener.local_addr()?;
        info!(
            "Migration relay listening on {} -> {}",
            local_addr, self.target
        );

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            listener,
            self.target.socket_address(),
            shutdown.clone(),
        ));

        Ok(RelayHandle {
            local_addr,
            task,
            shutdown: shutdown.drop_guard(),
        })
    }
}

/// Running relay. Dropping the handle also stops it.
pub struct RelayHandle {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
    shutdown: DropGuard,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(self) {
        let RelayHandle { task, shutdown, .. } = self;
        drop(shutdown);
        if let Err(e) = task.await {
            warn!("Migration relay task failed: {}", e);
        }
    }
}

async fn accept_loop(listener: TcpListener, target: String, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Migration relay shutting down");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        info!("Migration connection from {}", addr);
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Failed to set TCP_NODELAY: {}", e);
                        }
                        tokio::spawn(forward(stream, target.clone(), shutdown.child_token()));
                    }
                    Err(e) => warn!("Migration relay accept failed: {}", e),
                }
            }
        }
    }
}

async fn forward(mut inbound: TcpStream, target: String, shutdown: CancellationToken) {
    let mut outbound = match TcpStream::connect(&target).await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Migration relay could not reach {}: {}", target, e);
            return;
        }
    };
    if let Err(e) = outbound.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }

    tokio::select! {
        _ = shutdown.cancelled() => {
            debug!("Migration relay connection to {} cancelled", target);
        }
        result = copy_bidirectional(&mut inbound, &mut outbound) => match result {
            Ok((to_target, from_target)) => debug!(
                "Migration relay connection closed: {} bytes to {}, {} bytes back",
                to_target, target, from_target
            ),
            Err(e) => warn!("Migration relay connection to {} failed: {}", target, e),
        },
    }
}
