//! Connection process: TCP listener plus the router loop

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::router::ConnectionRouter;
use super::supervisor::ConnectionSupervisor;
use crate::config::LinkConfig;
use crate::ipc::{EnvelopeSink, EnvelopeSource};
use crate::{ProtocolError, Result};

/// Accepts terminal connections and runs a supervisor for each.
pub struct PacketServer {
    config: LinkConfig,
    router: Arc<ConnectionRouter>,
    upstream: Arc<dyn EnvelopeSink>,
    next_connection_id: AtomicU64,
}

impl PacketServer {
    pub fn new(config: LinkConfig, upstream: Arc<dyn EnvelopeSink>) -> Self {
        Self {
            config,
            router: Arc::new(ConnectionRouter::new()),
            upstream,
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn router(&self) -> Arc<ConnectionRouter> {
        self.router.clone()
    }

    /// Allocate a process-unique connection id. Ids start at 1; 0 never names a connection.
    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Run the whole connection process: route envelopes arriving on `source` from
    /// core and serve terminals on `listener` until `cancel` fires or something
    /// fatal happens.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        source: Box<dyn EnvelopeSource>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let router = self.router.clone();
        let router_cancel = cancel.child_token();
        let mut router_task = tokio::spawn(router.run(source, router_cancel.clone()));

        let result = tokio::select! {
            served = self.serve(listener, cancel.clone()) => served,
            routed = &mut router_task => match routed {
                Ok(Ok(())) => Err(ProtocolError::queue_closed("core to connection process")),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(ProtocolError::task_failed("router", e)),
            },
        };
        router_cancel.cancel();
        result
    }

    /// Accept loop.
    ///
    /// A supervisor that leaks tasks during shutdown ends the loop with its error.
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<ProtocolError>(1);
        if let Ok(addr) = listener.local_addr() {
            info!("Listening for terminals on {}", addr);
        }
        let mut accept_errors = 0u32;

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Packet server cancelled");
                    return Ok(());
                }
                Some(fatal) = fatal_rx.recv() => {
                    error!("Fatal connection error: {}", fatal);
                    return Err(fatal);
                }
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => {
                    accept_errors = 0;
                    accepted
                }
                Err(e) => {
                    accept_errors += 1;
                    warn!("Accept failed ({}): {}", accept_errors, e);
                    let backoff = Duration::from_millis(50 * (1 << accept_errors.min(5)));
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
            }
            let connection_id = self.next_connection_id();
            info!("Accepted terminal {} as connection {}", peer, connection_id);

            let supervisor = ConnectionSupervisor::new(
                connection_id,
                self.config.clone(),
                self.router.clone(),
                self.upstream.clone(),
            );
            let fatal_tx = fatal_tx.clone();
            tokio::spawn(async move {
                match supervisor.run(stream).await {
                    Ok(reason) => info!("Connection {} closed ({})", connection_id, reason),
                    Err(e) if e.is_fatal() => {
                        let _ = fatal_tx.try_send(e);
                    }
                    Err(e) => warn!("Connection {} closed with error: {}", connection_id, e),
                }
            });
        }
    }
}
