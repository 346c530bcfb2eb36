//! Routing of core-bound envelopes to live connections
//!
//! The connection process runs one receive loop on the queue from core. Each
//! envelope names its connection; the router hands it to that connection's
//! supervisor without waiting, so one stalled connection never holds up the others.
//! Removing a route closes the supervisor's inbound channel, which the supervisor
//! treats as a shutdown request. Core asks for that by sending a GOODBYE envelope
//! down the queue.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;
use crate::ipc::EnvelopeSource;
use crate::types::{Envelope, PacketType};

/// Result of handing an envelope to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// No connection with that id is registered
    UnknownConnection,
    /// The connection is shutting down
    Closed,
    /// The connection's inbound channel was full; it has been told to shut down
    Overflow,
    /// A GOODBYE from core closed the connection
    ShutdownRequested,
}

#[derive(Debug, Default)]
pub struct ConnectionRouter {
    routes: Mutex<HashMap<u64, mpsc::Sender<Envelope>>>,
}

impl ConnectionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and return the receiving end of its inbound channel.
    ///
    /// A previous registration under the same id is replaced and its channel closed.
    pub fn register(&self, connection_id: u64, depth: usize) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(depth.max(1));
        if self.routes.lock().insert(connection_id, tx).is_some() {
            warn!("Connection {} registered twice, replacing route", connection_id);
        }
        rx
    }

    /// Remove a connection's route. Returns whether it was registered.
    pub fn deregister(&self, connection_id: u64) -> bool {
        let removed = self.routes.lock().remove(&connection_id).is_some();
        if removed {
            debug!("Connection {} deregistered", connection_id);
        }
        removed
    }

    /// Ask a connection to shut down by closing its inbound channel.
    pub fn close(&self, connection_id: u64) -> bool {
        self.deregister(connection_id)
    }

    pub fn contains(&self, connection_id: u64) -> bool {
        self.routes.lock().contains_key(&connection_id)
    }

    pub fn len(&self) -> usize {
        self.routes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.lock().is_empty()
    }

    /// Hand an envelope to its connection without waiting.
    ///
    /// A GOODBYE closes the connection instead of being delivered. A connection whose
    /// channel is full is not draining its terminal; it loses the envelope and is
    /// closed.
    pub fn dispatch(&self, envelope: Envelope) -> Delivery {
        let connection_id = envelope.connection_id;
        if envelope.packet_type() == PacketType::Goodbye {
            return if self.close(connection_id) {
                info!("Connection {}: shutdown requested by core", connection_id);
                Delivery::ShutdownRequested
            } else {
                Delivery::UnknownConnection
            };
        }

        let Some(tx) = self.routes.lock().get(&connection_id).cloned() else {
            return Delivery::UnknownConnection;
        };
        match tx.try_send(envelope) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
            Err(TrySendError::Full(envelope)) => {
                warn!(
                    "Connection {}: inbound channel full, dropping {:?} and closing",
                    connection_id,
                    envelope.packet_type()
                );
                self.close(connection_id);
                Delivery::Overflow
            }
        }
    }

    /// Receive loop for the queue from core.
    ///
    /// Runs until the queue closes or `cancel` fires. A malformed message ends the
    /// loop with an error.
    pub async fn run(
        self: Arc<Self>,
        mut source: Box<dyn EnvelopeSource>,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!("Router started");
        let mut routed = 0u64;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Router cancelled");
                    break;
                }
                next = source.recv() => next?,
            };
            let Some(envelope) = next else {
                info!("Queue from core closed after {} envelopes", routed);
                break;
            };

            let connection_id = envelope.connection_id;
            let packet_type = envelope.packet_type();
            match self.dispatch(envelope) {
                Delivery::Delivered | Delivery::ShutdownRequested => routed += 1,
                Delivery::UnknownConnection => {
                    warn!("Dropping {:?} for unknown connection {}", packet_type, connection_id)
                }
                Delivery::Closed => {
                    warn!("Dropping {:?} for closing connection {}", packet_type, connection_id)
                }
                Delivery::Overflow => {}
            }
        }
        Ok(())
    }
}
