//! Command multiplexer
//!
//! Correlates commands sent to terminals with the response parts that come back.
//! A device has at most one live route; the route and the device's busy flag are
//! both RAII handles, so every way out of [`CommandMux::submit`] (reply, timeout,
//! closed route, error) releases them exactly once.
//!
//! ```text
//!  submit ──► busy flag ──► open route ──► CMD envelope ──► connection process
//!                               ▲
//!  packet loop ── route_response┘  (CMD_RESPONSE / FOTA_ACK by device id)
//! ```
//!
//! A command route also remembers its transaction id, so a part that answers an
//! earlier, timed-out command cannot leak into the next command's reply.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::registry::DeviceRegistry;
use super::txid::TransactionIds;
use crate::config::CommandConfig;
use crate::ipc::EnvelopeSink;
use crate::types::wire::cmd_status;
use crate::types::{CommandPayload, CommandResponse, Envelope, Packet, PacketType};
use crate::{ProtocolError, Result};

/// Route buffer; a response never has more parts than this.
const ROUTE_DEPTH: usize = u8::MAX as usize + 1;

/// Outcome of handing a terminal reply to its route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDelivery {
    Delivered,
    /// Nobody is waiting on this device
    NoRoute,
    /// The waiter already gave up
    Closed,
    /// The route's buffer is full
    Dropped,
    /// The reply answers a different command than the one waiting
    Stale,
}

/// Consolidated answer to one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    pub status: u8,
    /// Response parts ordered by sequence number
    pub parts: Vec<CommandResponse>,
}

impl CommandReply {
    fn synthesized(status: u8, transaction_id: u16) -> Self {
        Self { status, parts: vec![CommandResponse::status_only(status, transaction_id)] }
    }

    fn assembled(parts: Vec<CommandResponse>) -> Self {
        let status = parts
            .iter()
            .map(|p| p.status)
            .find(|s| *s != cmd_status::GOOD)
            .unwrap_or(cmd_status::GOOD);
        Self { status, parts }
    }

    pub fn is_success(&self) -> bool {
        self.status == cmd_status::GOOD
    }
}

#[derive(Debug)]
struct Route {
    generation: u64,
    /// Command awaiting CMD_RESPONSE parts; `None` for FOTA routes
    transaction_id: Option<u16>,
    tx: mpsc::Sender<Packet>,
}

type Routes = Mutex<HashMap<u64, Route>>;

/// A live route. Dropping it removes the route unless a newer one replaced it.
#[derive(Debug)]
pub struct RouteHandle<'a> {
    routes: &'a Routes,
    device_id: u64,
    generation: u64,
    rx: mpsc::Receiver<Packet>,
}

impl RouteHandle<'_> {
    /// Next reply for this device, `None` once the route was closed.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.rx.recv().await
    }
}

impl Drop for RouteHandle<'_> {
    fn drop(&mut self) {
        let mut routes = self.routes.lock();
        if routes.get(&self.device_id).is_some_and(|r| r.generation == self.generation) {
            routes.remove(&self.device_id);
            debug!("Device {}: route removed", self.device_id);
        }
    }
}

pub struct CommandMux {
    registry: Arc<DeviceRegistry>,
    downstream: Arc<dyn EnvelopeSink>,
    routes: Routes,
    generations: AtomicU64,
    txids: TransactionIds,
    config: CommandConfig,
}

impl CommandMux {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        downstream: Arc<dyn EnvelopeSink>,
        config: CommandConfig,
    ) -> Self {
        Self {
            registry,
            downstream,
            routes: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(1),
            txids: TransactionIds::core(),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn next_transaction_id(&self) -> u16 {
        self.txids.next()
    }

    pub fn has_route(&self, device_id: u64) -> bool {
        self.routes.lock().contains_key(&device_id)
    }

    /// Open a route for `device_id` that accepts every reply from the terminal.
    ///
    /// Callers hold the device's busy flag, so a live route already present is a bug.
    pub fn open_route(&self, device_id: u64) -> Result<RouteHandle<'_>> {
        self.insert_route(device_id, None)
    }

    /// Open a route that only accepts response parts for command `transaction_id`.
    pub fn open_command_route(&self, device_id: u64, transaction_id: u16) -> Result<RouteHandle<'_>> {
        self.insert_route(device_id, Some(transaction_id))
    }

    fn insert_route(&self, device_id: u64, transaction_id: Option<u16>) -> Result<RouteHandle<'_>> {
        let mut routes = self.routes.lock();
        if routes.get(&device_id).is_some_and(|r| !r.tx.is_closed()) {
            return Err(ProtocolError::RouteConflict { device_id });
        }
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(ROUTE_DEPTH);
        routes.insert(device_id, Route { generation, transaction_id, tx });
        debug!("Device {}: route opened", device_id);
        Ok(RouteHandle { routes: &self.routes, device_id, generation, rx })
    }

    /// Tear down a device's route; its waiter sees the route close.
    pub fn close_route(&self, device_id: u64) -> bool {
        let closed = self.routes.lock().remove(&device_id).is_some();
        if closed {
            info!("Device {}: outstanding route torn down", device_id);
        }
        closed
    }

    /// Hand a terminal reply to whoever is waiting on its device.
    pub fn route_response(&self, envelope: Envelope) -> RouteDelivery {
        let device_id = envelope.device_id;
        let Some((tx, expected)) =
            self.routes.lock().get(&device_id).map(|r| (r.tx.clone(), r.transaction_id))
        else {
            warn!(
                "Device {}: dropping {:?} {}, no route",
                device_id,
                envelope.packet_type(),
                envelope.packet.transaction_id
            );
            return RouteDelivery::NoRoute;
        };
        if let (Some(expected), PacketType::CmdResponse) = (expected, envelope.packet_type()) {
            // Undecodable parts still go through; the waiter reports them
            if let Ok(part) = CommandResponse::decode(&envelope.packet.payload) {
                if part.transaction_id != expected {
                    warn!(
                        "Device {}: dropping part for command {}, waiting on {}",
                        device_id, part.transaction_id, expected
                    );
                    return RouteDelivery::Stale;
                }
            }
        }
        match tx.try_send(envelope.packet) {
            Ok(()) => RouteDelivery::Delivered,
            Err(TrySendError::Closed(packet)) => {
                warn!("Device {}: dropping {:?}, route closed", device_id, packet.packet_type);
                RouteDelivery::Closed
            }
            Err(TrySendError::Full(packet)) => {
                warn!("Device {}: dropping {:?}, route full", device_id, packet.packet_type);
                RouteDelivery::Dropped
            }
        }
    }

    /// Ask the connection process to close `connection_id`.
    pub async fn disconnect(&self, connection_id: u64, device_id: u64) -> Result<()> {
        info!("Device {}: closing connection {}", device_id, connection_id);
        self.downstream.send(&Envelope::goodbye(connection_id, device_id)).await
    }

    /// Queue a packet for a terminal through the connection process.
    pub async fn forward(&self, connection_id: u64, device_id: u64, packet: Packet) -> Result<()> {
        self.downstream.send(&Envelope::new(packet, connection_id, device_id)).await
    }

    /// Send a command to a terminal and wait for its complete response.
    ///
    /// Admission failures, timeouts, torn-down routes and malformed parts come back
    /// as a synthesized single-part reply carrying the matching status. `Err` is
    /// reserved for fatal conditions such as a closed queue.
    pub async fn submit(
        &self,
        device_id: u64,
        command_type: u8,
        args: impl Into<Vec<u8>>,
    ) -> Result<CommandReply> {
        let txid = self.txids.next();
        let Some(connection_id) = self.registry.connection_for(device_id) else {
            warn!("Device {}: command {} for inactive terminal", device_id, command_type);
            return Ok(CommandReply::synthesized(cmd_status::SENT_TO_INACTIVE_CLIENT, txid));
        };
        let Some(_busy) = self.registry.try_acquire(device_id) else {
            warn!("Device {}: command {} rejected, terminal busy", device_id, command_type);
            return Ok(CommandReply::synthesized(cmd_status::TOO_MANY_OUTSTANDING_COMMANDS, txid));
        };
        let mut route = self.open_command_route(device_id, txid)?;

        let packet = CommandPayload::new(command_type, args).into_packet(txid)?;
        self.forward(connection_id, device_id, packet).await?;

        let window = self.config.timeout_for(command_type);
        let deadline = Instant::now() + window;
        debug!("Device {}: command {} as {} (timeout {:?})", device_id, command_type, txid, window);

        let mut parts = BTreeMap::new();
        loop {
            let packet = match tokio::time::timeout_at(deadline, route.recv()).await {
                Err(_) => {
                    warn!("Device {}: command {} timed out after {:?}", device_id, txid, window);
                    return Ok(CommandReply::synthesized(cmd_status::CMD_TIME_OUT, txid));
                }
                Ok(None) => {
                    warn!("Device {}: route closed while waiting for {}", device_id, txid);
                    return Ok(CommandReply::synthesized(cmd_status::ROUTE_CLOSED, txid));
                }
                Ok(Some(packet)) => packet,
            };
            if packet.packet_type != PacketType::CmdResponse {
                warn!("Device {}: ignoring {:?} during command", device_id, packet.packet_type);
                continue;
            }
            let part = match CommandResponse::decode(&packet.payload) {
                Ok(part) => part,
                Err(e) => {
                    warn!("Device {}: malformed response to {}: {}", device_id, txid, e);
                    return Ok(CommandReply::synthesized(cmd_status::MALFORMED_RESPONSE, txid));
                }
            };
            let expected = part.expected_parts();
            if parts.contains_key(&part.sequence_number) {
                warn!(
                    "Device {}: duplicate part {} of {}, ignored",
                    device_id, part.sequence_number, txid
                );
                continue;
            }
            parts.insert(part.sequence_number, part);
            if parts.len() >= expected {
                break;
            }
        }

        let reply = CommandReply::assembled(parts.into_values().collect());
        info!(
            "Device {}: command {} done, {} ({} parts)",
            device_id,
            command_type,
            cmd_status::name(reply.status),
            reply.parts.len()
        );
        Ok(reply)
    }
}
