//! Connection supervisor
//!
//! One supervisor owns one accepted terminal connection and coordinates five tasks
//! through channels:
//!
//! - **TCP reader**: framed packets from the terminal
//! - **TCP writer**: the only task writing to the socket, so outbound order is kept
//! - **Pulse timer**: periodic ledger scans
//! - **IPC reader**: envelopes routed to this connection from core
//! - **IPC writer**: envelopes pushed upstream to core
//!
//! The protocol decisions live in [`Link`], a synchronous state holder that turns each
//! event into [`LinkAction`]s. The async [`ConnectionSupervisor::run`] loop only moves
//! packets between channels and executes those actions.
//!
//! ## Shutdown
//!
//! Any link fault, ACK loss or shutdown request moves the link to
//! [`LinkState::ShuttingDown`]. Task groups are then stopped one at a time, each
//! signalled and joined before the next: timer, TCP pair, IPC pair. Device packets
//! the TCP reader queued before it stopped are still forwarded, and the IPC writer
//! drains everything queued for core before it exits. A group that fails to stop
//! within its limit is a fatal [`ProtocolError::ShutdownTimeout`]. Once all groups
//! are joined, a GOODBYE envelope goes upstream and the link is
//! [`LinkState::Closed`].

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::ledger::TransactionLedger;
use super::router::ConnectionRouter;
use crate::codec::Framer;
use crate::config::LinkConfig;
use crate::ipc::EnvelopeSink;
use crate::types::wire::ack_reason;
use crate::types::{Envelope, Hello, Packet, PacketType};
use crate::{ProtocolError, Result};

/// Consecutive undeliverable pulses before the timer reports a stalled supervisor.
const MAX_STALLED_PULSES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Active,
    ShuttingDown,
    Closed,
}

/// Side effect requested by [`Link`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    /// Write to the terminal
    ToDevice(Packet),
    /// Forward upstream to core
    ToCore(Packet),
    /// Tear the connection down
    Disconnect,
}

/// Why a connection left the `Active` state.
#[derive(Error, Debug)]
pub enum ShutdownReason {
    #[error("terminal closed the connection")]
    PeerClosed,
    #[error("link failed: {0}")]
    Link(#[source] ProtocolError),
    #[error("protocol violation: {0}")]
    Protocol(#[source] ProtocolError),
    #[error("device ACK lost")]
    AckTimeout,
    #[error("shutdown requested by core side")]
    ShutdownRequested,
    #[error("pulse timer stalled")]
    TimerStalled,
    #[error("upstream queue failed: {0}")]
    Upstream(#[source] ProtocolError),
}

/// Per-connection protocol state: lifecycle, transaction ledger and terminal identity.
#[derive(Debug)]
pub struct Link {
    connection_id: u64,
    device_id: u64,
    state: LinkState,
    ledger: TransactionLedger,
}

impl Link {
    pub fn new(connection_id: u64, ledger: TransactionLedger) -> Self {
        Self { connection_id, device_id: 0, state: LinkState::Active, ledger }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Leave `Active`. From here on nothing is written to the terminal.
    pub fn begin_shutdown(&mut self) {
        if self.state == LinkState::Active {
            self.transition(LinkState::ShuttingDown);
        }
    }

    pub fn close(&mut self) {
        if self.state != LinkState::Closed {
            self.transition(LinkState::Closed);
        }
    }

    fn transition(&mut self, to: LinkState) {
        debug!("Connection {}: {:?} -> {:?}", self.connection_id, self.state, to);
        self.state = to;
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Device id announced by HELLO, 0 before the handshake.
    pub fn device_id(&self) -> u64 {
        self.device_id
    }

    pub fn ledger(&self) -> &TransactionLedger {
        &self.ledger
    }

    /// Handle a packet read from the terminal.
    ///
    /// Device ACKs settle a ledger entry and go no further. Anything else is
    /// acknowledged first when the terminal asks for it, then forwarded to core.
    /// Once the link is shutting down packets are only forwarded.
    pub fn on_device_packet(&mut self, packet: Packet, now: Instant) -> Result<Vec<LinkAction>> {
        if packet.packet_type == PacketType::DeviceAck {
            self.ledger.pop(packet.transaction_id, now)?;
            return Ok(Vec::new());
        }

        let mut actions = Vec::with_capacity(2);
        if packet.ack_required && self.state == LinkState::Active {
            actions.push(LinkAction::ToDevice(Packet::server_ack(
                packet.transaction_id,
                ack_reason::ACK_GOOD,
            )));
        }
        if packet.packet_type == PacketType::Hello {
            let hello = Hello::decode(&packet.payload)?;
            if self.device_id != 0 && self.device_id != hello.device_id {
                warn!(
                    "Connection {} changed device id {} -> {}",
                    self.connection_id, self.device_id, hello.device_id
                );
            }
            info!(
                "Connection {} is device {} ({}, fw {})",
                self.connection_id, hello.device_id, hello.name, hello.fw_version
            );
            self.device_id = hello.device_id;
        }
        actions.push(LinkAction::ToCore(packet));
        Ok(actions)
    }

    /// Handle a packet routed from core for this terminal.
    pub fn on_core_packet(&mut self, packet: Packet, now: Instant) -> Result<Vec<LinkAction>> {
        if self.state != LinkState::Active {
            debug!(
                "Connection {}: dropping {:?} from core, link is {:?}",
                self.connection_id, packet.packet_type, self.state
            );
            return Ok(Vec::new());
        }
        if packet.ack_required {
            self.ledger.append(packet.transaction_id, now)?;
        }
        Ok(vec![LinkAction::ToDevice(packet)])
    }

    /// Periodic ledger scan. Any expired transaction ends the connection.
    pub fn on_pulse(&mut self, now: Instant) -> Vec<LinkAction> {
        if self.state != LinkState::Active {
            return Vec::new();
        }
        let expired = self.ledger.scan_timeouts(now);
        if expired.is_empty() {
            return Vec::new();
        }
        let mut actions: Vec<LinkAction> = expired.into_iter().map(LinkAction::ToCore).collect();
        actions.push(LinkAction::Disconnect);
        actions
    }
}

/// Owns one terminal connection from accept to close.
pub struct ConnectionSupervisor {
    connection_id: u64,
    config: LinkConfig,
    router: Arc<ConnectionRouter>,
    upstream: Arc<dyn EnvelopeSink>,
}

impl ConnectionSupervisor {
    pub fn new(
        connection_id: u64,
        config: LinkConfig,
        router: Arc<ConnectionRouter>,
        upstream: Arc<dyn EnvelopeSink>,
    ) -> Self {
        Self { connection_id, config, router, upstream }
    }

    /// Run the connection until it closes.
    ///
    /// Returns `Ok(reason)` after an orderly close (GOODBYE sent), or an error if a
    /// task group leaked or the GOODBYE could not be delivered.
    pub async fn run(self, stream: TcpStream) -> Result<ShutdownReason> {
        let Self { connection_id, config, router, upstream } = self;
        let depth = config.channel_depth.max(1);
        let (read_half, write_half) = stream.into_split();

        let (fault_tx, mut fault_rx) = mpsc::channel::<ShutdownReason>(8);
        let (device_tx, mut device_rx) = mpsc::channel::<Packet>(depth);
        let (writer_tx, writer_rx) = mpsc::channel::<Packet>(depth);
        let (core_in_tx, mut core_in_rx) = mpsc::channel::<Packet>(depth);
        let (core_out_tx, core_out_rx) = mpsc::channel::<Envelope>(depth);
        let (pulse_tx, mut pulse_rx) = mpsc::channel::<()>(1);

        let timer_cancel = CancellationToken::new();
        let tcp_cancel = CancellationToken::new();
        let ipc_cancel = CancellationToken::new();

        let timer = vec![tokio::spawn(pulse_task(
            connection_id,
            config.scan_interval(),
            pulse_tx,
            fault_tx.clone(),
            timer_cancel.clone(),
        ))];
        let tcp = vec![
            tokio::spawn(tcp_reader(
                connection_id,
                read_half,
                device_tx,
                fault_tx.clone(),
                tcp_cancel.clone(),
            )),
            tokio::spawn(tcp_writer(
                connection_id,
                write_half,
                writer_rx,
                fault_tx.clone(),
                tcp_cancel.clone(),
            )),
        ];
        let routed = router.register(connection_id, depth);
        let ipc = vec![
            tokio::spawn(ipc_reader(
                connection_id,
                router.clone(),
                routed,
                core_in_tx,
                ipc_cancel.clone(),
            )),
            tokio::spawn(ipc_writer(
                connection_id,
                core_out_rx,
                upstream.clone(),
                fault_tx,
                ipc_cancel.clone(),
            )),
        ];

        let mut link =
            Link::new(connection_id, TransactionLedger::new(config.max_outstanding, config.ack_timeout()));
        info!("Connection {} active", connection_id);

        let reason = loop {
            let outcome = tokio::select! {
                Some(fault) = fault_rx.recv() => break fault,
                packet = device_rx.recv() => match packet {
                    Some(packet) => {
                        trace!("Connection {}: device sent {:?}", connection_id, packet.packet_type);
                        link.on_device_packet(packet, Instant::now())
                    }
                    None => break ShutdownReason::PeerClosed,
                },
                packet = core_in_rx.recv() => match packet {
                    Some(packet) => {
                        trace!("Connection {}: core sent {:?}", connection_id, packet.packet_type);
                        link.on_core_packet(packet, Instant::now())
                    }
                    None => break ShutdownReason::ShutdownRequested,
                },
                Some(()) = pulse_rx.recv() => Ok(link.on_pulse(Instant::now())),
            };

            let actions = match outcome {
                Ok(actions) => actions,
                Err(e) => break ShutdownReason::Protocol(e),
            };
            if let Err(reason) =
                execute(&link, actions, &writer_tx, &core_out_tx).await
            {
                break reason;
            }
        };

        link.begin_shutdown();
        match &reason {
            ShutdownReason::PeerClosed | ShutdownReason::ShutdownRequested => {
                info!("Connection {} shutting down: {}", connection_id, reason)
            }
            _ => warn!("Connection {} shutting down: {}", connection_id, reason),
        }

        timer_cancel.cancel();
        join_group(connection_id, "timer", timer, config.timer_join()).await?;

        tcp_cancel.cancel();
        drop(writer_tx);
        join_group(connection_id, "tcp", tcp, config.tcp_join()).await?;

        // The reader has stopped; forward whatever it queued before that
        let mut forwarded = 0usize;
        while let Ok(packet) = device_rx.try_recv() {
            let actions = match link.on_device_packet(packet, Instant::now()) {
                Ok(actions) => actions,
                Err(e) => {
                    warn!("Connection {}: discarding queued packets: {}", connection_id, e);
                    break;
                }
            };
            for action in actions {
                if let LinkAction::ToCore(packet) = action {
                    let envelope = Envelope::new(packet, connection_id, link.device_id());
                    if core_out_tx.send(envelope).await.is_err() {
                        break;
                    }
                    forwarded += 1;
                }
            }
        }
        if forwarded > 0 {
            debug!("Connection {}: forwarded {} packets during shutdown", connection_id, forwarded);
        }

        drop(core_out_tx);
        ipc_cancel.cancel();
        join_group(connection_id, "ipc", ipc, config.ipc_join()).await?;

        upstream.send(&Envelope::goodbye(connection_id, link.device_id())).await?;
        link.close();
        Ok(reason)
    }
}

/// Execute the actions for one event, in order.
async fn execute(
    link: &Link,
    actions: Vec<LinkAction>,
    writer_tx: &mpsc::Sender<Packet>,
    core_out_tx: &mpsc::Sender<Envelope>,
) -> std::result::Result<(), ShutdownReason> {
    for action in actions {
        match action {
            LinkAction::ToDevice(packet) => {
                if writer_tx.send(packet).await.is_err() {
                    return Err(ShutdownReason::PeerClosed);
                }
            }
            LinkAction::ToCore(packet) => {
                let envelope = Envelope::new(packet, link.connection_id(), link.device_id());
                if core_out_tx.send(envelope).await.is_err() {
                    return Err(ShutdownReason::Upstream(ProtocolError::queue_closed("ipc writer")));
                }
            }
            LinkAction::Disconnect => return Err(ShutdownReason::AckTimeout),
        }
    }
    Ok(())
}

async fn join_group(
    connection_id: u64,
    group: &str,
    handles: Vec<JoinHandle<()>>,
    limit: Duration,
) -> Result<()> {
    match tokio::time::timeout(limit, futures::future::join_all(handles)).await {
        Ok(results) => {
            for result in results {
                if let Err(e) = result {
                    error!("Connection {}: {} task failed: {}", connection_id, group, e);
                }
            }
            debug!("Connection {}: {} tasks stopped", connection_id, group);
            Ok(())
        }
        Err(_) => {
            error!("Connection {}: {} tasks did not stop within {:?}", connection_id, group, limit);
            Err(ProtocolError::ShutdownTimeout { group: group.to_string(), duration: limit })
        }
    }
}

async fn pulse_task(
    connection_id: u64,
    period: Duration,
    pulse_tx: mpsc::Sender<()>,
    fault_tx: mpsc::Sender<ShutdownReason>,
    cancel: CancellationToken,
) {
    let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut stalled = 0u32;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticks.tick() => match pulse_tx.try_send(()) {
                Ok(()) => stalled = 0,
                Err(TrySendError::Full(())) => {
                    stalled += 1;
                    warn!(
                        "Connection {}: pulse not consumed ({}/{})",
                        connection_id, stalled, MAX_STALLED_PULSES
                    );
                    if stalled >= MAX_STALLED_PULSES {
                        let _ = fault_tx.try_send(ShutdownReason::TimerStalled);
                        break;
                    }
                }
                Err(TrySendError::Closed(())) => break,
            },
        }
    }
    trace!("Connection {}: timer stopped", connection_id);
}

async fn tcp_reader(
    connection_id: u64,
    read_half: OwnedReadHalf,
    device_tx: mpsc::Sender<Packet>,
    fault_tx: mpsc::Sender<ShutdownReason>,
    cancel: CancellationToken,
) {
    let mut frames = FramedRead::new(read_half, Framer::new());
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(packet)) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = device_tx.send(packet) => if sent.is_err() { break },
                }
            }
            Some(Err(e)) => {
                let reason = if e.is_fatal() {
                    ShutdownReason::Protocol(e)
                } else {
                    ShutdownReason::Link(e)
                };
                let _ = fault_tx.try_send(reason);
                break;
            }
            None => {
                let _ = fault_tx.try_send(ShutdownReason::PeerClosed);
                break;
            }
        }
    }
    trace!("Connection {}: tcp reader stopped", connection_id);
}

async fn tcp_writer(
    connection_id: u64,
    write_half: OwnedWriteHalf,
    mut packets: mpsc::Receiver<Packet>,
    fault_tx: mpsc::Sender<ShutdownReason>,
    cancel: CancellationToken,
) {
    let mut sink = FramedWrite::new(write_half, Framer::new());
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            packet = packets.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };
        let packet_type = packet.packet_type;
        if let Err(e) = sink.send(packet).await {
            warn!("Connection {}: failed to write {:?}: {}", connection_id, packet_type, e);
            let _ = fault_tx.try_send(ShutdownReason::Link(e));
            break;
        }
    }
    trace!("Connection {}: tcp writer stopped", connection_id);
}

async fn ipc_reader(
    connection_id: u64,
    router: Arc<ConnectionRouter>,
    mut routed: mpsc::Receiver<Envelope>,
    core_in_tx: mpsc::Sender<Packet>,
    cancel: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            _ = cancel.cancelled() => break,
            envelope = routed.recv() => envelope,
        };
        let Some(envelope) = envelope else {
            debug!("Connection {}: route closed", connection_id);
            break;
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = core_in_tx.send(envelope.packet) => if sent.is_err() { break },
        }
    }
    router.deregister(connection_id);
    trace!("Connection {}: ipc reader stopped", connection_id);
}

async fn ipc_writer(
    connection_id: u64,
    mut envelopes: mpsc::Receiver<Envelope>,
    upstream: Arc<dyn EnvelopeSink>,
    fault_tx: mpsc::Sender<ShutdownReason>,
    cancel: CancellationToken,
) {
    loop {
        // Drain queued envelopes before honoring cancellation
        let envelope = tokio::select! {
            biased;
            envelope = envelopes.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };
        if let Err(e) = upstream.send(&envelope).await {
            error!("Connection {}: upstream send failed: {}", connection_id, e);
            let _ = fault_tx.try_send(ShutdownReason::Upstream(e));
            break;
        }
    }
    trace!("Connection {}: ipc writer stopped", connection_id);
}
