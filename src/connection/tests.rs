//! End-to-end tests for the connection process
//!
//! A real packet server on loopback TCP, a scripted terminal on one side and the
//! test acting as core on the other side of an in-memory queue pair.

use super::*;
use crate::config::LinkConfig;
use crate::ipc::{EnvelopeSink, EnvelopeSource, QueuePair};
use crate::test_utils::FakeTerminal;
use crate::types::wire::{ack_reason, cmd_status, cmd_type};
use crate::types::{CommandPayload, CommandResponse, Envelope, Login, Packet, PacketType};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    addr: std::net::SocketAddr,
    core: QueuePair,
    server: Arc<PacketServer>,
    cancel: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn fast_link() -> LinkConfig {
    LinkConfig { ack_timeout_ms: 300, scan_interval_ms: 50, ..LinkConfig::default() }
}

async fn start(link: LinkConfig) -> Harness {
    let (packet_side, core) = QueuePair::memory_link("packet", 32);
    let server = Arc::new(PacketServer::new(link, packet_side.sink));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(server.clone().run(listener, packet_side.source, cancel.clone()));
    Harness { addr, core, server, cancel }
}

impl Harness {
    async fn upstream(&mut self) -> Envelope {
        tokio::time::timeout(WAIT, self.core.source.recv())
            .await
            .expect("nothing forwarded to core")
            .unwrap()
            .expect("queue closed")
    }

    async fn to_terminal(&self, connection_id: u64, packet: Packet) {
        self.core.sink.send(&Envelope::new(packet, connection_id, 0)).await.unwrap();
    }

    /// Connect a terminal, announce it and return its connection id.
    async fn attach(&mut self, device_id: u64) -> (FakeTerminal, u64) {
        let mut terminal = FakeTerminal::connect(self.addr).await;
        terminal.hello(device_id, 3).await;
        let hello = self.upstream().await;
        assert_eq!(hello.packet_type(), PacketType::Hello);
        assert_eq!(hello.device_id, device_id);
        (terminal, hello.connection_id)
    }
}

fn command(txid: u16) -> Packet {
    CommandPayload::new(cmd_type::GET_ALL_USERS, Vec::new()).into_packet(txid).unwrap()
}

#[tokio::test]
async fn ack_required_packets_are_acked_and_stamped() {
    let mut h = start(fast_link()).await;
    let (mut terminal, connection_id) = h.attach(42).await;
    assert!(connection_id >= 1);

    let login = Login { temperature: 365, sign_in: true, uid: 7, name: "Alice".into() };
    let txid = terminal.next_txid();
    terminal
        .send(Packet::new(PacketType::Login, txid, login.encode().unwrap()).with_ack_required())
        .await;
    let ack = terminal.expect(PacketType::ServerAck).await;
    assert_eq!(ack.transaction_id, txid);
    assert_eq!(ack.ack_reason(), Some(ack_reason::ACK_GOOD));

    let forwarded = h.upstream().await;
    assert_eq!(forwarded.packet_type(), PacketType::Login);
    assert_eq!(forwarded.device_id, 42);
    assert_eq!(forwarded.connection_id, connection_id);
    assert_eq!(Login::decode(&forwarded.packet.payload).unwrap(), login);
}

#[tokio::test]
async fn device_acks_settle_and_are_not_forwarded() {
    let mut h = start(fast_link()).await;
    let (mut terminal, connection_id) = h.attach(42).await;

    h.to_terminal(connection_id, command(2001)).await;
    let cmd = terminal.expect(PacketType::Cmd).await;
    assert!(cmd.ack_required);
    terminal.send(Packet::device_ack(cmd.transaction_id)).await;

    let txid = terminal.next_txid();
    terminal.send(Packet::new(PacketType::Void, txid, Vec::new())).await;
    assert_eq!(h.upstream().await.packet_type(), PacketType::Void);

    // Well past the ACK window: the settled transaction must not time out
    tokio::time::sleep(Duration::from_millis(600)).await;
    let txid = terminal.next_txid();
    terminal.send(Packet::new(PacketType::Echo, txid, Vec::new())).await;
    assert_eq!(h.upstream().await.packet_type(), PacketType::Echo);
}

#[tokio::test]
async fn lost_ack_reports_timeout_then_goodbye() {
    let mut h = start(fast_link()).await;
    let (mut terminal, connection_id) = h.attach(42).await;

    h.to_terminal(connection_id, command(2002)).await;
    terminal.expect(PacketType::Cmd).await;

    let timed_out = h.upstream().await;
    assert_eq!(timed_out.packet_type(), PacketType::CmdResponse);
    assert_eq!(timed_out.device_id, 42);
    let response = CommandResponse::decode(&timed_out.packet.payload).unwrap();
    assert_eq!(response.status, cmd_status::CMD_ACK_TIMED_OUT);
    assert_eq!(response.transaction_id, 2002);

    let goodbye = h.upstream().await;
    assert_eq!(goodbye.packet_type(), PacketType::Goodbye);
    assert_eq!(goodbye.connection_id, connection_id);
    assert!(terminal.recv().await.is_none());
    assert!(!h.server.router().contains(connection_id));
}

#[tokio::test]
async fn terminal_disconnect_sends_goodbye() {
    let mut h = start(fast_link()).await;
    let (terminal, connection_id) = h.attach(9).await;
    drop(terminal);

    let goodbye = h.upstream().await;
    assert_eq!(goodbye.packet_type(), PacketType::Goodbye);
    assert_eq!(goodbye.connection_id, connection_id);
    assert_eq!(goodbye.device_id, 9);
}

#[tokio::test]
async fn closing_the_route_shuts_the_connection() {
    let mut h = start(fast_link()).await;
    let (mut terminal, connection_id) = h.attach(5).await;

    assert!(h.server.router().close(connection_id));
    assert_eq!(h.upstream().await.packet_type(), PacketType::Goodbye);
    assert!(terminal.recv().await.is_none());
}

#[tokio::test]
async fn goodbye_from_core_closes_the_connection() {
    let mut h = start(fast_link()).await;
    let (mut terminal, connection_id) = h.attach(5).await;

    h.to_terminal(connection_id, Packet::goodbye()).await;
    let goodbye = h.upstream().await;
    assert_eq!(goodbye.packet_type(), PacketType::Goodbye);
    assert_eq!(goodbye.connection_id, connection_id);
    assert!(terminal.recv().await.is_none());
    assert!(!h.server.router().contains(connection_id));
}

#[tokio::test]
async fn packets_read_before_teardown_reach_core_ahead_of_goodbye() {
    let mut h = start(fast_link()).await;
    let (mut terminal, connection_id) = h.attach(11).await;

    for txid in 100..108 {
        terminal.send(Packet::new(PacketType::Void, txid, Vec::new())).await;
    }
    drop(terminal);

    for txid in 100..108 {
        let forwarded = h.upstream().await;
        assert_eq!(forwarded.packet_type(), PacketType::Void);
        assert_eq!(forwarded.packet.transaction_id, txid);
        assert_eq!(forwarded.connection_id, connection_id);
    }
    let goodbye = h.upstream().await;
    assert_eq!(goodbye.packet_type(), PacketType::Goodbye);
    assert_eq!(goodbye.device_id, 11);
}

#[tokio::test]
async fn unknown_type_tears_the_connection_down() {
    let mut h = start(fast_link()).await;
    let (mut terminal, connection_id) = h.attach(6).await;

    terminal.send_raw(&[0xEE, 0, 0, 0, 0, 0]).await;
    let goodbye = h.upstream().await;
    assert_eq!(goodbye.packet_type(), PacketType::Goodbye);
    assert_eq!(goodbye.connection_id, connection_id);
    assert!(terminal.recv().await.is_none());
}

#[tokio::test]
async fn duplicate_transaction_from_core_tears_the_connection_down() {
    let mut h = start(fast_link()).await;
    let (mut terminal, connection_id) = h.attach(8).await;

    h.to_terminal(connection_id, command(2100)).await;
    h.to_terminal(connection_id, command(2100)).await;

    assert_eq!(h.upstream().await.packet_type(), PacketType::Goodbye);
    // The first copy may or may not have been written before teardown
    while let Some(packet) = terminal.recv().await {
        assert_eq!(packet.transaction_id, 2100);
    }
}

#[tokio::test]
async fn envelopes_for_unknown_connections_are_dropped() {
    let mut h = start(fast_link()).await;
    h.to_terminal(999, command(2200)).await;

    let (mut terminal, connection_id) = h.attach(11).await;
    h.to_terminal(connection_id, command(2201)).await;
    assert_eq!(terminal.expect(PacketType::Cmd).await.transaction_id, 2201);
}

#[tokio::test]
async fn each_connection_gets_its_own_id() {
    let mut h = start(fast_link()).await;
    let (_first, a) = h.attach(1).await;
    let (_second, b) = h.attach(2).await;
    assert_ne!(a, b);
    assert_eq!(h.server.router().len(), 2);
}
