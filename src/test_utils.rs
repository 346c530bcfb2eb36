//! Test utilities: a scripted fake terminal and sample traffic
//!
//! [`FakeTerminal`] speaks the wire protocol over a real TCP connection so tests can
//! exercise the connection process (and core behind it) end to end. Helpers panic on
//! unexpected conditions; they are only meant for tests and benchmarks.

#![cfg(any(test, feature = "benchmark"))]

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::Framer;
use crate::crc;
use crate::types::wire::{fota_layout, fota_status, fota_type};
use crate::types::{
    CommandPayload, CommandResponse, FotaAck, FotaControl, Hello, Packet, PacketType,
};

/// How long a fake terminal waits for the server before failing the test.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A mixed, realistic stream of packets for framing tests and benchmarks.
pub fn sample_traffic(count: usize) -> Vec<Packet> {
    (0..count)
        .map(|i| {
            let txid = (i % u16::MAX as usize) as u16;
            match i % 5 {
                0 => Packet::device_ack(txid),
                1 => Packet::new(PacketType::Login, txid, vec![0x6d, 0x01, 1, 7, 0, 0, 0]),
                2 => Packet::new(PacketType::CmdResponse, txid, vec![0, 1, 0, 1, 0, 0]),
                3 => Packet::new(PacketType::Data, txid, vec![(i & 0xff) as u8; 512]).with_ack_required(),
                _ => Packet::new(PacketType::Void, txid, Vec::new()),
            }
        })
        .collect()
}

/// What a scripted terminal observed.
#[derive(Debug, Default, Clone)]
pub struct TerminalReport {
    pub commands: Vec<CommandPayload>,
    pub fota_starts: usize,
    pub metas: usize,
    pub data_packets: usize,
    pub finals: Vec<u8>,
    pub crc32_checked: bool,
    pub acks_sent: usize,
}

type CommandHandler = Box<dyn FnMut(&CommandPayload, u16) -> Vec<CommandResponse> + Send>;

/// Behavior of [`FakeTerminal::run`].
pub struct TerminalScript {
    /// Firmware version the terminal reports as installed
    pub fw_version: u16,
    /// Send DEVICE_ACK for ack-required packets
    pub ack_packets: bool,
    /// Flip one byte of the first segment of this block as it is received
    pub corrupt_block: Option<u16>,
    pub on_command: CommandHandler,
}

impl TerminalScript {
    /// Acknowledge everything and answer every command with one GOOD part.
    pub fn obedient(fw_version: u16) -> Self {
        Self {
            fw_version,
            ack_packets: true,
            corrupt_block: None,
            on_command: Box::new(|_, txid| vec![CommandResponse::status_only(0, txid)]),
        }
    }

    pub fn with_handler(
        mut self,
        handler: impl FnMut(&CommandPayload, u16) -> Vec<CommandResponse> + Send + 'static,
    ) -> Self {
        self.on_command = Box::new(handler);
        self
    }
}

/// A terminal on the other end of a real TCP connection.
pub struct FakeTerminal {
    frames: FramedRead<OwnedReadHalf, Framer>,
    sink: FramedWrite<OwnedWriteHalf, Framer>,
    next_txid: u16,
}

impl FakeTerminal {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect to packet server");
        let (read, write) = stream.into_split();
        Self {
            frames: FramedRead::new(read, Framer::new()),
            sink: FramedWrite::new(write, Framer::new()),
            next_txid: 1,
        }
    }

    pub fn next_txid(&mut self) -> u16 {
        let txid = self.next_txid;
        self.next_txid = self.next_txid.wrapping_add(1).max(1);
        txid
    }

    pub async fn send(&mut self, packet: Packet) {
        self.sink.send(packet).await.expect("terminal write");
    }

    /// Write raw bytes, bypassing the codec.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        use tokio::io::AsyncWriteExt;
        self.sink.get_mut().write_all(bytes).await.expect("terminal raw write");
    }

    /// Next packet from the server, `None` once the server closed the connection.
    pub async fn recv(&mut self) -> Option<Packet> {
        match tokio::time::timeout(RECV_TIMEOUT, self.frames.next()).await {
            Ok(Some(Ok(packet))) => Some(packet),
            Ok(Some(Err(_))) | Ok(None) => None,
            Err(_) => panic!("terminal timed out waiting for the server"),
        }
    }

    pub async fn expect(&mut self, packet_type: PacketType) -> Packet {
        let packet = self.recv().await.expect("connection closed");
        assert_eq!(packet.packet_type, packet_type, "unexpected packet {:?}", packet);
        packet
    }

    /// Send an ack-required HELLO and wait for the server ACK.
    pub async fn hello(&mut self, device_id: u64, fw_version: u16) {
        let hello = Hello { device_id, fw_version, bricked: false, name: format!("term-{device_id}") };
        let txid = self.next_txid();
        let packet =
            Packet::new(PacketType::Hello, txid, hello.encode().expect("hello")).with_ack_required();
        self.send(packet).await;
        let ack = self.expect(PacketType::ServerAck).await;
        assert_eq!(ack.transaction_id, txid);
    }

    /// Play `script` until the server closes the connection.
    ///
    /// The report is updated as packets arrive so tests can inspect it while the
    /// terminal is still connected.
    pub async fn run(mut self, mut script: TerminalScript, report: Arc<Mutex<TerminalReport>>) {
        let mut flash = FlashEmulator::default();
        while let Some(Ok(packet)) = self.frames.next().await {
            if packet.ack_required && script.ack_packets {
                self.send(Packet::device_ack(packet.transaction_id)).await;
                report.lock().acks_sent += 1;
            }
            let replies = match packet.packet_type {
                PacketType::Cmd => {
                    let cmd = CommandPayload::decode(&packet.payload).expect("cmd payload");
                    report.lock().commands.push(cmd.clone());
                    let mut packets = Vec::new();
                    for part in (script.on_command)(&cmd, packet.transaction_id) {
                        let txid = self.next_txid();
                        packets.push(part.into_packet(txid).expect("response part"));
                    }
                    packets
                }
                PacketType::Fota => {
                    let control = FotaControl::decode(&packet.payload).expect("fota payload");
                    flash.control(&control, &script, &report).into_iter().collect()
                }
                PacketType::Data => {
                    let block = flash.block;
                    let corrupt = script.corrupt_block == Some(block) && flash.segments == 0;
                    report.lock().data_packets += 1;
                    flash.segment(&packet.payload, corrupt).into_iter().collect()
                }
                _ => Vec::new(),
            };
            for mut reply in replies {
                if reply.packet_type == PacketType::FotaAck {
                    reply.transaction_id = self.next_txid();
                }
                self.send(reply).await;
            }
        }
    }
}

/// Terminal side of a firmware transfer.
#[derive(Default)]
struct FlashEmulator {
    expected_crc32: u32,
    block: u16,
    block_crc16: u16,
    segments: usize,
    block_buf: Vec<u8>,
    image: Vec<u8>,
}

impl FlashEmulator {
    fn control(
        &mut self,
        control: &FotaControl,
        script: &TerminalScript,
        report: &Mutex<TerminalReport>,
    ) -> Option<Packet> {
        assert_eq!(control.magic, fota_layout::MAGIC_MARKER);
        let ack = |fota_type, status| Some(FotaAck { fota_type, status }.into_packet(0));
        match control.fota_type {
            fota_type::START => {
                report.lock().fota_starts += 1;
                if control.fw_version == script.fw_version {
                    return ack(fota_type::START_ACK, fota_status::FAILED_SAME_FW);
                }
                *self = Self { expected_crc32: control.fw_crc32, ..Self::default() };
                ack(fota_type::START_ACK, fota_status::GOOD)
            }
            fota_type::META => {
                report.lock().metas += 1;
                self.block = control.fw_segment;
                self.block_crc16 = control.fw_crc16;
                self.segments = 0;
                self.block_buf.clear();
                None
            }
            kind @ (fota_type::FINAL | fota_type::FINAL_TEST_ONLY) => {
                let mut report = report.lock();
                report.finals.push(kind);
                report.crc32_checked = true;
                let ack_type = if kind == fota_type::FINAL {
                    fota_type::FINAL_ACK
                } else {
                    fota_type::FINAL_TEST_ACK
                };
                let status = if crc::crc32(&self.image) == self.expected_crc32 {
                    fota_status::GOOD
                } else {
                    fota_status::FAILED_CRC32
                };
                ack(ack_type, status)
            }
            other => panic!("terminal got unexpected FOTA type {other}"),
        }
    }

    fn segment(&mut self, payload: &[u8], corrupt: bool) -> Option<Packet> {
        let mut segment = payload.to_vec();
        if corrupt {
            segment[0] ^= 0xFF;
        }
        self.block_buf.extend_from_slice(&segment);
        self.segments += 1;
        if self.segments < fota_layout::SEGMENTS_PER_BLOCK {
            return None;
        }
        let status = if crc::crc16(&self.block_buf) == self.block_crc16 {
            self.image.extend_from_slice(&self.block_buf);
            fota_status::GOOD
        } else {
            fota_status::FAILED_CRC16
        };
        Some(FotaAck { fota_type: fota_type::META_ACK, status }.into_packet(0))
    }
}
