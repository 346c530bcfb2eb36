//! Packet and envelope values

use super::PacketType;
use super::wire::ack_reason;

/// One decoded protocol packet.
///
/// `payload` holds the meaningful bytes; encoding zero-pads it to the type's fixed
/// payload length, and decoding always yields the full padded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub transaction_id: u16,
    /// Receiver must answer with a link-level acknowledgment
    pub ack_required: bool,
    /// Carried verbatim, never verified
    pub checksum: u16,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Create a packet that does not require acknowledgment.
    pub fn new(packet_type: PacketType, transaction_id: u16, payload: impl Into<Vec<u8>>) -> Self {
        Self { packet_type, transaction_id, ack_required: false, checksum: 0, payload: payload.into() }
    }

    /// Mark this packet as requiring a link-level acknowledgment.
    pub fn with_ack_required(mut self) -> Self {
        self.ack_required = true;
        self
    }

    /// Server acknowledgment for a terminal packet.
    pub fn server_ack(transaction_id: u16, reason: u8) -> Self {
        Self::new(PacketType::ServerAck, transaction_id, vec![reason])
    }

    /// Terminal acknowledgment for a server packet.
    pub fn device_ack(transaction_id: u16) -> Self {
        Self::new(PacketType::DeviceAck, transaction_id, vec![ack_reason::ACK_GOOD])
    }

    /// Lifecycle packet emitted when a connection closes.
    pub fn goodbye() -> Self {
        Self::new(PacketType::Goodbye, 0, Vec::new())
    }

    /// Reason byte of an acknowledgment packet.
    pub fn ack_reason(&self) -> Option<u8> {
        if self.packet_type.is_ack() { self.payload.first().copied() } else { None }
    }
}

/// A packet plus the routing identifiers used across the inter-process transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub packet: Packet,
    /// Ephemeral id assigned when the connection was accepted
    pub connection_id: u64,
    /// Hardware identity announced in HELLO, 0 until known
    pub device_id: u64,
}

impl Envelope {
    pub fn new(packet: Packet, connection_id: u64, device_id: u64) -> Self {
        Self { packet, connection_id, device_id }
    }

    /// Goodbye envelope announcing that `connection_id` has closed.
    pub fn goodbye(connection_id: u64, device_id: u64) -> Self {
        Self::new(Packet::goodbye(), connection_id, device_id)
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet.packet_type
    }
}
