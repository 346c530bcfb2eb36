//! Packet type tags and the per-type length table.
//!
//! The table in [`PacketType::payload_len`] is the single source of truth for wire
//! lengths; the codec and the framer both read it.

use crate::{ProtocolError, Result};

/// Fixed header length: type, transaction id, ack flag, checksum.
pub const HEADER_LEN: usize = 6;

/// Payload size class for acknowledgments and lifecycle packets.
pub const SMALL_PAYLOAD: usize = 16;
/// Payload size class for commands, responses and control packets.
pub const MEDIUM_PAYLOAD: usize = 256;
/// Payload size class for bulk firmware segments.
pub const LARGE_PAYLOAD: usize = 512;

/// Longest packet on the wire.
pub const MAX_PACKET_LEN: usize = HEADER_LEN + LARGE_PAYLOAD;

/// Packet type tag, byte 0 of every packet.
///
/// Numeric values are shared with terminal firmware and must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum PacketType {
    /// One firmware segment
    Data = 0,
    /// Command sent to a terminal
    Cmd = 1,
    /// Acknowledgment between local components
    InternalAck = 2,
    /// Link-level acknowledgment sent by a terminal
    DeviceAck = 3,
    /// Link-level acknowledgment sent by the server
    ServerAck = 4,
    /// Sign-in or sign-out event
    Login = 5,
    /// Handshake carrying the terminal identity
    Hello = 6,
    /// One part of a command response
    CmdResponse = 7,
    Echo = 9,
    /// FOTA control packet
    Fota = 11,
    /// FOTA acknowledgment
    FotaAck = 12,
    /// Keep-alive filler
    Void = 13,
    /// Connection closed, generated by the connection process
    Goodbye = 14,
}

impl PacketType {
    /// Every known packet type, in tag order.
    pub const ALL: [PacketType; 13] = [
        PacketType::Data,
        PacketType::Cmd,
        PacketType::InternalAck,
        PacketType::DeviceAck,
        PacketType::ServerAck,
        PacketType::Login,
        PacketType::Hello,
        PacketType::CmdResponse,
        PacketType::Echo,
        PacketType::Fota,
        PacketType::FotaAck,
        PacketType::Void,
        PacketType::Goodbye,
    ];

    /// Wire tag for this type.
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Look up a type by its wire tag.
    pub fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => PacketType::Data,
            1 => PacketType::Cmd,
            2 => PacketType::InternalAck,
            3 => PacketType::DeviceAck,
            4 => PacketType::ServerAck,
            5 => PacketType::Login,
            6 => PacketType::Hello,
            7 => PacketType::CmdResponse,
            9 => PacketType::Echo,
            11 => PacketType::Fota,
            12 => PacketType::FotaAck,
            13 => PacketType::Void,
            14 => PacketType::Goodbye,
            _ => return Err(ProtocolError::UnknownPacketType { tag }),
        })
    }

    /// Fixed payload length for this type.
    pub const fn payload_len(self) -> usize {
        match self {
            PacketType::Data => LARGE_PAYLOAD,
            PacketType::InternalAck
            | PacketType::DeviceAck
            | PacketType::ServerAck
            | PacketType::Goodbye => SMALL_PAYLOAD,
            PacketType::Cmd
            | PacketType::Login
            | PacketType::Hello
            | PacketType::CmdResponse
            | PacketType::Echo
            | PacketType::Fota
            | PacketType::FotaAck
            | PacketType::Void => MEDIUM_PAYLOAD,
        }
    }

    /// Total encoded length (header plus payload) for this type.
    pub const fn wire_len(self) -> usize {
        HEADER_LEN + self.payload_len()
    }

    /// Whether this type is a link-level acknowledgment.
    pub const fn is_ack(self) -> bool {
        matches!(self, PacketType::InternalAck | PacketType::DeviceAck | PacketType::ServerAck)
    }
}
