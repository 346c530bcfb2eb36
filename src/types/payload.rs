//! Typed payload layouts
//!
//! Each struct maps one packed, little-endian payload layout to Rust fields. Encoding
//! produces only the meaningful bytes; the packet codec pads to the fixed size.

use super::wire::{fota_layout, fota_type};
use super::{MEDIUM_PAYLOAD, Packet, PacketType};
use crate::codec::{read_u8, read_u16_le, read_u32_le, read_u64_le};
use crate::{ProtocolError, Result};

fn check_len(packet_type: PacketType, bytes: &[u8], max: usize) -> Result<()> {
    if bytes.len() > max {
        return Err(ProtocolError::PayloadTooLarge { packet_type, max, found: bytes.len() });
    }
    Ok(())
}

/// Read a NUL-terminated string, tolerating a missing terminator.
fn read_cstr(data: &[u8]) -> String {
    let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// CMD payload: command type followed by its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPayload {
    pub command_type: u8,
    pub args: Vec<u8>,
}

impl CommandPayload {
    pub const MAX_ARGS: usize = MEDIUM_PAYLOAD - 1;

    pub fn new(command_type: u8, args: impl Into<Vec<u8>>) -> Self {
        Self { command_type, args: args.into() }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        check_len(PacketType::Cmd, &self.args, Self::MAX_ARGS)?;
        let mut out = Vec::with_capacity(1 + self.args.len());
        out.push(self.command_type);
        out.extend_from_slice(&self.args);
        Ok(out)
    }

    /// Decode a CMD payload; `args` keeps any trailing padding.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let command_type = read_u8(payload, 0)?;
        Ok(Self { command_type, args: payload[1..].to_vec() })
    }

    /// Build the ack-required CMD packet carrying this payload.
    pub fn into_packet(&self, transaction_id: u16) -> Result<Packet> {
        Ok(Packet::new(PacketType::Cmd, transaction_id, self.encode()?).with_ack_required())
    }
}

/// One part of a command response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub status: u8,
    pub transaction_id: u16,
    pub total_packets: u8,
    pub sequence_number: u8,
    pub body: Vec<u8>,
}

impl CommandResponse {
    const HEADER_LEN: usize = 6;
    pub const MAX_BODY: usize = MEDIUM_PAYLOAD - Self::HEADER_LEN;

    /// Single-part response carrying only a status.
    pub fn status_only(status: u8, transaction_id: u16) -> Self {
        Self { status, transaction_id, total_packets: 1, sequence_number: 0, body: Vec::new() }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        check_len(PacketType::CmdResponse, &self.body, Self::MAX_BODY)?;
        let mut out = Vec::with_capacity(Self::HEADER_LEN + self.body.len());
        out.push(self.status);
        out.extend_from_slice(&self.transaction_id.to_le_bytes());
        out.push(self.total_packets);
        out.push(self.sequence_number);
        out.push(self.body.len() as u8);
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let status = read_u8(payload, 0)?;
        let transaction_id = read_u16_le(payload, 1)?;
        let total_packets = read_u8(payload, 3)?;
        let sequence_number = read_u8(payload, 4)?;
        let body_len = read_u8(payload, 5)? as usize;
        let end = Self::HEADER_LEN + body_len;
        if body_len > Self::MAX_BODY || end > payload.len() {
            return Err(ProtocolError::parse(
                "command response",
                format!("body length {} exceeds available {} bytes", body_len, payload.len()),
            ));
        }
        Ok(Self {
            status,
            transaction_id,
            total_packets,
            sequence_number,
            body: payload[Self::HEADER_LEN..end].to_vec(),
        })
    }

    pub fn into_packet(&self, transaction_id: u16) -> Result<Packet> {
        Ok(Packet::new(PacketType::CmdResponse, transaction_id, self.encode()?))
    }

    /// Parts expected for the whole response; a zero count is read as one.
    pub fn expected_parts(&self) -> usize {
        self.total_packets.max(1) as usize
    }
}

/// HELLO payload announcing a terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub device_id: u64,
    pub fw_version: u16,
    pub bricked: bool,
    pub name: String,
}

impl Hello {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(12 + self.name.len());
        out.extend_from_slice(&self.device_id.to_le_bytes());
        out.extend_from_slice(&self.fw_version.to_le_bytes());
        out.push(self.bricked as u8);
        out.extend_from_slice(self.name.as_bytes());
        out.push(0);
        check_len(PacketType::Hello, &out, MEDIUM_PAYLOAD)?;
        Ok(out)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let device_id = read_u64_le(payload, 0)?;
        let fw_version = read_u16_le(payload, 8)?;
        let bricked = read_u8(payload, 10)? != 0;
        Ok(Self { device_id, fw_version, bricked, name: read_cstr(&payload[11..]) })
    }
}

/// LOGIN payload: a user signed in or out at a terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub temperature: u16,
    pub sign_in: bool,
    pub uid: u32,
    pub name: String,
}

impl Login {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(8 + self.name.len());
        out.extend_from_slice(&self.temperature.to_le_bytes());
        out.push(self.sign_in as u8);
        out.extend_from_slice(&self.uid.to_le_bytes());
        out.extend_from_slice(self.name.as_bytes());
        out.push(0);
        check_len(PacketType::Login, &out, MEDIUM_PAYLOAD)?;
        Ok(out)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let temperature = read_u16_le(payload, 0)?;
        let sign_in = read_u8(payload, 2)? != 0;
        let uid = read_u32_le(payload, 3)?;
        Ok(Self { temperature, sign_in, uid, name: read_cstr(&payload[7..]) })
    }
}

/// Arguments of the ADD_USER command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddUser {
    pub uid: u32,
    pub replace: bool,
    pub name: String,
}

impl AddUser {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(5 + self.name.len());
        out.extend_from_slice(&self.uid.to_le_bytes());
        out.push(self.replace as u8);
        out.extend_from_slice(self.name.as_bytes());
        check_len(PacketType::Cmd, &out, CommandPayload::MAX_ARGS)?;
        Ok(out)
    }

    pub fn decode(args: &[u8]) -> Result<Self> {
        let uid = read_u32_le(args, 0)?;
        let replace = read_u8(args, 4)? != 0;
        Ok(Self { uid, replace, name: read_cstr(&args[5..]) })
    }
}

/// FOTA control payload (start, per-block meta, final).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FotaControl {
    pub magic: u32,
    pub fota_type: u8,
    pub fw_version: u16,
    pub fw_crc32: u32,
    pub fw_crc16: u16,
    pub fw_segment: u16,
    pub fw_blocks: u16,
}

impl FotaControl {
    pub const ENCODED_LEN: usize = 17;

    fn blank(fota_type: u8) -> Self {
        Self {
            magic: fota_layout::MAGIC_MARKER,
            fota_type,
            fw_version: 0,
            fw_crc32: 0,
            fw_crc16: 0,
            fw_segment: 0,
            fw_blocks: 0,
        }
    }

    pub fn start(fw_version: u16, fw_crc32: u32, fw_blocks: u16) -> Self {
        Self { fw_version, fw_crc32, fw_blocks, ..Self::blank(fota_type::START) }
    }

    /// Meta packet announcing block `block` and its CRC16.
    pub fn meta(block: u16, fw_crc16: u16) -> Self {
        Self { fw_segment: block, fw_crc16, ..Self::blank(fota_type::META) }
    }

    pub fn finish(fw_version: u16, fw_crc32: u32, fw_blocks: u16, validation_only: bool) -> Self {
        let kind = if validation_only { fota_type::FINAL_TEST_ONLY } else { fota_type::FINAL };
        Self { fw_version, fw_crc32, fw_blocks, ..Self::blank(kind) }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        out.extend_from_slice(&self.magic.to_le_bytes());
        out.push(self.fota_type);
        out.extend_from_slice(&self.fw_version.to_le_bytes());
        out.extend_from_slice(&self.fw_crc32.to_le_bytes());
        out.extend_from_slice(&self.fw_crc16.to_le_bytes());
        out.extend_from_slice(&self.fw_segment.to_le_bytes());
        out.extend_from_slice(&self.fw_blocks.to_le_bytes());
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(Self {
            magic: read_u32_le(payload, 0)?,
            fota_type: read_u8(payload, 4)?,
            fw_version: read_u16_le(payload, 5)?,
            fw_crc32: read_u32_le(payload, 7)?,
            fw_crc16: read_u16_le(payload, 11)?,
            fw_segment: read_u16_le(payload, 13)?,
            fw_blocks: read_u16_le(payload, 15)?,
        })
    }

    pub fn into_packet(&self, transaction_id: u16) -> Packet {
        Packet::new(PacketType::Fota, transaction_id, self.encode())
    }
}

/// FOTA acknowledgment payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FotaAck {
    pub fota_type: u8,
    pub status: u8,
}

impl FotaAck {
    pub fn encode(&self) -> Vec<u8> {
        vec![self.fota_type, self.status]
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(Self { fota_type: read_u8(payload, 0)?, status: read_u8(payload, 1)? })
    }

    pub fn into_packet(&self, transaction_id: u16) -> Packet {
        Packet::new(PacketType::FotaAck, transaction_id, self.encode())
    }
}
