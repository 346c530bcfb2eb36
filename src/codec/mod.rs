//! Binary packet codec
//!
//! Encodes and decodes the fixed-layout packet format shared with terminal firmware.
//!
//! ## Packet layout
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 1 | type tag |
//! | 1 | 2 | transaction id (LE) |
//! | 3 | 1 | ack required |
//! | 4 | 2 | checksum (LE) |
//! | 6 | n | payload, zero padded to the type's fixed length |
//!
//! Envelopes append `connection_id: u64` and `device_id: u64` (both LE) after the
//! encoded packet.

mod framer;

pub use framer::Framer;

use bytes::{BufMut, BytesMut};
use tracing::trace;

use crate::types::{Envelope, HEADER_LEN, Packet, PacketType};
use crate::{ProtocolError, Result};

/// Bytes appended to a packet to form an envelope.
pub const ENVELOPE_TRAILER_LEN: usize = 16;

impl Packet {
    /// Encoded length of this packet on the wire.
    pub fn wire_len(&self) -> usize {
        self.packet_type.wire_len()
    }

    /// Append the encoded packet to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<()> {
        let max = self.packet_type.payload_len();
        if self.payload.len() > max {
            return Err(ProtocolError::PayloadTooLarge {
                packet_type: self.packet_type,
                max,
                found: self.payload.len(),
            });
        }

        dst.reserve(self.wire_len());
        dst.put_u8(self.packet_type.tag());
        dst.put_u16_le(self.transaction_id);
        dst.put_u8(self.ack_required as u8);
        dst.put_u16_le(self.checksum);
        dst.put_slice(&self.payload);
        dst.put_bytes(0, max - self.payload.len());
        Ok(())
    }

    /// Encode to a fixed-length buffer for this packet's type.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.encode_into(&mut buf)?;
        Ok(buf.to_vec())
    }

    /// Decode one packet from the front of `data`. Trailing bytes are ignored.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let packet_type = PacketType::from_tag(read_u8(data, 0)?)?;
        let expected = packet_type.wire_len();
        if data.len() < expected {
            return Err(ProtocolError::Truncated { packet_type, expected, found: data.len() });
        }

        let packet = Self {
            packet_type,
            transaction_id: read_u16_le(data, 1)?,
            ack_required: read_u8(data, 3)? != 0,
            checksum: read_u16_le(data, 4)?,
            payload: data[HEADER_LEN..expected].to_vec(),
        };
        trace!(
            "Decoded {:?} txn={} ack_required={}",
            packet.packet_type, packet.transaction_id, packet.ack_required
        );
        Ok(packet)
    }
}

impl Envelope {
    /// Serialize for the inter-process transport.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(self.packet.wire_len() + ENVELOPE_TRAILER_LEN);
        self.packet.encode_into(&mut buf)?;
        buf.put_u64_le(self.connection_id);
        buf.put_u64_le(self.device_id);
        Ok(buf.to_vec())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let packet = Packet::decode(data)?;
        let offset = packet.wire_len();
        let connection_id = read_u64_le(data, offset)?;
        let device_id = read_u64_le(data, offset + 8)?;
        Ok(Self { packet, connection_id, device_id })
    }
}

fn insufficient(kind: &str, offset: usize, need: usize, data: &[u8]) -> ProtocolError {
    ProtocolError::parse(
        "Integer parsing",
        format!(
            "Insufficient data for {} at offset {} (need {} bytes, have {})",
            kind,
            offset,
            need,
            data.len().saturating_sub(offset)
        ),
    )
}

pub(crate) fn read_u8(data: &[u8], offset: usize) -> Result<u8> {
    data.get(offset).copied().ok_or_else(|| insufficient("u8", offset, 1, data))
}

pub(crate) fn read_u16_le(data: &[u8], offset: usize) -> Result<u16> {
    match data.get(offset..offset + 2) {
        Some(b) => Ok(u16::from_le_bytes([b[0], b[1]])),
        None => Err(insufficient("u16", offset, 2, data)),
    }
}

pub(crate) fn read_u32_le(data: &[u8], offset: usize) -> Result<u32> {
    match data.get(offset..offset + 4) {
        Some(b) => Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        None => Err(insufficient("u32", offset, 4, data)),
    }
}

pub(crate) fn read_u64_le(data: &[u8], offset: usize) -> Result<u64> {
    match data.get(offset..offset + 8) {
        Some(b) => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(b);
            Ok(u64::from_le_bytes(raw))
        }
        None => Err(insufficient("u64", offset, 8, data)),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::{LARGE_PAYLOAD, MEDIUM_PAYLOAD};
    use proptest::prelude::*;

    prop_compose! {
        /// Any packet with a full-length payload, as decode would produce it.
        pub(crate) fn arb_packet()(
            kind in proptest::sample::select(PacketType::ALL.to_vec()),
            transaction_id in any::<u16>(),
            ack_required in any::<bool>(),
            checksum in any::<u16>(),
            seed in proptest::collection::vec(any::<u8>(), LARGE_PAYLOAD),
        ) -> Packet {
            let payload = seed[..kind.payload_len()].to_vec();
            Packet { packet_type: kind, transaction_id, ack_required, checksum, payload }
        }
    }

    proptest! {
        #[test]
        fn prop_encoded_length_is_fixed_per_type(packet in arb_packet()) {
            let bytes = packet.encode().unwrap();
            prop_assert_eq!(bytes.len(), packet.packet_type.wire_len());
            prop_assert_eq!(Packet::decode(&bytes).unwrap(), packet);
        }

        #[test]
        fn prop_short_buffers_are_rejected(packet in arb_packet(), cut in 1usize..HEADER_LEN) {
            let bytes = packet.encode().unwrap();
            let short = &bytes[..bytes.len() - cut];
            let truncated = matches!(Packet::decode(short), Err(ProtocolError::Truncated { .. }));
            prop_assert!(truncated);
        }
    }

    #[test]
    fn header_fields_are_little_endian() {
        let packet = Packet::new(PacketType::Cmd, 0x0102, vec![9]).with_ack_required();
        let bytes = packet.encode().unwrap();
        assert_eq!(&bytes[..6], &[1, 0x02, 0x01, 1, 0, 0]);
        assert_eq!(bytes[6], 9);
        assert!(bytes[7..].iter().all(|b| *b == 0));
    }

    #[test]
    fn short_payload_is_zero_padded() {
        let packet = Packet::new(PacketType::Hello, 3, vec![1, 2, 3]);
        let decoded = Packet::decode(&packet.encode().unwrap()).unwrap();
        assert_eq!(decoded.payload.len(), MEDIUM_PAYLOAD);
        assert_eq!(&decoded.payload[..3], &[1, 2, 3]);
    }

    #[test]
    fn oversized_payload_fails_to_encode() {
        let packet = Packet::new(PacketType::DeviceAck, 1, vec![0u8; 17]);
        assert!(matches!(packet.encode(), Err(ProtocolError::PayloadTooLarge { max: 16, .. })));
    }

    #[test]
    fn unknown_type_fails_to_decode() {
        let mut bytes = vec![0u8; 300];
        bytes[0] = 42;
        assert!(matches!(Packet::decode(&bytes), Err(ProtocolError::UnknownPacketType { tag: 42 })));
        assert!(Packet::decode(&[]).is_err());
    }

    #[test]
    fn envelope_appends_routing_ids() {
        let env = Envelope::new(Packet::device_ack(77), 5, 42);
        let bytes = env.encode().unwrap();
        assert_eq!(bytes.len(), PacketType::DeviceAck.wire_len() + ENVELOPE_TRAILER_LEN);
        assert_eq!(&bytes[22..30], &5u64.to_le_bytes());
        assert_eq!(&bytes[30..38], &42u64.to_le_bytes());

        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded.connection_id, 5);
        assert_eq!(decoded.device_id, 42);
        assert_eq!(decoded.packet.transaction_id, 77);
    }

    #[test]
    fn envelope_missing_trailer_is_rejected() {
        let bytes = Packet::goodbye().encode().unwrap();
        assert!(Envelope::decode(&bytes).is_err());
    }
}
