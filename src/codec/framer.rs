//! Stream framer
//!
//! Turns an arbitrarily chunked byte stream into whole packets. Wrap a socket read
//! half in `FramedRead<_, Framer>` to get a stream of [`Packet`]s, or a write half in
//! `FramedWrite<_, Framer>` to get a sink.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::types::{Packet, PacketType};
use crate::{ProtocolError, Result};

/// Per-connection framing state.
///
/// Holds the target length of the in-flight packet once its type byte has been seen.
/// The accumulated bytes live in the `BytesMut` owned by the surrounding
/// `FramedRead`; the framer only ever splits off exactly one packet's worth, so bytes
/// of a following packet stay buffered and are parsed on the next call without
/// waiting for more I/O.
#[derive(Debug, Default)]
pub struct Framer {
    target: Option<usize>,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Length of the packet currently being assembled, if one is in flight.
    pub fn in_flight(&self) -> Option<usize> {
        self.target
    }
}

impl Decoder for Framer {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        let target = match self.target {
            Some(target) => target,
            None => {
                let Some(&tag) = src.first() else {
                    return Ok(None);
                };
                let target = PacketType::from_tag(tag)?.wire_len();
                self.target = Some(target);
                target
            }
        };

        if src.len() < target {
            src.reserve(target - src.len());
            return Ok(None);
        }

        let frame = src.split_to(target);
        self.target = None;
        Packet::decode(&frame).map(Some)
    }
}

impl Encoder<Packet> for Framer {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        item.encode_into(dst)
    }
}
