//! Site side of the site/core queue pair
//!
//! The user-facing site process submits commands and firmware requests to core and
//! waits for the answers. Requests are correlated by header transaction id drawn
//! from the site id space.

use tracing::warn;

use super::txid::TransactionIds;
use crate::ipc::{EnvelopeSink, EnvelopeSource, QueuePair};
use crate::types::{CommandPayload, CommandResponse, Envelope, FotaAck, FotaControl, PacketType};
use crate::{ProtocolError, Result};

pub struct SiteLink {
    queues: QueuePair,
    txids: TransactionIds,
}

impl SiteLink {
    pub fn new(queues: QueuePair) -> Self {
        Self { queues, txids: TransactionIds::site() }
    }

    async fn next_reply(&mut self, txid: u16, packet_type: PacketType) -> Result<Envelope> {
        loop {
            let Some(envelope) = self.queues.source.recv().await? else {
                return Err(ProtocolError::queue_closed("core to site"));
            };
            if envelope.packet.transaction_id == txid && envelope.packet_type() == packet_type {
                return Ok(envelope);
            }
            warn!(
                "Site: dropping stray {:?} {} while waiting for {}",
                envelope.packet_type(),
                envelope.packet.transaction_id,
                txid
            );
        }
    }

    /// Run a command on `device_id`; returns every response part in sequence order.
    pub async fn command(
        &mut self,
        device_id: u64,
        command_type: u8,
        args: impl Into<Vec<u8>>,
    ) -> Result<Vec<CommandResponse>> {
        let txid = self.txids.next();
        let packet = CommandPayload::new(command_type, args).into_packet(txid)?;
        self.queues.sink.send(&Envelope::new(packet, 0, device_id)).await?;

        let mut parts: Vec<CommandResponse> = Vec::new();
        loop {
            let envelope = self.next_reply(txid, PacketType::CmdResponse).await?;
            let part = CommandResponse::decode(&envelope.packet.payload)?;
            let expected = part.expected_parts();
            parts.push(part);
            if parts.len() >= expected {
                break;
            }
        }
        parts.sort_by_key(|p| p.sequence_number);
        Ok(parts)
    }

    /// Ask core to stream stored firmware `version` to `device_id`.
    pub async fn fota(&mut self, device_id: u64, version: u16) -> Result<FotaAck> {
        let txid = self.txids.next();
        let packet = FotaControl::start(version, 0, 0).into_packet(txid);
        self.queues.sink.send(&Envelope::new(packet, 0, device_id)).await?;
        let envelope = self.next_reply(txid, PacketType::FotaAck).await?;
        FotaAck::decode(&envelope.packet.payload)
    }
}
