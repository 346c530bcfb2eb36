//! Bounded in-process queue

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

use super::{EnvelopeSink, EnvelopeSource};
use crate::types::Envelope;
use crate::{ProtocolError, Result};

/// Create a bounded queue carrying serialized envelopes.
pub fn channel(name: &str, depth: usize) -> (MemorySink, MemorySource) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    let name: Arc<str> = Arc::from(name);
    (MemorySink { name: name.clone(), tx }, MemorySource { name, rx })
}

#[derive(Clone)]
pub struct MemorySink {
    name: Arc<str>,
    tx: mpsc::Sender<Vec<u8>>,
}

pub struct MemorySource {
    name: Arc<str>,
    rx: mpsc::Receiver<Vec<u8>>,
}

#[async_trait::async_trait]
impl EnvelopeSink for MemorySink {
    async fn send(&self, envelope: &Envelope) -> Result<()> {
        let bytes = envelope.encode()?;
        trace!("Queue {}: send {} bytes", self.name, bytes.len());
        self.tx.send(bytes).await.map_err(|_| ProtocolError::queue_closed(&*self.name))
    }
}

#[async_trait::async_trait]
impl EnvelopeSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<Envelope>> {
        match self.rx.recv().await {
            Some(bytes) => Envelope::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Packet;
    use std::time::Duration;

    #[tokio::test]
    async fn envelopes_arrive_in_order() {
        let (tx, mut rx) = channel("test", 4);
        for id in 0..3u16 {
            tx.send(&Envelope::new(Packet::device_ack(id), 1, 2)).await.unwrap();
        }
        for id in 0..3u16 {
            let env = rx.recv().await.unwrap().unwrap();
            assert_eq!(env.packet.transaction_id, id);
            assert_eq!(env.connection_id, 1);
        }
    }

    #[tokio::test]
    async fn send_after_receiver_drop_is_fatal() {
        let (tx, rx) = channel("core", 1);
        drop(rx);
        let err = tx.send(&Envelope::goodbye(1, 0)).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("core"));
    }

    #[tokio::test]
    async fn full_queue_blocks_sender() {
        let (tx, mut rx) = channel("depth", 1);
        tx.send(&Envelope::goodbye(1, 0)).await.unwrap();
        let second = Envelope::goodbye(2, 0);
        let blocked = tokio::time::timeout(Duration::from_millis(50), tx.send(&second));
        assert!(blocked.await.is_err());
        assert_eq!(rx.recv().await.unwrap().unwrap().connection_id, 1);
    }

    #[tokio::test]
    async fn closed_sender_ends_source() {
        let (tx, mut rx) = channel("closing", 1);
        drop(tx);
        assert!(rx.recv().await.unwrap().is_none());
    }
}
