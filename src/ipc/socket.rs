//! Unix domain socket queue
//!
//! One stream carries both directions between two processes: the write half is the
//! outbound queue and the read half the inbound one. Messages are framed with a
//! length prefix; the kernel socket buffer bounds each direction.

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{info, warn};

use super::{EnvelopeSink, EnvelopeSource, QueuePair};
use crate::codec::ENVELOPE_TRAILER_LEN;
use crate::types::{Envelope, MAX_PACKET_LEN};
use crate::{ProtocolError, Result};

/// Largest serialized envelope.
pub const MAX_ENVELOPE_LEN: usize = MAX_PACKET_LEN + ENVELOPE_TRAILER_LEN;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder().max_frame_length(MAX_ENVELOPE_LEN).new_codec()
}

pub struct SocketSink {
    name: String,
    writer: Mutex<FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>>,
}

pub struct SocketSource {
    name: String,
    reader: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
}

/// Split a connected stream into a queue pair.
pub fn split(name: &str, stream: UnixStream) -> QueuePair {
    let (read, write) = stream.into_split();
    QueuePair::new(
        SocketSink { name: name.to_string(), writer: Mutex::new(FramedWrite::new(write, codec())) },
        SocketSource { name: name.to_string(), reader: FramedRead::new(read, codec()) },
    )
}

/// Bind `path` and wait for the peer process to connect.
///
/// A stale socket file left behind by a previous run is removed first.
pub async fn accept(name: &str, path: &Path) -> Result<QueuePair> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!("Queue {}: removed stale socket {}", name, path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(ProtocolError::io(format!("remove stale socket {}", path.display()), e));
        }
    }
    let listener = UnixListener::bind(path)
        .map_err(|e| ProtocolError::io(format!("bind {}", path.display()), e))?;
    info!("Queue {}: waiting for peer on {}", name, path.display());
    let (stream, _) = listener
        .accept()
        .await
        .map_err(|e| ProtocolError::io(format!("accept on {}", path.display()), e))?;
    info!("Queue {}: peer connected", name);
    Ok(split(name, stream))
}

/// Connect to a peer listening on `path`, retrying while it starts up.
pub async fn connect(name: &str, path: &Path, attempts: u32) -> Result<QueuePair> {
    let mut attempt = 0u32;
    loop {
        match UnixStream::connect(path).await {
            Ok(stream) => {
                info!("Queue {}: connected to {}", name, path.display());
                return Ok(split(name, stream));
            }
            Err(e) if attempt + 1 < attempts => {
                attempt += 1;
                // Exponential backoff: 50ms, 100ms, 200ms, ... capped at 1.6s
                let backoff = Duration::from_millis(50 * (1 << attempt.min(5)));
                warn!(
                    "Queue {}: connect to {} failed ({}/{}): {}, retrying in {:?}",
                    name,
                    path.display(),
                    attempt,
                    attempts,
                    e,
                    backoff
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                return Err(ProtocolError::io(format!("connect {}", path.display()), e));
            }
        }
    }
}

#[async_trait::async_trait]
impl EnvelopeSink for SocketSink {
    async fn send(&self, envelope: &Envelope) -> Result<()> {
        let bytes = Bytes::from(envelope.encode()?);
        let mut writer = self.writer.lock().await;
        writer.send(bytes).await.map_err(|e| {
            warn!("Queue {}: send failed: {}", self.name, e);
            ProtocolError::queue_closed(&self.name)
        })
    }
}

#[async_trait::async_trait]
impl EnvelopeSource for SocketSource {
    async fn recv(&mut self) -> Result<Option<Envelope>> {
        match self.reader.next().await {
            Some(Ok(frame)) => Envelope::decode(&frame).map(Some),
            Some(Err(e)) => Err(ProtocolError::io(format!("queue {} read", self.name), e)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Packet, PacketType};

    #[tokio::test]
    async fn envelopes_cross_a_socket_pair() {
        let (a, b) = UnixStream::pair().unwrap();
        let left = split("left", a);
        let mut right = split("right", b);

        let env = Envelope::new(Packet::new(PacketType::Hello, 4, vec![1, 2]), 9, 42);
        left.sink.send(&env).await.unwrap();

        let got = right.source.recv().await.unwrap().unwrap();
        assert_eq!(got.connection_id, 9);
        assert_eq!(got.device_id, 42);
        assert_eq!(got.packet.packet_type, PacketType::Hello);
        assert_eq!(&got.packet.payload[..2], &[1, 2]);
    }

    #[tokio::test]
    async fn accept_replaces_a_stale_socket_file() {
        let path = std::env::temp_dir().join(format!("clockwire-stale-{}.sock", std::process::id()));
        std::fs::write(&path, b"left over").unwrap();

        let (accepted, connected) = tokio::join!(accept("core", &path), connect("site", &path, 10));
        let accepted = accepted.unwrap();
        let mut connected = connected.unwrap();

        let env = Envelope::new(Packet::new(PacketType::Void, 7, Vec::new()), 3, 0);
        accepted.sink.send(&env).await.unwrap();
        let got = connected.source.recv().await.unwrap().unwrap();
        assert_eq!(got.packet.transaction_id, 7);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn peer_close_ends_source() {
        let (a, b) = UnixStream::pair().unwrap();
        let left = split("left", a);
        let mut right = split("right", b);
        drop(left);
        assert!(right.source.recv().await.unwrap().is_none());
    }
}
