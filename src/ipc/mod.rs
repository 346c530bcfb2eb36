//! Inter-process transport
//!
//! Envelopes cross process boundaries through bounded, unidirectional queues. Each
//! process pair (site and core, connection process and core) uses one queue per
//! direction. A send on a full queue waits; a send on a closed queue is fatal.
//!
//! Two implementations exist:
//! - [`memory`]: bounded in-process channels, used when both sides share a process
//!   and throughout the tests
//! - [`socket`]: a Unix domain socket with length-delimited framing, used between
//!   separate processes

pub mod memory;
#[cfg(unix)]
pub mod socket;

use std::sync::Arc;

use crate::Result;
use crate::types::Envelope;

/// Default queue depth between processes.
pub const QUEUE_DEPTH: usize = 10;

/// Sending half of a queue.
///
/// Shared by every task that needs to push envelopes toward the peer process, so
/// implementations serialize concurrent sends internally.
#[async_trait::async_trait]
pub trait EnvelopeSink: Send + Sync + 'static {
    /// Serialize and enqueue one envelope
    ///
    /// Returns:
    /// - `Ok(())` - Envelope accepted by the queue
    /// - `Err(e)` - Queue closed or link failed (fatal to the caller)
    async fn send(&self, envelope: &Envelope) -> Result<()>;
}

/// Receiving half of a queue. Exactly one task owns it.
#[async_trait::async_trait]
pub trait EnvelopeSource: Send + 'static {
    /// Wait for the next envelope
    ///
    /// Returns:
    /// - `Ok(Some(envelope))` - Next envelope
    /// - `Ok(None)` - Peer closed the queue
    /// - `Err(e)` - Malformed message or broken link
    async fn recv(&mut self) -> Result<Option<Envelope>>;
}

/// Both directions of a link to one peer process.
pub struct QueuePair {
    pub sink: Arc<dyn EnvelopeSink>,
    pub source: Box<dyn EnvelopeSource>,
}

impl QueuePair {
    pub fn new(sink: impl EnvelopeSink, source: impl EnvelopeSource) -> Self {
        Self { sink: Arc::new(sink), source: Box::new(source) }
    }

    /// Two in-memory pairs wired back to back, one for each side of a link.
    pub fn memory_link(name: &str, depth: usize) -> (QueuePair, QueuePair) {
        let (a_tx, a_rx) = memory::channel(&format!("{name}-up"), depth);
        let (b_tx, b_rx) = memory::channel(&format!("{name}-down"), depth);
        (QueuePair::new(a_tx, b_rx), QueuePair::new(b_tx, a_rx))
    }
}
