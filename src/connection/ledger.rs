//! Transaction ledger
//!
//! Tracks ack-required packets written to a terminal until the matching device ACK
//! arrives. A lost ACK means the link state is unknown: [`TransactionLedger::scan_timeouts`]
//! turns each expired entry into a synthesized `CMD_ACK_TIMED_OUT` response, and the
//! owning supervisor tears the connection down.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::types::wire::cmd_status;
use crate::types::{CommandResponse, Packet};
use crate::{ProtocolError, Result};

/// Default bound on outstanding ack-required packets per connection.
pub const MAX_OUTSTANDING_TRANSACTIONS: usize = 16;

/// Default age after which an unacknowledged packet counts as lost.
pub const ACK_TIMEOUT: Duration = Duration::from_millis(5000);

/// Outstanding transactions for one connection.
///
/// Owned by the connection supervisor task; every access goes through `&mut self`.
#[derive(Debug)]
pub struct TransactionLedger {
    entries: HashMap<u16, Instant>,
    capacity: usize,
    timeout: Duration,
}

impl Default for TransactionLedger {
    fn default() -> Self {
        Self::new(MAX_OUTSTANDING_TRANSACTIONS, ACK_TIMEOUT)
    }
}

impl TransactionLedger {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        Self { entries: HashMap::with_capacity(capacity), capacity, timeout }
    }

    /// Register a transaction sent at `now`.
    ///
    /// Fails if `id` is already outstanding or the ledger is full.
    pub fn append(&mut self, id: u16, now: Instant) -> Result<()> {
        if self.entries.contains_key(&id) {
            return Err(ProtocolError::duplicate_transaction(id));
        }
        if self.entries.len() >= self.capacity {
            return Err(ProtocolError::LedgerFull { capacity: self.capacity });
        }
        self.entries.insert(id, now);
        Ok(())
    }

    /// Remove a transaction on receipt of its ACK. Returns how long it was outstanding.
    pub fn pop(&mut self, id: u16, now: Instant) -> Result<Duration> {
        let created = self.entries.remove(&id).ok_or(ProtocolError::UnknownTransaction { id })?;
        let age = now.saturating_duration_since(created);
        debug!("Transaction {} acknowledged after {:?}", id, age);
        Ok(age)
    }

    /// Evict every transaction older than the timeout.
    ///
    /// Returns one synthesized single-part `CMD_RESPONSE` per evicted id, in id order.
    /// A non-empty result means the connection must be torn down.
    pub fn scan_timeouts(&mut self, now: Instant) -> Vec<Packet> {
        let timeout = self.timeout;
        let mut expired: Vec<u16> = self
            .entries
            .iter()
            .filter(|(_, created)| now.saturating_duration_since(**created) > timeout)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();

        let mut responses = Vec::with_capacity(expired.len());
        for id in expired {
            self.entries.remove(&id);
            warn!("Transaction {} not acknowledged within {:?}", id, timeout);
            let response = CommandResponse::status_only(cmd_status::CMD_ACK_TIMED_OUT, id);
            match response.into_packet(id) {
                Ok(packet) => responses.push(packet),
                Err(e) => warn!("Failed to synthesize timeout response for {}: {}", id, e),
            }
        }
        responses
    }

    pub fn contains(&self, id: u16) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PacketType;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    #[derive(Debug, Clone)]
    enum Op {
        Append(u16),
        Pop(u16),
        Advance(u64),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u16..24).prop_map(Op::Append),
            (0u16..24).prop_map(Op::Pop),
            (0u64..3000).prop_map(Op::Advance),
        ]
    }

    proptest! {
        #[test]
        fn prop_each_id_leaves_exactly_once(ops in proptest::collection::vec(arb_op(), 0..80)) {
            let start = Instant::now();
            let mut now = start;
            let mut ledger = TransactionLedger::default();
            let mut live = BTreeSet::new();
            let mut appended = 0usize;
            let mut left = 0usize;

            for op in ops {
                match op {
                    Op::Append(id) => {
                        let result = ledger.append(id, now);
                        if live.contains(&id) {
                            let duplicate = matches!(result, Err(ProtocolError::DuplicateTransaction { .. }));
                            prop_assert!(duplicate);
                        } else if live.len() >= MAX_OUTSTANDING_TRANSACTIONS {
                            prop_assert!(result.is_err());
                        } else {
                            prop_assert!(result.is_ok());
                            live.insert(id);
                            appended += 1;
                        }
                    }
                    Op::Pop(id) => {
                        let result = ledger.pop(id, now);
                        if live.remove(&id) {
                            prop_assert!(result.is_ok());
                            left += 1;
                        } else {
                            let unknown = matches!(result, Err(ProtocolError::UnknownTransaction { .. }));
                            prop_assert!(unknown);
                        }
                    }
                    Op::Advance(ms) => {
                        now += Duration::from_millis(ms);
                        for packet in ledger.scan_timeouts(now) {
                            prop_assert!(live.remove(&packet.transaction_id));
                            left += 1;
                        }
                    }
                }
            }
            prop_assert_eq!(appended, left + live.len());
            prop_assert_eq!(ledger.len(), live.len());
        }
    }

    #[test]
    fn duplicate_append_is_fatal() {
        let now = Instant::now();
        let mut ledger = TransactionLedger::default();
        ledger.append(2001, now).unwrap();
        let err = ledger.append(2001, now).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn pop_of_unknown_id_is_fatal() {
        let mut ledger = TransactionLedger::default();
        let err = ledger.pop(9, Instant::now()).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownTransaction { id: 9 }));
        assert!(err.is_fatal());
    }

    #[test]
    fn capacity_is_enforced() {
        let now = Instant::now();
        let mut ledger = TransactionLedger::new(2, ACK_TIMEOUT);
        ledger.append(1, now).unwrap();
        ledger.append(2, now).unwrap();
        assert!(matches!(ledger.append(3, now), Err(ProtocolError::LedgerFull { capacity: 2 })));
    }

    #[test]
    fn timeout_synthesizes_ack_timed_out_response() {
        let start = Instant::now();
        let mut ledger = TransactionLedger::default();
        ledger.append(2005, start).unwrap();
        ledger.append(2006, start + Duration::from_secs(3)).unwrap();

        assert!(ledger.scan_timeouts(start + ACK_TIMEOUT).is_empty());

        let expired = ledger.scan_timeouts(start + Duration::from_millis(5001));
        assert_eq!(expired.len(), 1);
        let packet = &expired[0];
        assert_eq!(packet.packet_type, PacketType::CmdResponse);
        assert_eq!(packet.transaction_id, 2005);
        let response = CommandResponse::decode(&packet.payload).unwrap();
        assert_eq!(response.status, cmd_status::CMD_ACK_TIMED_OUT);
        assert_eq!(response.total_packets, 1);
        assert_eq!(response.transaction_id, 2005);

        assert!(!ledger.contains(2005));
        assert!(ledger.contains(2006));
    }
}
