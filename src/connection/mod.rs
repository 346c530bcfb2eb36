//! Connection process
//!
//! Everything that runs on the terminal-facing side of the inter-process transport:
//! the per-connection [`TransactionLedger`], the [`ConnectionSupervisor`] that owns one
//! TCP link, the [`ConnectionRouter`] that delivers core envelopes to supervisors, and
//! the [`PacketServer`] accept loop.

pub mod ledger;
pub mod router;
pub mod server;
pub mod supervisor;

pub use ledger::{ACK_TIMEOUT, MAX_OUTSTANDING_TRANSACTIONS, TransactionLedger};
pub use router::{ConnectionRouter, Delivery};
pub use server::PacketServer;
pub use supervisor::{ConnectionSupervisor, Link, LinkAction, LinkState, ShutdownReason};

#[cfg(test)]
mod tests;
