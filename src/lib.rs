//! Protocol stack for fingerprint time-clock terminals.
//!
//! Clockwire speaks the terminals' fixed-layout binary protocol over TCP and relays
//! it between three cooperating processes over bounded envelope queues:
//!
//! - the **connection process** accepts terminal links, frames packets, acknowledges
//!   them and tracks every ack-required packet it sends ([`connection`])
//! - the **core process** keeps the device registry, correlates commands with their
//!   multi-part responses and streams firmware ([`backend`])
//! - the **site process** submits commands on behalf of users ([`backend::SiteLink`])
//!
//! # Features
//!
//! - **Wire compatibility**: fixed per-type packet lengths, firmware status codes and
//!   device CRC variants reproduced exactly
//! - **Link supervision**: lost device ACKs tear the connection down deterministically
//! - **Single flight**: at most one command or firmware transfer per terminal
//! - **Transport choice**: in-memory queues or Unix sockets between processes
//!
//! ## Example (in-process wiring)
//!
//! ```rust,no_run
//! use clockwire::{Config, CoreService, PacketServer, QueuePair};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let (packet_side, core_side) = QueuePair::memory_link("packet", config.ipc.queue_depth);
//!     let (site_side, core_site) = QueuePair::memory_link("site", config.ipc.queue_depth);
//!
//!     let core = Arc::new(CoreService::new(&config, core_side.sink, core_site.sink));
//!     let server = Arc::new(PacketServer::new(config.link.clone(), packet_side.sink));
//!     let listener = tokio::net::TcpListener::bind(&config.server.listen_addr).await?;
//!
//!     let cancel = CancellationToken::new();
//!     tokio::spawn(core.run(core_side.source, core_site.source, cancel.clone()));
//!     let _site = clockwire::SiteLink::new(site_side);
//!     server.run(listener, packet_side.source, cancel).await?;
//!     Ok(())
//! }
//! ```

// Wire format
pub mod codec;
pub mod crc;
mod error;
pub mod types;

// Processes and the queues between them
pub mod backend;
pub mod connection;
pub mod ipc;

// Ambient
pub mod config;
pub mod logging;

#[cfg_attr(any(test, feature = "benchmark"), path = "test_utils.rs")]
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;

pub use codec::Framer;
pub use config::Config;
pub use backend::{CommandMux, CommandReply, CoreService, DeviceRegistry, FotaOutcome, SiteLink};
pub use connection::{ConnectionRouter, ConnectionSupervisor, PacketServer, TransactionLedger};
pub use error::*;
pub use ipc::{EnvelopeSink, EnvelopeSource, QueuePair};
pub use types::*;
