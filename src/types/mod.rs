//! Core types for the terminal wire protocol.
//!
//! ## Architecture
//!
//! - [`PacketType`] maps the type tag to its fixed wire length
//! - [`Packet`] is one decoded packet, [`Envelope`] adds routing identifiers
//! - [`payload`] holds the typed layouts that live inside packet payloads
//! - [`wire`] holds numeric codes shared with terminal firmware
//!
//! ## Usage Example
//!
//! ```rust
//! use clockwire::types::{CommandPayload, PacketType, wire::cmd_type};
//!
//! let cmd = CommandPayload::new(cmd_type::GET_ALL_USERS, Vec::new());
//! let packet = cmd.into_packet(2001).unwrap();
//! assert_eq!(packet.packet_type, PacketType::Cmd);
//! assert!(packet.ack_required);
//! assert_eq!(packet.encode().unwrap().len(), PacketType::Cmd.wire_len());
//! ```

mod packet;
mod packet_type;
pub mod payload;
pub mod wire;

pub use packet::{Envelope, Packet};
pub use packet_type::{
    HEADER_LEN, LARGE_PAYLOAD, MAX_PACKET_LEN, MEDIUM_PAYLOAD, PacketType, SMALL_PAYLOAD,
};
pub use payload::{AddUser, CommandPayload, CommandResponse, FotaAck, FotaControl, Hello, Login};
