//! Error types for the terminal protocol stack.
//!
//! Every fallible operation in clockwire returns [`ProtocolError`]. Variants carry
//! structured context (packet type, transaction id, queue name) so that log lines
//! identify the failing link without extra plumbing.
//!
//! ## Error Categories
//!
//! - **Protocol violations**: malformed or truncated packets, unknown type tags,
//!   duplicate or missing transaction ids. These are fatal to the owning connection
//!   (or process) and are never retried.
//! - **Link failures**: socket I/O errors and closed inter-process queues.
//! - **Timeouts**: operations that did not complete inside their window.
//! - **Configuration**: unreadable config files, invalid values, misaligned firmware.
//!
//! ## Fatal vs recoverable
//!
//! ```rust
//! use clockwire::ProtocolError;
//!
//! let error = ProtocolError::duplicate_transaction(2001);
//! assert!(error.is_fatal());
//! for suggestion in error.recovery_suggestions() {
//!     println!("  - {}", suggestion);
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::types::PacketType;

/// Result type alias for protocol operations.
pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;

/// Main error type for protocol operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("Unknown packet type tag {tag}")]
    UnknownPacketType { tag: u8 },

    #[error("Truncated {packet_type:?} packet: need {expected} bytes, have {found}")]
    Truncated { packet_type: PacketType, expected: usize, found: usize },

    #[error("{packet_type:?} payload too large: max {max} bytes, got {found}")]
    PayloadTooLarge { packet_type: PacketType, max: usize, found: usize },

    #[error("Parse error in {context}: {details}")]
    Parse { context: String, details: String },

    #[error("Transaction {id} is already outstanding")]
    DuplicateTransaction { id: u16 },

    #[error("Transaction {id} is not outstanding")]
    UnknownTransaction { id: u16 },

    #[error("Transaction ledger full ({capacity} outstanding)")]
    LedgerFull { capacity: usize },

    #[error("Device {device_id} already has a live command route")]
    RouteConflict { device_id: u64 },

    #[error("Unexpected {packet_type:?} packet in {context}")]
    UnexpectedPacket { packet_type: PacketType, context: String },

    #[error("Link I/O failed: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Queue '{queue}' is closed")]
    QueueClosed { queue: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Task group '{group}' did not stop within {duration:?}")]
    ShutdownTimeout { group: String, duration: Duration },

    #[error("Task '{task}' failed: {details}")]
    TaskFailed { task: String, details: String },

    #[error("Configuration error: {details}")]
    Config { details: String },

    #[error("Failed to read configuration {path}")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Firmware image error: {path}")]
    Firmware {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Firmware image {path} is {size} bytes, not a multiple of the {block} byte block")]
    MisalignedImage { path: PathBuf, size: usize, block: usize },
}

impl ProtocolError {
    /// Returns whether this error indicates a corrupted link, a programming bug or
    /// a broken deployment, i.e. something that must not be retried.
    pub fn is_fatal(&self) -> bool {
        match self {
            ProtocolError::UnknownPacketType { .. } => true,
            ProtocolError::Truncated { .. } => true,
            ProtocolError::PayloadTooLarge { .. } => true,
            ProtocolError::Parse { .. } => true,
            ProtocolError::DuplicateTransaction { .. } => true,
            ProtocolError::UnknownTransaction { .. } => true,
            ProtocolError::LedgerFull { .. } => true,
            ProtocolError::RouteConflict { .. } => true,
            ProtocolError::UnexpectedPacket { .. } => true,
            ProtocolError::QueueClosed { .. } => true,
            ProtocolError::ShutdownTimeout { .. } => true,
            ProtocolError::TaskFailed { .. } => true,
            ProtocolError::MisalignedImage { .. } => true,
            ProtocolError::Config { .. } => true,
            ProtocolError::ConfigFile { .. } => true,
            ProtocolError::Io { .. } => false,
            ProtocolError::Timeout { .. } => false,
            ProtocolError::Firmware { .. } => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            ProtocolError::UnknownPacketType { .. }
            | ProtocolError::Truncated { .. }
            | ProtocolError::PayloadTooLarge { .. }
            | ProtocolError::Parse { .. } => vec![
                "Check terminal firmware version against the server build",
                "Inspect the link for corruption or a foreign client",
            ],
            ProtocolError::DuplicateTransaction { .. }
            | ProtocolError::UnknownTransaction { .. }
            | ProtocolError::LedgerFull { .. } => vec![
                "Check that transaction ids are not reused while outstanding",
                "Verify the terminal acknowledges ack-required packets",
            ],
            ProtocolError::RouteConflict { .. } => {
                vec!["Report a bug: two operations were admitted for one device"]
            }
            ProtocolError::UnexpectedPacket { .. } => vec![
                "Check terminal firmware version against the server build",
                "Verify the terminal is not running a diagnostic build",
            ],
            ProtocolError::Io { .. } => vec![
                "Check network connectivity to the terminal",
                "The terminal will reconnect on its own",
            ],
            ProtocolError::QueueClosed { .. } => vec![
                "Check that the peer process is running",
                "Restart both processes",
            ],
            ProtocolError::Timeout { .. } => vec![
                "Increase the timeout for this operation class",
                "Check the terminal is online",
            ],
            ProtocolError::TaskFailed { .. } => vec![
                "Check the log for a panic message",
                "Restart the process",
            ],
            ProtocolError::ShutdownTimeout { .. } => vec![
                "Restart the connection process",
                "Report a bug: a link task ignored its shutdown signal",
            ],
            ProtocolError::Config { .. } | ProtocolError::ConfigFile { .. } => vec![
                "Check the configuration file path and YAML syntax",
                "Remove the offending key to fall back to its default",
            ],
            ProtocolError::Firmware { .. } | ProtocolError::MisalignedImage { .. } => vec![
                "Run `clockwire align-firmware` to produce an aligned image",
                "Check the firmware directory path",
            ],
        }
    }

    /// Helper constructor for I/O failures on a link.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ProtocolError::Io { context: context.into(), source }
    }

    /// Helper constructor for parse errors.
    pub fn parse(context: impl Into<String>, details: impl Into<String>) -> Self {
        ProtocolError::Parse { context: context.into(), details: details.into() }
    }

    /// Helper constructor for closed queue errors.
    pub fn queue_closed(queue: impl Into<String>) -> Self {
        ProtocolError::QueueClosed { queue: queue.into() }
    }

    /// Helper constructor for duplicate transaction errors.
    pub fn duplicate_transaction(id: u16) -> Self {
        ProtocolError::DuplicateTransaction { id }
    }

    /// Helper constructor for a spawned task that panicked or was aborted.
    pub fn task_failed(task: impl Into<String>, details: impl std::fmt::Display) -> Self {
        ProtocolError::TaskFailed { task: task.into(), details: details.to_string() }
    }

    /// Helper constructor for configuration errors.
    pub fn config(details: impl Into<String>) -> Self {
        ProtocolError::Config { details: details.into() }
    }

    /// Helper constructor for firmware file errors.
    pub fn firmware(path: PathBuf, source: std::io::Error) -> Self {
        ProtocolError::Firmware { path, source }
    }

    /// Helper constructor for unexpected packet errors.
    pub fn unexpected(packet_type: PacketType, context: impl Into<String>) -> Self {
        ProtocolError::UnexpectedPacket { packet_type, context: context.into() }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        ProtocolError::Io { context: "<unknown>".to_string(), source: err }
    }
}
