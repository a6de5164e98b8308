//! Error types for Panelbus.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Result type alias for Panelbus operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Panelbus.
#[derive(Error, Debug)]
pub enum Error {
    // Transport errors
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    // Protocol errors
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // Bus controller errors
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // General errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Transport layer errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("bind failed on {addr}: {reason}")]
    BindFailed { addr: SocketAddr, reason: String },

    #[error("multicast join failed for {group}: {reason}")]
    MulticastJoinFailed { group: String, reason: String },

    #[error("socket error: {0}")]
    SocketError(String),
}

/// Protocol parsing errors.
///
/// Checksum mismatches in the wire formats are deliberately *not* errors:
/// both parsers silently discard and resynchronize. These variants cover
/// encode-side misuse only.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("reserved address {0:#06x} cannot be exported")]
    ReservedAddress(u16),

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
}

/// Bus controller errors.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("ring buffer overflow: capacity {capacity} exceeded")]
    BufferOverflow { capacity: usize },

    #[error("serial link write failed: {0}")]
    WriteFailed(String),

    #[error("controller faulted after buffer overflow")]
    Faulted,
}
