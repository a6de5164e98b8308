//! Wire protocols spoken by the bridge.
//!
//! Two independent byte-oriented state machines live here:
//!
//! - [`StreamParser`] decodes the simulator's export stream into discrete
//!   `(address, value)` writes and frame-sync events, resynchronizing itself
//!   after data loss.
//! - [`PacketParser`] decodes framed command packets originated by panel
//!   devices (start marker, lead-in, packed type/address, size, payload,
//!   additive checksum).
//!
//! [`FrameBuilder`] is the encode-side counterpart of the export stream,
//! used by tests and stream generators.

mod packet;
mod stream;
mod wire;

pub use packet::{CommandPacket, PacketParser};
pub use stream::{ParserStats, StreamParser, StreamRegistry};
pub use wire::FrameBuilder;

/// Synchronization byte of the export stream.
pub const SYNC_BYTE: u8 = 0x55;

/// Number of consecutive sync bytes that force resynchronization.
pub const SYNC_RUN: u8 = 4;

/// Reserved address marking "no more data this cycle"; never exported as a
/// real address (it is the little-endian image of a sync-byte pair).
pub const NOOP_ADDRESS: u16 = 0x5555;

/// Reserved address marking the end of an export frame.
pub const FRAME_SYNC_ADDRESS: u16 = 0xfffe;

/// Start marker of a device-originated command packet.
pub const PACKET_START: u8 = 0xBB;

/// Lead-in marker of a device-originated command packet.
pub const PACKET_LEADIN: u8 = 0x88;

/// Listener for decoded export-stream writes.
///
/// Calls arrive on the receive-loop thread, strictly in stream order, never
/// overlapping. Register state is only self-consistent during a
/// [`SyncListener`] callback; values read outside one may be a torn view of
/// a multi-word update.
pub trait DataListener: Send + Sync {
    /// Called for every 16-bit cell written by the stream.
    fn data_written(&self, address: u16, value: u16);
}

/// Listener for end-of-frame sync events.
pub trait SyncListener: Send + Sync {
    /// Called once per well-formed frame, after all of its writes.
    fn frame_sync(&self);
}

/// Listener for the raw datagram byte stream, before any decoding.
///
/// Used by the bus controller to forward the verbatim export stream to
/// panel hardware.
pub trait StreamListener: Send + Sync {
    /// Called with each received datagram payload.
    fn stream_data(&self, data: &[u8]);
}
