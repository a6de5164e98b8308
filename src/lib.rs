//! # Panelbus
//!
//! Bridge between a flight simulator's network export stream and physical
//! cockpit hardware attached through a serial bus controller.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Simulator (UDP export)                      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │   UdpReceiver ── receive loop, peer tracking, command channel   │
//! ├────────────────────────────┬────────────────────────────────────┤
//! │   StreamParser             │   raw-byte tap (StreamListener)    │
//! │   (address, value) events  │                                    │
//! ├────────────────────────────┴────────────────────────────────────┤
//! │   BusController ── ring buffer + credit-based serial handshake  │
//! ├─────────────────────────────────────────────────────────────────┤
//! │        Panel hardware (small-buffer serial bus controller)      │
//! └─────────────────────────────────────────────────────────────────┘
//!
//! Data flows down as decoded register writes streamed to the device under
//! flow control, and back up as framed command packets relayed to the
//! simulator's command port.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow stylistic lints that don't affect correctness
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)] // ASCII diagrams in docs
#![allow(clippy::cast_possible_truncation)] // Intentional wire-format arithmetic
#![allow(clippy::cognitive_complexity)] // Protocol state machines
#![allow(clippy::use_self)] // Explicit type names in matches
#![allow(clippy::significant_drop_tightening)] // Lock ordering is intentional

pub mod bus;
pub mod config;
pub mod error;
pub mod protocol;
pub mod receiver;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default multicast group the simulator exports on.
pub const DEFAULT_GROUP: std::net::Ipv4Addr = std::net::Ipv4Addr::new(239, 255, 50, 10);

/// Default port for the simulator-to-bridge export stream.
pub const DEFAULT_PORT: u16 = 5010;

/// Default port commands are sent back to the simulator on.
pub const DEFAULT_COMMAND_PORT: u16 = 7778;

/// Maximum practical export datagram size.
pub const MAX_DATAGRAM: usize = 2048;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bus::{BusController, BusStats, SerialLink};
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::protocol::{
        CommandPacket, DataListener, FrameBuilder, PacketParser, StreamListener, StreamParser,
        SyncListener,
    };
    pub use crate::receiver::{CommandSink, UdpReceiver};
}
