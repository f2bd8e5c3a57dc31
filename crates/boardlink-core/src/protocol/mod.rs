//! Bootloader serial protocol
//!
//! Implements the ESP ROM bootloader protocol: SLIP framing, command and
//! response packets, and a [`DeviceLink`] that issues commands over a shared
//! [`crate::transport::Device`].

pub mod commands;
mod error;
pub mod link;
pub mod packet;
pub mod slip;

pub use commands::BootloaderCommand;
pub use error::ProtocolError;
pub use link::{CheckResult, ConnectionMode, DeviceLink, LinkConfig, SyncOutcome};
pub use packet::{
    build_command, parse_response, sync_payload, CommandPacket, PacketBuilder, ResponsePacket,
};
pub use slip::{slip_encode, Decoded, DecoderState, FramingPolicy, SlipCodec, SlipDecoder};

/// Default baud rate for bootloader communication
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default timeout for command responses in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Maximum command payload, bounded by the 16-bit length field
pub const MAX_PACKET_SIZE: usize = u16::MAX as usize;
