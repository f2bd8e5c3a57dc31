//! # Boardlink Core Library
//!
//! Host-side control of microcontrollers over a serial link.
//!
//! This library provides:
//! - SLIP framing and the ESP ROM bootloader command protocol
//! - A bootloader link with sync handshake and download-mode reset
//! - A REPL session that runs queued commands through the raw REPL
//! - Composable stream pipelines over the raw byte stream
//! - Serial port discovery and a multi-reader device wrapper
//!
//! ## Example
//!
//! ```rust,ignore
//! use boardlink_core::prelude::*;
//!
//! let device = Device::new();
//! device.open("/dev/ttyUSB0", 115200).await?;
//!
//! // Bootloader
//! let link = DeviceLink::new(device.clone(), LinkConfig::default());
//! let outcome = link.connect(ConnectionMode::DefaultReset).await?;
//!
//! // Or the REPL
//! let repl = ReplSession::new(device, ReplConfig::default());
//! let output = repl.exec(["print(1 + 1)"]).await?;
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod pipeline;
pub mod protocol;
pub mod repl;
pub mod transport;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, PortConfig};
    pub use crate::pipeline::{Chunk, Pipeline, PipelineReader, ProtocolType};
    pub use crate::protocol::{
        BootloaderCommand, CheckResult, ConnectionMode, DeviceLink, FramingPolicy, LinkConfig,
        ProtocolError, ResponsePacket, SlipDecoder, SyncOutcome,
    };
    pub use crate::repl::{ReplConfig, ReplSession, ReplState, ScanResult, ScheduledCommand};
    pub use crate::transport::{list_ports, Device, DeviceEvent, PortInfo, SerialLink, Signals};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
