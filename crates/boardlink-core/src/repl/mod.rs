//! Interactive interpreter (REPL) control
//!
//! Mode switching through control sequences, bounded text scans, and a
//! session that runs queued commands through the raw REPL.

pub mod control;
pub mod scan;
mod session;

pub use control::{BusyState, PromptTracker, ReplState};
pub use scan::{read_until, read_until_match, ScanResult};
pub use session::{ReplConfig, ReplSession, ScheduledCommand};
