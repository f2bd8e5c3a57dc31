//! Configuration
//!
//! All settings deserialize from JSON; any missing field takes its default.
//!
//! ```json
//! {
//!   "port": { "name": "/dev/ttyUSB0", "baud_rate": 115200 },
//!   "link": { "sync_probes": 7, "framing_policy": "skip" },
//!   "repl": { "settle_delay_ms": 500 }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::protocol::{LinkConfig, ProtocolError, DEFAULT_BAUD_RATE};
use crate::repl::ReplConfig;
use crate::transport::serial::DEFAULT_VENDOR_ID;

/// Which port to open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// Port name; when empty the first port of `vendor_id` is used
    pub name: String,
    pub baud_rate: u32,
    pub vendor_id: u16,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            vendor_id: DEFAULT_VENDOR_ID,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub port: PortConfig,
    pub link: LinkConfig,
    pub repl: ReplConfig,
}

impl Config {
    /// Parse from a JSON string
    pub fn from_str(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(|e| ProtocolError::Config(e.to_string()))
    }

    /// Load from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ProtocolError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ProtocolError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_str(&text)
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string_pretty(self).map_err(|e| ProtocolError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FramingPolicy;

    #[test]
    fn test_empty_object_is_default() {
        assert_eq!(Config::from_str("{}").unwrap(), Config::default());
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::from_str(
            r#"{ "link": { "framing_policy": "skip" }, "repl": { "settle_delay_ms": 10 } }"#,
        )
        .unwrap();
        assert_eq!(config.link.framing_policy, FramingPolicy::Skip);
        assert_eq!(config.link.sync_probes, 7);
        assert_eq!(config.repl.settle_delay_ms, 10);
        assert_eq!(config.repl.exec_timeout_ms, 5000);
        assert_eq!(config.port.baud_rate, 115200);
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let err = Config::from_str(r#"{ "link": { "framing_policy": "ignore" } }"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Config(_)));
    }
}
