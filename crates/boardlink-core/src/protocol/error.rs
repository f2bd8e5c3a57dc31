//! Protocol errors

use thiserror::Error;

/// Errors that can occur while talking to the device
///
/// The type is `Clone` because a single pending read may be observed by
/// several callers at once.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Device reported failure for {command}: status bytes {status:02x?}")]
    DeviceError { command: String, status: Vec<u8> },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Not connected to device")]
    NotConnected,

    #[error("Invalid response from device: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Command output incomplete after timeout ({} chars buffered)", partial.len())]
    IncompleteOutput { partial: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Port not found: {0}")]
    PortNotFound(String),
}

impl ProtocolError {
    /// True for errors the caller can recover from by retrying
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ProtocolError::Timeout | ProtocolError::IncompleteOutput { .. }
        )
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Transport(e.to_string())
    }
}

impl From<tokio_serial::Error> for ProtocolError {
    fn from(e: tokio_serial::Error) -> Self {
        match e.kind {
            tokio_serial::ErrorKind::NoDevice => ProtocolError::PortNotFound(e.description),
            _ => ProtocolError::Transport(e.description),
        }
    }
}

impl From<tokio::time::error::Elapsed> for ProtocolError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ProtocolError::Timeout
    }
}
