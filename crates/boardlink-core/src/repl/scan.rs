//! Bounded text scans over a pipeline
//!
//! A scan buffers all text it sees until its condition holds or the overall
//! deadline passes. On timeout the buffer is returned as it stands, so a
//! caller can tell "partial" from "empty".

use regex::Regex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::pipeline::{Pipeline, PipelineReader};
use crate::protocol::ProtocolError;
use crate::transport::Device;

/// Text collected by a scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    pub buffer: String,
    /// False when the scan ended on timeout or end of stream
    pub matched: bool,
}

impl ScanResult {
    /// The buffer, or [`ProtocolError::IncompleteOutput`] if unmatched
    pub fn into_complete(self) -> Result<String, ProtocolError> {
        if self.matched {
            Ok(self.buffer)
        } else {
            Err(ProtocolError::IncompleteOutput {
                partial: self.buffer,
            })
        }
    }
}

/// Character-level text view of everything the device sends from now on
pub fn text_reader(device: &Device) -> PipelineReader {
    PipelineReader::new(device.subscribe(), Pipeline::builder().text_chars().build())
}

/// Like [`text_reader`], but silent until `marker` has been seen
pub fn text_reader_after(device: &Device, marker: &str) -> PipelineReader {
    PipelineReader::new(
        device.subscribe(),
        Pipeline::builder().text_chars().read_after(marker).build(),
    )
}

/// Scan until the buffer ends with `end`
pub async fn read_until(
    reader: &mut PipelineReader,
    end: &str,
    timeout: Duration,
) -> Result<ScanResult, ProtocolError> {
    scan(reader, timeout, |buffer| buffer.ends_with(end)).await
}

/// Scan until `pattern` matches anywhere in the buffer
pub async fn read_until_match(
    reader: &mut PipelineReader,
    pattern: &Regex,
    timeout: Duration,
) -> Result<ScanResult, ProtocolError> {
    scan(reader, timeout, |buffer| pattern.is_match(buffer)).await
}

async fn scan(
    reader: &mut PipelineReader,
    timeout: Duration,
    mut done: impl FnMut(&str) -> bool,
) -> Result<ScanResult, ProtocolError> {
    let deadline = Instant::now() + timeout;
    let mut buffer = String::new();
    loop {
        match tokio::time::timeout_at(deadline, reader.next()).await {
            Err(_) => {
                debug!("Scan timed out with {} chars buffered", buffer.len());
                return Ok(ScanResult {
                    buffer,
                    matched: false,
                });
            }
            Ok(Ok(Some(chunk))) => {
                buffer.push_str(&chunk.as_text());
                if done(&buffer) {
                    return Ok(ScanResult {
                        buffer,
                        matched: true,
                    });
                }
            }
            Ok(Ok(None)) => {
                debug!("Stream ended during scan");
                return Ok(ScanResult {
                    buffer,
                    matched: false,
                });
            }
            Ok(Err(e)) => return Err(e),
        }
    }
}
