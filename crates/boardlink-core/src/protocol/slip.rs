//! SLIP framing for the bootloader serial protocol
//!
//! Every bootloader packet travels as a frame delimited by `END` bytes.
//! Inside a frame a literal `END` is sent as `ESC ESC_END` and a literal
//! `ESC` as `ESC ESC_ESC`.
//!
//! The decoder is incremental: it is fed one byte at a time and yields at most
//! one complete frame per byte. [`SlipCodec`] wraps it for use with
//! `tokio_util::codec::FramedRead`.

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use super::ProtocolError;

pub const END: u8 = 0xC0; // frame delimiter
pub const ESC: u8 = 0xDB;
pub const ESC_END: u8 = 0xDC;
pub const ESC_ESC: u8 = 0xDD;

/// What the decoder does with bytes that violate the framing rules
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FramingPolicy {
    /// Fail with [`ProtocolError::Framing`]
    #[default]
    Reject,
    /// Drop the offending byte and log a warning
    Skip,
}

/// Decoder state, derived from the in-flight buffer and escape flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    /// Waiting for a start marker
    Idle,
    /// Collecting payload bytes
    Accumulating,
    /// Previous byte was `ESC`
    Escaping,
}

/// A complete frame, or the error for one rejected byte
pub type Decoded = Result<Vec<u8>, ProtocolError>;

/// Wrap a payload in `END` markers, escaping `END` and `ESC` bytes
pub fn slip_encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.push(END);
    for &b in payload {
        match b {
            ESC => {
                out.push(ESC);
                out.push(ESC_ESC);
            }
            END => {
                out.push(ESC);
                out.push(ESC_END);
            }
            _ => out.push(b),
        }
    }
    out.push(END);
    out
}

/// Incremental SLIP decoder
#[derive(Debug)]
pub struct SlipDecoder {
    /// Present only between a start marker and its end marker
    cache: Option<Vec<u8>>,
    escaping: bool,
    policy: FramingPolicy,
    run_once: bool,
    enabled: bool,
    terminated: bool,
}

impl Default for SlipDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SlipDecoder {
    /// Create a decoder that rejects malformed input
    pub fn new() -> Self {
        Self::with_policy(FramingPolicy::Reject)
    }

    /// Create a decoder with the given framing policy
    pub fn with_policy(policy: FramingPolicy) -> Self {
        Self {
            cache: None,
            escaping: false,
            policy,
            run_once: false,
            enabled: true,
            terminated: false,
        }
    }

    /// Stop decoding after the first complete frame
    pub fn run_once(mut self, run_once: bool) -> Self {
        self.run_once = run_once;
        self
    }

    pub fn policy(&self) -> FramingPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: FramingPolicy) {
        self.policy = policy;
    }

    pub fn state(&self) -> DecoderState {
        match (&self.cache, self.escaping) {
            (None, _) => DecoderState::Idle,
            (Some(_), false) => DecoderState::Accumulating,
            (Some(_), true) => DecoderState::Escaping,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enable or disable decoding. A disabled decoder passes chunks through
    /// unchanged; toggling always discards any partial frame.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.reset();
    }

    /// True once a single-shot decoder has produced its frame
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Discard any partial frame
    pub fn reset(&mut self) {
        self.cache = None;
        self.escaping = false;
    }

    /// Feed one byte, returning a frame when this byte completes one
    pub fn push(&mut self, byte: u8) -> Result<Option<Vec<u8>>, ProtocolError> {
        if self.terminated {
            return Ok(None);
        }

        let Some(cache) = self.cache.as_mut() else {
            if byte == END {
                self.cache = Some(Vec::new());
            } else {
                self.violation(format!("header not seen yet, got {:#04x}", byte))?;
            }
            return Ok(None);
        };

        if self.escaping {
            self.escaping = false;
            match byte {
                ESC_END => cache.push(END),
                ESC_ESC => cache.push(ESC),
                _ => self.violation(format!(
                    "escaping but no char type to escape, got {:#04x}",
                    byte
                ))?,
            }
            return Ok(None);
        }

        match byte {
            ESC => self.escaping = true,
            END => {
                let frame = self.cache.take().unwrap_or_default();
                trace!("SLIP frame complete: {} bytes", frame.len());
                if self.run_once {
                    self.terminated = true;
                }
                return Ok(Some(frame));
            }
            _ => cache.push(byte),
        }
        Ok(None)
    }

    /// Feed a chunk, returning what each byte produced in arrival order.
    ///
    /// A rejected byte shows up as an `Err` between the frames around it;
    /// decoding carries on with the next byte. A disabled decoder returns the
    /// chunk itself as the only item.
    pub fn decode_chunk(&mut self, chunk: &[u8]) -> Vec<Decoded> {
        if !self.enabled {
            self.reset();
            return vec![Ok(chunk.to_vec())];
        }
        let mut decoded = Vec::new();
        for &b in chunk {
            if self.terminated {
                break;
            }
            decoded.extend(self.push(b).transpose());
        }
        decoded
    }

    fn violation(&mut self, message: String) -> Result<(), ProtocolError> {
        match self.policy {
            FramingPolicy::Reject => {
                self.reset();
                Err(ProtocolError::Framing(message))
            }
            FramingPolicy::Skip => {
                warn!("Skipping data. {}", message);
                Ok(())
            }
        }
    }
}

/// `tokio_util` codec over [`SlipDecoder`] / [`slip_encode`]
#[derive(Debug, Default)]
pub struct SlipCodec {
    decoder: SlipDecoder,
}

impl SlipCodec {
    pub fn new(decoder: SlipDecoder) -> Self {
        Self { decoder }
    }

    pub fn decoder_mut(&mut self) -> &mut SlipDecoder {
        &mut self.decoder
    }
}

impl Decoder for SlipCodec {
    type Item = Vec<u8>;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if !self.decoder.is_enabled() {
            if src.is_empty() {
                return Ok(None);
            }
            return Ok(Some(src.split().to_vec()));
        }
        while !src.is_empty() && !self.decoder.is_terminated() {
            let byte = src[0];
            src.advance(1);
            if let Some(frame) = self.decoder.push(byte)? {
                return Ok(Some(frame));
            }
        }
        Ok(None)
    }
}

impl<'a> Encoder<&'a [u8]> for SlipCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: &'a [u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&slip_encode(item));
        Ok(())
    }
}
