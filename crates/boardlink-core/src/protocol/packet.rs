//! Packet encoding/decoding
//!
//! Command packet (host → device), little-endian:
//! - 1 byte: direction, always `0x00`
//! - 1 byte: opcode
//! - 2 bytes: payload length
//! - 4 bytes: checksum (only meaningful for data commands)
//! - N bytes: payload
//!
//! Response packet (device → host), little-endian:
//! - 1 byte: status, `0x01` on success
//! - 1 byte: echoed opcode
//! - 2 bytes: returned data length
//! - 4 bytes: value
//! - N bytes: data, the last two of which are reserved status bytes
//!
//! Both travel SLIP-framed, see [`super::slip`].

use byteorder::{ByteOrder, LittleEndian};

use super::slip::slip_encode;
use super::{BootloaderCommand, ProtocolError, MAX_PACKET_SIZE};

/// Direction tag of every request
pub const DIRECTION_REQUEST: u8 = 0x00;

/// Status byte of a successful response
pub const RESPONSE_OK: u8 = 0x01;

/// Size of the fixed command/response header
pub const HEADER_LEN: usize = 8;

/// Reserved status bytes (error code, state) trailing the response data
pub const STATUS_BYTES_LENGTH: usize = 2;

/// Magic prefix of the sync payload
pub const SYNC_MAGIC: [u8; 4] = [0x07, 0x07, 0x12, 0x20];

/// Filler byte repeated after the sync magic
pub const SYNC_FILLER: u8 = 0x55;

/// Number of filler bytes in the sync payload
pub const SYNC_FILLER_LEN: usize = 32;

/// The canonical `Sync` payload: magic followed by 32 × `0x55`
pub fn sync_payload() -> Vec<u8> {
    let mut data = Vec::with_capacity(SYNC_MAGIC.len() + SYNC_FILLER_LEN);
    data.extend_from_slice(&SYNC_MAGIC);
    data.resize(SYNC_MAGIC.len() + SYNC_FILLER_LEN, SYNC_FILLER);
    data
}

/// A bootloader request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPacket {
    /// Opcode
    pub opcode: BootloaderCommand,
    /// Caller-supplied checksum, 0 unless the command carries checked data
    pub checksum: u32,
    /// Packet payload
    pub payload: Vec<u8>,
}

impl CommandPacket {
    /// Create a new packet
    pub fn new(opcode: BootloaderCommand, payload: Vec<u8>, checksum: u32) -> Self {
        Self {
            opcode,
            checksum,
            payload,
        }
    }

    /// Payload length as carried in the header
    pub fn length(&self) -> usize {
        self.payload.len()
    }

    /// Encode the packet to raw (unframed) bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.payload.len() > MAX_PACKET_SIZE {
            return Err(ProtocolError::InvalidRequest(format!(
                "payload of {} bytes exceeds the {} byte limit",
                self.payload.len(),
                MAX_PACKET_SIZE
            )));
        }

        let mut bytes = vec![0u8; HEADER_LEN];
        bytes[0] = DIRECTION_REQUEST;
        bytes[1] = self.opcode.opcode();
        LittleEndian::write_u16(&mut bytes[2..4], self.payload.len() as u16);
        LittleEndian::write_u32(&mut bytes[4..8], self.checksum);
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }

    /// Decode a packet from raw (unframed) bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::InvalidRequest(format!(
                "command packet of {} bytes is shorter than its header",
                data.len()
            )));
        }
        if data[0] != DIRECTION_REQUEST {
            return Err(ProtocolError::InvalidRequest(format!(
                "unexpected direction byte {:#04x}",
                data[0]
            )));
        }
        let opcode = BootloaderCommand::from_opcode(data[1]).ok_or_else(|| {
            ProtocolError::InvalidRequest(format!("unknown opcode {:#04x}", data[1]))
        })?;
        let length = LittleEndian::read_u16(&data[2..4]) as usize;
        let checksum = LittleEndian::read_u32(&data[4..8]);
        let payload = &data[HEADER_LEN..];
        if payload.len() != length {
            return Err(ProtocolError::InvalidRequest(format!(
                "length field says {} bytes, packet carries {}",
                length,
                payload.len()
            )));
        }
        Ok(Self::new(opcode, payload.to_vec(), checksum))
    }
}

/// Serialize a command packet and wrap it in a SLIP frame
pub fn build_command(
    opcode: BootloaderCommand,
    payload: &[u8],
    checksum: u32,
) -> Result<Vec<u8>, ProtocolError> {
    let packet = CommandPacket::new(opcode, payload.to_vec(), checksum);
    Ok(slip_encode(&packet.to_bytes()?))
}

/// A successful bootloader response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePacket {
    /// Echoed opcode
    pub opcode: u8,
    /// Returned data length as reported by the device
    pub return_length: u16,
    /// Returned value (register contents for `ReadReg`)
    pub value: u32,
    /// Returned data including the trailing status bytes
    pub data: Vec<u8>,
}

impl ResponsePacket {
    /// The reserved status bytes at the end of `data`, if present
    pub fn status_bytes(&self) -> Option<&[u8]> {
        self.data
            .len()
            .checked_sub(STATUS_BYTES_LENGTH)
            .map(|start| &self.data[start..])
    }

    /// `data` with the reserved status bytes removed
    pub fn payload(&self) -> &[u8] {
        let end = self.data.len().saturating_sub(STATUS_BYTES_LENGTH);
        &self.data[..end]
    }

    /// Encode as the device would (unframed); used by fake devices
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; HEADER_LEN];
        bytes[0] = RESPONSE_OK;
        bytes[1] = self.opcode;
        LittleEndian::write_u16(&mut bytes[2..4], self.return_length);
        LittleEndian::write_u32(&mut bytes[4..8], self.value);
        bytes.extend_from_slice(&self.data);
        bytes
    }
}

/// Parse a decoded frame into a response.
///
/// Returns `Ok(None)` when the status byte is not [`RESPONSE_OK`].
pub fn parse_response(frame: &[u8]) -> Result<Option<ResponsePacket>, ProtocolError> {
    if frame.len() < HEADER_LEN {
        return Err(ProtocolError::InvalidResponse(format!(
            "response of {} bytes is shorter than its header",
            frame.len()
        )));
    }
    if frame[0] != RESPONSE_OK {
        return Ok(None);
    }
    Ok(Some(ResponsePacket {
        opcode: frame[1],
        return_length: LittleEndian::read_u16(&frame[2..4]),
        value: LittleEndian::read_u32(&frame[4..8]),
        data: frame[HEADER_LEN..].to_vec(),
    }))
}

/// Builder for little-endian command payloads
pub struct PacketBuilder {
    opcode: BootloaderCommand,
    checksum: u32,
    payload: Vec<u8>,
}

impl PacketBuilder {
    /// Create a new packet builder
    pub fn new(opcode: BootloaderCommand) -> Self {
        Self {
            opcode,
            checksum: 0,
            payload: Vec::new(),
        }
    }

    /// Set the checksum field
    pub fn checksum(mut self, checksum: u32) -> Self {
        self.checksum = checksum;
        self
    }

    /// Add a single byte
    pub fn byte(mut self, b: u8) -> Self {
        self.payload.push(b);
        self
    }

    /// Add a 16-bit value (little-endian)
    pub fn u16_le(mut self, value: u16) -> Self {
        let mut bytes = [0u8; 2];
        LittleEndian::write_u16(&mut bytes, value);
        self.payload.extend_from_slice(&bytes);
        self
    }

    /// Add a 32-bit value (little-endian)
    pub fn u32_le(mut self, value: u32) -> Self {
        let mut bytes = [0u8; 4];
        LittleEndian::write_u32(&mut bytes, value);
        self.payload.extend_from_slice(&bytes);
        self
    }

    /// Add raw bytes
    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.payload.extend_from_slice(data);
        self
    }

    /// Build the packet
    pub fn build(self) -> CommandPacket {
        CommandPacket::new(self.opcode, self.payload, self.checksum)
    }
}
