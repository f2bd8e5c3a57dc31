//! Bootloader commands
//!
//! Opcodes understood by the ROM bootloader and the RAM flasher stub.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Bootloader opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BootloaderCommand {
    // Supported by the ESP8266 ROM bootloader
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    MemBegin = 0x05,
    MemEnd = 0x06,
    MemData = 0x07,
    Sync = 0x08,
    WriteReg = 0x09,
    ReadReg = 0x0A,

    // Supported by the ESP32 ROM bootloader (or ESP8266 with stub)
    SpiSetParams = 0x0B,
    SpiAttach = 0x0D,
    /// ROM only, much slower than the stub flash read
    ReadFlashSlow = 0x0E,
    ChangeBaudrate = 0x0F,
    FlashDeflBegin = 0x10,
    FlashDeflData = 0x11,
    FlashDeflEnd = 0x12,
    SpiFlashMd5 = 0x13,

    /// ESP32-S2/S3/C3/C6 ROM bootloader only
    GetSecurityInfo = 0x14,

    // Stub only
    EraseFlash = 0xD0,
    EraseRegion = 0xD1,
    ReadFlash = 0xD2,
    RunUserCode = 0xD3,

    /// Flash encryption encrypted data command
    FlashEncryptData = 0xD4,
}

impl BootloaderCommand {
    /// Wire opcode
    pub fn opcode(&self) -> u8 {
        *self as u8
    }

    /// Look up a command from its wire opcode
    pub fn from_opcode(opcode: u8) -> Option<Self> {
        use BootloaderCommand::*;
        let cmd = match opcode {
            0x02 => FlashBegin,
            0x03 => FlashData,
            0x04 => FlashEnd,
            0x05 => MemBegin,
            0x06 => MemEnd,
            0x07 => MemData,
            0x08 => Sync,
            0x09 => WriteReg,
            0x0A => ReadReg,
            0x0B => SpiSetParams,
            0x0D => SpiAttach,
            0x0E => ReadFlashSlow,
            0x0F => ChangeBaudrate,
            0x10 => FlashDeflBegin,
            0x11 => FlashDeflData,
            0x12 => FlashDeflEnd,
            0x13 => SpiFlashMd5,
            0x14 => GetSecurityInfo,
            0xD0 => EraseFlash,
            0xD1 => EraseRegion,
            0xD2 => ReadFlash,
            0xD3 => RunUserCode,
            0xD4 => FlashEncryptData,
            _ => return None,
        };
        Some(cmd)
    }

    /// Check if only the flasher stub answers this command
    pub fn stub_only(&self) -> bool {
        self.opcode() >= 0xD0
    }

    /// Check if this command expects a response
    pub fn expects_response(&self) -> bool {
        !matches!(self, BootloaderCommand::RunUserCode)
    }

    /// Get the expected response timeout
    pub fn timeout(&self) -> Duration {
        match self {
            BootloaderCommand::Sync => Duration::from_millis(100),
            BootloaderCommand::EraseFlash => Duration::from_secs(120),
            BootloaderCommand::EraseRegion | BootloaderCommand::SpiFlashMd5 => {
                Duration::from_secs(30)
            }
            _ => Duration::from_millis(super::DEFAULT_TIMEOUT_MS),
        }
    }
}

impl fmt::Display for BootloaderCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({:#04x})", self, self.opcode())
    }
}
