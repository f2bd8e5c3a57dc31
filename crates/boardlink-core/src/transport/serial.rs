//! Serial port handling
//!
//! Port discovery and the [`SerialLink`] implementation for native ports.

use serialport::{SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::debug;

use super::{SerialLink, Signals};
use crate::protocol::ProtocolError;

/// Silicon Labs, the USB-UART bridge on most ESP development boards
pub const DEFAULT_VENDOR_ID: u16 = 0x10C4;

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

impl PortInfo {
    fn bare(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => Self {
                name: info.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                manufacturer: usb.manufacturer,
                product: usb.product,
                serial_number: usb.serial_number,
            },
            _ => Self::bare(info.port_name),
        }
    }
}

/// Sort key putting ttyACM* first, then ttyUSB*, each numerically, then the
/// rest by name
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        return (0, rest.parse().unwrap_or(usize::MAX), basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        return (1, rest.parse().unwrap_or(usize::MAX), basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List available serial ports in a deterministic order
///
/// On Linux, /dev/ttyACM* and /dev/ttyUSB* nodes missed by enumeration are
/// included without USB details.
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let port = PortInfo::from(info);
        map.entry(port.name.clone()).or_insert(port);
    }

    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone())
                        .or_insert_with(|| PortInfo::bare(full));
                }
            }
        }
    }

    let mut ports: Vec<PortInfo> = map.into_values().collect();
    ports.sort_by_key(|p| port_sort_key(&p.name));
    ports
}

/// First port whose USB vendor matches
pub fn find_port_by_vid(vid: u16) -> Option<PortInfo> {
    select_by_vid(list_ports(), vid)
}

fn select_by_vid(ports: Vec<PortInfo>, vid: u16) -> Option<PortInfo> {
    ports.into_iter().find(|p| p.vid == Some(vid))
}

/// Open a native port for async use
pub(crate) fn open_port(name: &str, baud_rate: u32) -> Result<SerialStream, ProtocolError> {
    debug!("Opening {} at {} baud", name, baud_rate);
    let stream = tokio_serial::new(name, baud_rate).open_native_async()?;
    Ok(stream)
}

impl SerialLink for SerialStream {
    fn set_signals(&mut self, signals: Signals) -> Result<(), ProtocolError> {
        if let Some(level) = signals.dtr {
            self.write_data_terminal_ready(level)?;
        }
        if let Some(level) = signals.rts {
            self.write_request_to_send(level)?;
        }
        match signals.brk {
            Some(true) => self.set_break()?,
            Some(false) => self.clear_break()?,
            None => {}
        }
        Ok(())
    }
}
