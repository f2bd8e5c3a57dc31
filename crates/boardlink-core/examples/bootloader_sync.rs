//! Bootloader Sync Tool
//!
//! Resets an ESP board into its ROM bootloader, syncs, and reads a register.
//!
//! Usage:
//!   cargo run --example bootloader_sync -- [OPTIONS]
//!
//! Options:
//!   --port PORT       Serial port (default: first Silicon Labs port)
//!   --baud RATE       Baud rate (default: 115200)
//!   --config FILE     JSON configuration file
//!   --no-reset        Sync without resetting into download mode
//!   --reg ADDR        Register to read after sync, hex (default: 0x40001000)

use anyhow::{anyhow, Context, Result};
use boardlink_core::prelude::*;
use boardlink_core::transport::find_port_by_vid;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();
    let mut mode = ConnectionMode::DefaultReset;
    let mut register = 0x4000_1000u32;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                i += 1;
                if i < args.len() {
                    config.port.name = args[i].clone();
                }
            }
            "--baud" | "-b" => {
                i += 1;
                if i < args.len() {
                    config.port.baud_rate = args[i].parse().unwrap_or(115200);
                }
            }
            "--config" | "-c" => {
                i += 1;
                if i < args.len() {
                    let port = config.port.clone();
                    config = Config::from_file(&args[i])?;
                    if !port.name.is_empty() {
                        config.port = port;
                    }
                }
            }
            "--no-reset" => mode = ConnectionMode::NoReset,
            "--reg" => {
                i += 1;
                if i < args.len() {
                    let hex = args[i].trim_start_matches("0x");
                    register = u32::from_str_radix(hex, 16)
                        .with_context(|| format!("bad register address {}", args[i]))?;
                }
            }
            other => return Err(anyhow!("unknown argument {}", other)),
        }
        i += 1;
    }

    if config.port.name.is_empty() {
        let port = find_port_by_vid(config.port.vendor_id)
            .ok_or_else(|| anyhow!("no port with vendor id {:#06x}", config.port.vendor_id))?;
        config.port.name = port.name;
    }

    let device = Device::new();
    device.open(&config.port.name, config.port.baud_rate).await?;
    info!("Opened {} at {} baud", config.port.name, config.port.baud_rate);

    let link = DeviceLink::new(device, config.link.clone());
    match link.connect(mode).await? {
        Some(outcome) => info!(
            "Sync: {} responses, stub detected: {}",
            outcome.responses, outcome.stub_detected
        ),
        None => info!("Sync skipped"),
    }

    let value = link.read_reg(register).await?;
    info!("Register {:#010x} = {:#010x}", register, value);

    link.exit_download_mode().await?;
    Ok(())
}
