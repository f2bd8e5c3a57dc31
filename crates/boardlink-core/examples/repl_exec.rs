//! REPL Exec Tool
//!
//! Runs each argument as a command in the board's raw REPL and logs the output.
//!
//! Usage:
//!   cargo run --example repl_exec -- [OPTIONS] COMMAND...
//!
//! Options:
//!   --port PORT       Serial port (default: first Silicon Labs port)
//!   --baud RATE       Baud rate (default: 115200)
//!   --timeout MS      Per-command timeout in ms (default: 5000)
//!   --settle MS       Delay after open before commands run (default: 2000)

use anyhow::{anyhow, Result};
use boardlink_core::prelude::*;
use boardlink_core::transport::find_port_by_vid;
use std::time::Duration;
use tracing::{error, info};

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
    let mut commands = Vec::new();

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
            "--timeout" | "-t" => {
                i += 1;
                if i < args.len() {
                    config.repl.exec_timeout_ms = args[i].parse().unwrap_or(5000);
                }
            }
            "--settle" | "-s" => {
                i += 1;
                if i < args.len() {
                    config.repl.settle_delay_ms = args[i].parse().unwrap_or(2000);
                }
            }
            command => commands.push(command.to_string()),
        }
        i += 1;
    }
    if commands.is_empty() {
        return Err(anyhow!("nothing to run"));
    }

    if config.port.name.is_empty() {
        let port = find_port_by_vid(config.port.vendor_id)
            .ok_or_else(|| anyhow!("no port with vendor id {:#06x}", config.port.vendor_id))?;
        config.port.name = port.name;
    }

    let device = Device::new();
    let timeout = Duration::from_millis(config.repl.exec_timeout_ms);
    let session = ReplSession::new(device.clone(), config.repl.clone());
    device.open(&config.port.name, config.port.baud_rate).await?;

    let mut scheduled = Vec::new();
    for command in &commands {
        scheduled.push((command, session.schedule_execution(timeout, [command.as_str()]).await?));
    }
    for (command, pending) in scheduled {
        match pending.output().await {
            Ok(output) => info!("{} => {:?}", command, output),
            Err(e) => error!("{} failed: {}", command, e),
        }
    }

    device.close().await?;
    Ok(())
}
