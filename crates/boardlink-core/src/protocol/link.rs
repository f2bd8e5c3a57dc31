//! Bootloader link
//!
//! [`DeviceLink`] issues bootloader commands over a [`Device`] and reads their
//! SLIP-framed responses.
//!
//! At most one frame read is in flight at a time. A caller whose timeout
//! expires stops waiting but the read keeps running; whatever it eventually
//! produces is kept as an orphan and handed to the next caller.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::packet::{
    build_command, parse_response, sync_payload, PacketBuilder, ResponsePacket, HEADER_LEN,
    STATUS_BYTES_LENGTH,
};
use super::slip::{FramingPolicy, SlipDecoder};
use super::{BootloaderCommand, ProtocolError, DEFAULT_TIMEOUT_MS};
use crate::pipeline::{Pipeline, PipelineReader};
use crate::transport::{Device, Signals};

/// Bootloader link settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Response timeout for ordinary commands
    pub default_timeout_ms: u64,
    /// Timeout of a bare `read_one`
    pub read_timeout_ms: u64,
    /// Timeout of each sync probe
    pub sync_timeout_ms: u64,
    /// Follow-up probes after the initial sync command
    pub sync_probes: u32,
    pub framing_policy: FramingPolicy,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            read_timeout_ms: 500,
            sync_timeout_ms: 100,
            sync_probes: 7,
            framing_policy: FramingPolicy::Reject,
        }
    }
}

impl LinkConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }
}

/// How [`DeviceLink::connect`] brings the chip into the bootloader
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// Reset into download mode, then sync
    #[default]
    DefaultReset,
    /// Sync without resetting
    NoReset,
    /// Neither reset nor sync
    NoResetNoSync,
}

/// Result of a sync handshake
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Value of the last successful probe was zero
    pub stub_detected: bool,
    /// Probes that produced a response
    pub responses: usize,
}

impl SyncOutcome {
    fn record(&mut self, response: &ResponsePacket) {
        self.responses += 1;
        self.stub_detected = response.value == 0;
    }
}

/// What a successful [`DeviceLink::check_command`] returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckResult {
    /// Response data without the status bytes
    Data(Vec<u8>),
    /// The response's value word
    Value(u32),
}

type ReadResult = Result<Vec<u8>, ProtocolError>;

struct PendingRead {
    id: u64,
    rx: watch::Receiver<Option<ReadResult>>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct ReadState {
    pending: Option<PendingRead>,
    orphan: Option<(u64, ReadResult)>,
    next_id: u64,
}

/// Bootloader command channel over one device
pub struct DeviceLink {
    device: Device,
    config: LinkConfig,
    baud_rate: AtomicU32,
    sync_stub_detected: AtomicBool,
    frames: Arc<tokio::sync::Mutex<PipelineReader>>,
    reads: Arc<Mutex<ReadState>>,
}

impl DeviceLink {
    /// Create a link and start collecting frames from `device`
    pub fn new(device: Device, config: LinkConfig) -> Self {
        let frames = frame_reader(&device, config.framing_policy);
        Self {
            baud_rate: AtomicU32::new(device.baud_rate()),
            device,
            config,
            sync_stub_detected: AtomicBool::new(false),
            frames: Arc::new(tokio::sync::Mutex::new(frames)),
            reads: Arc::new(Mutex::new(ReadState::default())),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate.load(Ordering::SeqCst)
    }

    /// Stub flag recorded by the last [`sync`](Self::sync)
    pub fn sync_stub_detected(&self) -> bool {
        self.sync_stub_detected.load(Ordering::SeqCst)
    }

    fn read_state(&self) -> Result<MutexGuard<'_, ReadState>, ProtocolError> {
        self.reads
            .lock()
            .map_err(|_| ProtocolError::IllegalState("read state lock poisoned".to_string()))
    }

    /// Reopen the port at `baud_rate` and start a fresh frame reader
    pub async fn open(&self, baud_rate: u32) -> Result<(), ProtocolError> {
        {
            let mut reads = self.read_state()?;
            if let Some(pending) = reads.pending.take() {
                pending.task.abort();
            }
            reads.orphan = None;
        }
        self.device.reopen(baud_rate).await?;
        *self.frames.lock().await = frame_reader(&self.device, self.config.framing_policy);
        self.baud_rate.store(baud_rate, Ordering::SeqCst);
        info!("Bootloader link open at {} baud", baud_rate);
        Ok(())
    }

    /// Bring the chip into the bootloader according to `mode`
    ///
    /// Returns the sync outcome unless `mode` skips syncing.
    pub async fn connect(&self, mode: ConnectionMode) -> Result<Option<SyncOutcome>, ProtocolError> {
        match mode {
            ConnectionMode::DefaultReset => {
                self.enter_download_mode().await?;
                self.sync().await.map(Some)
            }
            ConnectionMode::NoReset => {
                warn!(
                    "Pre-connection option {:?} was selected. Connection may fail if the chip is not in bootloader or flasher stub mode",
                    mode
                );
                self.sync().await.map(Some)
            }
            ConnectionMode::NoResetNoSync => {
                warn!(
                    "Pre-connection option {:?} was selected. Connection may fail if the chip is not in bootloader or flasher stub mode",
                    mode
                );
                Ok(None)
            }
        }
    }

    /// Pulse DTR/RTS to reset the chip into its serial bootloader
    pub async fn enter_download_mode(&self) -> Result<(), ProtocolError> {
        debug!("Resetting into download mode");
        self.device
            .set_signals(Signals::default().with_dtr(false).with_rts(true))?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.device
            .set_signals(Signals::default().with_dtr(true).with_rts(false))?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.device.set_signals(Signals::default().with_dtr(false))
    }

    /// Pulse RTS to reset the chip into its application
    pub async fn exit_download_mode(&self) -> Result<(), ProtocolError> {
        debug!("Resetting out of download mode");
        self.device.set_signals(Signals::default().with_rts(true))?;
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.device.set_signals(Signals::default().with_rts(false))
    }

    /// Read one decoded frame
    ///
    /// Joins the pending read if there is one. With no read pending, an
    /// orphaned result from an earlier timed-out read is returned first.
    pub async fn read_one(&self, timeout: Duration) -> ReadResult {
        let (id, mut rx) = {
            let mut reads = self.read_state()?;
            match reads.pending.as_ref() {
                Some(pending) => (pending.id, pending.rx.clone()),
                None => {
                    if let Some((_, orphan)) = reads.orphan.take() {
                        warn!("Orphaned result found: {:02x?}", orphan);
                        return orphan;
                    }
                    let id = reads.next_id;
                    reads.next_id += 1;
                    let (tx, rx) = watch::channel(None);
                    let task = tokio::spawn(read_frame(
                        self.frames.clone(),
                        self.reads.clone(),
                        id,
                        tx,
                    ));
                    reads.pending = Some(PendingRead {
                        id,
                        rx: rx.clone(),
                        task,
                    });
                    (id, rx)
                }
            }
        };

        let result = match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Err(_) => {
                trace!("Read {} still pending after {:?}", id, timeout);
                return Err(ProtocolError::Timeout);
            }
            Ok(Err(_)) => Err(ProtocolError::Transport("pending read abandoned".to_string())),
            Ok(Ok(value)) => (*value)
                .clone()
                .unwrap_or_else(|| Err(ProtocolError::Transport("empty read result".to_string()))),
        };

        // Delivered to a waiting caller, so it is not an orphan
        let mut reads = self.read_state()?;
        if matches!(reads.orphan, Some((orphan_id, _)) if orphan_id == id) {
            reads.orphan = None;
        }
        result
    }

    async fn exchange(
        &self,
        op: Option<BootloaderCommand>,
        data: &[u8],
        checksum: u32,
        wait_response: bool,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, ProtocolError> {
        if let Some(op) = op {
            let frame = build_command(op, data, checksum)?;
            trace!("TX {} ({} payload bytes)", op, data.len());
            self.device.write(&frame).await?;
        }
        if !wait_response {
            return Ok(None);
        }
        self.read_one(timeout).await.map(Some)
    }

    /// Send a command and optionally wait for its response
    ///
    /// With `op` set to `None` nothing is written and one more response is
    /// read, which is how sync collects repeated echoes. Without
    /// `wait_response` nothing is read, so `None` with no wait does nothing.
    pub async fn command(
        &self,
        op: Option<BootloaderCommand>,
        data: &[u8],
        checksum: u32,
        wait_response: bool,
        timeout: Duration,
    ) -> Result<Option<ResponsePacket>, ProtocolError> {
        match self.exchange(op, data, checksum, wait_response, timeout).await? {
            Some(frame) => parse_response(&frame),
            None => Ok(None),
        }
    }

    /// Send a command with the default timeout for its opcode
    pub async fn execute(
        &self,
        op: BootloaderCommand,
        data: &[u8],
    ) -> Result<Option<ResponsePacket>, ProtocolError> {
        self.command(Some(op), data, 0, op.expects_response(), self.timeout_for(op))
            .await
    }

    /// Send a command and validate the status bytes of its response
    pub async fn check_command(
        &self,
        description: &str,
        op: Option<BootloaderCommand>,
        data: &[u8],
        checksum: u32,
    ) -> Result<CheckResult, ProtocolError> {
        let timeout = op
            .map(|op| self.timeout_for(op))
            .unwrap_or_else(|| self.config.default_timeout());
        let frame = self
            .exchange(op, data, checksum, true, timeout)
            .await?
            .ok_or_else(|| ProtocolError::InvalidResponse(format!("no response to {}", description)))?;

        let Some(response) = parse_response(&frame)? else {
            let status = frame
                .len()
                .checked_sub(STATUS_BYTES_LENGTH)
                .filter(|&start| start >= HEADER_LEN)
                .map(|start| frame[start..].to_vec())
                .unwrap_or_default();
            return Err(ProtocolError::DeviceError {
                command: description.to_string(),
                status,
            });
        };

        match response.status_bytes() {
            Some(status) if status[0] == 0 => {
                if data.len() > STATUS_BYTES_LENGTH {
                    Ok(CheckResult::Data(response.payload().to_vec()))
                } else {
                    Ok(CheckResult::Value(response.value))
                }
            }
            Some(status) => Err(ProtocolError::DeviceError {
                command: description.to_string(),
                status: status.to_vec(),
            }),
            None => Err(ProtocolError::InvalidResponse(format!(
                "response to {} carries no status bytes",
                description
            ))),
        }
    }

    /// Sync with the bootloader
    ///
    /// Sends the sync command, then reads the configured number of further
    /// echoes. Individual probe failures are logged and skipped; only the
    /// final stub flag is meaningful.
    pub async fn sync(&self) -> Result<SyncOutcome, ProtocolError> {
        if !self.device.is_connected() {
            return Err(ProtocolError::NotConnected);
        }
        debug!("Running sync");
        let timeout = self.config.sync_timeout();
        let mut outcome = SyncOutcome::default();

        match self
            .command(Some(BootloaderCommand::Sync), &sync_payload(), 0, true, timeout)
            .await
        {
            Ok(Some(response)) => outcome.record(&response),
            Ok(None) => debug!("Sync answered with failure status"),
            Err(e) => debug!("Sync probe failed: {}", e),
        }

        for probe in 0..self.config.sync_probes {
            match self.command(None, &[], 0, true, timeout).await {
                Ok(Some(response)) => outcome.record(&response),
                Ok(None) => debug!("Sync probe {} answered with failure status", probe),
                Err(e) => debug!("Sync probe {} failed: {}", probe, e),
            }
        }

        self.sync_stub_detected
            .store(outcome.stub_detected, Ordering::SeqCst);
        debug!(
            "Sync done: {} responses, stub detected: {}",
            outcome.responses, outcome.stub_detected
        );
        Ok(outcome)
    }

    /// Read a 32-bit register
    pub async fn read_reg(&self, address: u32) -> Result<u32, ProtocolError> {
        let packet = PacketBuilder::new(BootloaderCommand::ReadReg)
            .u32_le(address)
            .build();
        let response = self
            .execute(packet.opcode, &packet.payload)
            .await?
            .ok_or_else(|| ProtocolError::DeviceError {
                command: format!("read register {:#010x}", address),
                status: Vec::new(),
            })?;
        Ok(response.value)
    }

    /// Write a 32-bit register under `mask`, waiting `delay_us` afterwards
    pub async fn write_reg(
        &self,
        address: u32,
        value: u32,
        mask: u32,
        delay_us: u32,
    ) -> Result<(), ProtocolError> {
        let packet = PacketBuilder::new(BootloaderCommand::WriteReg)
            .u32_le(address)
            .u32_le(value)
            .u32_le(mask)
            .u32_le(delay_us)
            .build();
        self.check_command(
            "write target memory",
            Some(packet.opcode),
            &packet.payload,
            packet.checksum,
        )
        .await?;
        Ok(())
    }

    fn timeout_for(&self, op: BootloaderCommand) -> Duration {
        match op {
            BootloaderCommand::Sync => self.config.sync_timeout(),
            BootloaderCommand::EraseFlash
            | BootloaderCommand::EraseRegion
            | BootloaderCommand::SpiFlashMd5 => op.timeout(),
            _ => self.config.default_timeout(),
        }
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        if let Ok(mut reads) = self.reads.lock() {
            if let Some(pending) = reads.pending.take() {
                pending.task.abort();
            }
        }
    }
}

fn frame_reader(device: &Device, policy: FramingPolicy) -> PipelineReader {
    let pipeline = Pipeline::builder()
        .frames(SlipDecoder::with_policy(policy))
        .logging("bootloader frame")
        .build();
    PipelineReader::new(device.subscribe(), pipeline)
}

async fn read_frame(
    frames: Arc<tokio::sync::Mutex<PipelineReader>>,
    reads: Arc<Mutex<ReadState>>,
    id: u64,
    tx: watch::Sender<Option<ReadResult>>,
) {
    let result = {
        let mut reader = frames.lock().await;
        match reader.next().await {
            Ok(Some(chunk)) => Ok(chunk.into_bytes()),
            Ok(None) => Err(ProtocolError::Transport("device stream closed".to_string())),
            Err(e) => Err(e),
        }
    };
    if let Ok(mut state) = reads.lock() {
        if state.pending.as_ref().map(|p| p.id) == Some(id) {
            state.pending = None;
        }
        state.orphan = Some((id, result.clone()));
    }
    let _ = tx.send(Some(result));
}
