//! REPL session
//!
//! A [`ReplSession`] drives the interpreter on one [`Device`]. Commands are
//! queued with [`ReplSession::schedule_execution`] and run one at a time, in
//! submission order, through the raw REPL.
//!
//! The session follows the device's open/close notifications. On close the
//! read loop and the command consumer stop; on open a fresh pipeline and
//! read loop are installed and the consumer restarts after a settle delay.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::control::{
    BusyState, PromptTracker, ReplState, ENTER_PASTE, EOF, EXIT_PASTE, FRIENDLY_PROMPT,
    FRIENDLY_REPL, INTERRUPT, RAW_BANNER, RAW_EXECUTE_OK, RAW_REPL, SOFT_RESET,
};
use super::scan::{self, text_reader, text_reader_after, ScanResult};
use crate::pipeline::{Pipeline, PipelineReader, ProtocolType};
use crate::protocol::ProtocolError;
use crate::transport::{Device, DeviceEvent};

/// REPL session settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplConfig {
    /// Wait after a (re)connect before commands are serviced
    pub settle_delay_ms: u64,
    /// How long to wait for the raw REPL banner
    pub banner_timeout_ms: u64,
    /// How long a friendly interrupt waits for the prompt
    pub interrupt_timeout_ms: u64,
    /// Default timeout of a scheduled command
    pub exec_timeout_ms: u64,
    /// Default timeout of a direct raw write
    pub raw_timeout_ms: u64,
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 2000,
            banner_timeout_ms: 2000,
            interrupt_timeout_ms: 1000,
            exec_timeout_ms: 5000,
            raw_timeout_ms: 10000,
        }
    }
}

impl ReplConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn banner_timeout(&self) -> Duration {
        Duration::from_millis(self.banner_timeout_ms)
    }

    pub fn interrupt_timeout(&self) -> Duration {
        Duration::from_millis(self.interrupt_timeout_ms)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_millis(self.exec_timeout_ms)
    }

    pub fn raw_timeout(&self) -> Duration {
        Duration::from_millis(self.raw_timeout_ms)
    }
}

/// One queued unit of REPL work
struct CommandExecutor {
    lines: Vec<String>,
    timeout: Duration,
    dequeued: oneshot::Sender<()>,
    result: oneshot::Sender<Result<String, ProtocolError>>,
}

/// Completion signals of a scheduled command
///
/// `dequeued` fires when the consumer picks the command up, always before
/// `result`.
pub struct ScheduledCommand {
    pub dequeued: oneshot::Receiver<()>,
    pub result: oneshot::Receiver<Result<String, ProtocolError>>,
}

impl ScheduledCommand {
    /// Wait for the command's output
    pub async fn output(self) -> Result<String, ProtocolError> {
        self.result.await.map_err(|_| {
            ProtocolError::Transport("command abandoned before completion".to_string())
        })?
    }
}

#[derive(Default)]
struct SessionTasks {
    events: Option<JoinHandle<()>>,
    settle: Option<JoinHandle<()>>,
    read_loop: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
}

impl SessionTasks {
    fn stop_running(&mut self) {
        for task in [
            self.settle.take(),
            self.read_loop.take(),
            self.consumer.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

/// Aborts every session task once the last handle is dropped
struct TaskGuard(Arc<Mutex<SessionTasks>>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.0.lock() {
            tasks.stop_running();
            if let Some(events) = tasks.events.take() {
                events.abort();
            }
        }
    }
}

struct SessionInner {
    device: Device,
    config: ReplConfig,
    status: Mutex<(ReplState, BusyState)>,
    queue_tx: mpsc::UnboundedSender<CommandExecutor>,
    queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<CommandExecutor>>,
    queue_running: AtomicBool,
    read_loop_running: watch::Sender<bool>,
    tasks: Arc<Mutex<SessionTasks>>,
}

/// Interactive interpreter session on one device
#[derive(Clone)]
pub struct ReplSession {
    inner: Arc<SessionInner>,
    _guard: Arc<TaskGuard>,
}

impl ReplSession {
    /// Create a session following `device`'s connection events.
    ///
    /// Must be called inside a tokio runtime. If the device is already open
    /// the session starts after the settle delay.
    pub fn new(device: Device, config: ReplConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (read_loop_running, _) = watch::channel(false);
        let tasks = Arc::new(Mutex::new(SessionTasks::default()));
        let events = device.events();
        let already_open = device.is_connected();

        let inner = Arc::new(SessionInner {
            device,
            config,
            status: Mutex::new((ReplState::Unknown, BusyState::Unknown)),
            queue_tx,
            queue_rx: tokio::sync::Mutex::new(queue_rx),
            queue_running: AtomicBool::new(false),
            read_loop_running,
            tasks: tasks.clone(),
        });

        let listener = tokio::spawn(follow_device(inner.clone(), events));
        if let Ok(mut t) = tasks.lock() {
            t.events = Some(listener);
        }
        if already_open {
            inner.on_open();
        }

        Self {
            inner,
            _guard: Arc::new(TaskGuard(tasks)),
        }
    }

    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    pub fn config(&self) -> &ReplConfig {
        &self.inner.config
    }

    pub fn connected(&self) -> bool {
        self.inner.device.is_connected()
    }

    /// Last observed interpreter mode
    pub fn state(&self) -> ReplState {
        self.inner.status().0
    }

    pub fn busy(&self) -> BusyState {
        self.inner.status().1
    }

    /// True while the read loop is installed
    pub fn is_running(&self) -> bool {
        *self.inner.read_loop_running.borrow()
    }

    /// Wait until the read loop is installed
    pub async fn wait_until_running(&self) -> Result<(), ProtocolError> {
        self.inner.wait_until_running().await
    }

    /// Queue a command for raw execution
    ///
    /// Waits for the read loop, then returns without waiting for the command
    /// to run.
    pub async fn schedule_execution<S: Into<String>>(
        &self,
        timeout: Duration,
        lines: impl IntoIterator<Item = S>,
    ) -> Result<ScheduledCommand, ProtocolError> {
        self.inner.wait_until_running().await?;

        let (dequeued_tx, dequeued) = oneshot::channel();
        let (result_tx, result) = oneshot::channel();
        let executor = CommandExecutor {
            lines: lines.into_iter().map(Into::into).collect(),
            timeout,
            dequeued: dequeued_tx,
            result: result_tx,
        };
        self.inner
            .queue_tx
            .send(executor)
            .map_err(|_| ProtocolError::IllegalState("execution queue closed".to_string()))?;
        Ok(ScheduledCommand { dequeued, result })
    }

    /// Queue a command with the configured default timeout
    pub async fn exec<S: Into<String>>(
        &self,
        lines: impl IntoIterator<Item = S>,
    ) -> Result<String, ProtocolError> {
        let timeout = self.inner.config.exec_timeout();
        self.schedule_execution(timeout, lines).await?.output().await
    }

    /// Service the execution queue in the calling task until stopped.
    ///
    /// Fails with [`ProtocolError::IllegalState`] if a consumer is already
    /// running.
    pub async fn run_command_queue(&self) -> Result<(), ProtocolError> {
        self.inner.run_command_queue().await
    }

    /// Run `lines` in the raw REPL and return their output
    pub async fn write_raw<S: AsRef<str>>(
        &self,
        timeout: Duration,
        lines: &[S],
    ) -> Result<String, ProtocolError> {
        self.inner.write_raw(timeout, lines).await
    }

    /// Send Ctrl-C twice; with `friendly`, wait for the prompt
    pub async fn interrupt(&self, friendly: bool) -> Result<Option<ScanResult>, ProtocolError> {
        self.inner.interrupt(friendly).await
    }

    /// Interrupt, then switch to the raw REPL
    pub async fn enter_raw_repl(&self) -> Result<(), ProtocolError> {
        self.inner.write(&[INTERRUPT, RAW_REPL]).await
    }

    pub async fn exit_raw_repl(&self) -> Result<(), ProtocolError> {
        self.inner.write(&[FRIENDLY_REPL]).await
    }

    /// Interrupt, then switch to paste mode
    pub async fn enter_paste(&self) -> Result<(), ProtocolError> {
        self.inner.write(&[INTERRUPT, ENTER_PASTE]).await
    }

    pub async fn exit_paste(&self) -> Result<(), ProtocolError> {
        self.inner.write(&[EXIT_PASTE]).await
    }

    pub async fn soft_reset(&self) -> Result<(), ProtocolError> {
        self.inner.write(&[SOFT_RESET]).await
    }

    /// Write text as-is
    pub async fn write<S: AsRef<str>>(&self, parts: &[S]) -> Result<(), ProtocolError> {
        self.inner.write(parts).await
    }

    /// Scan incoming text until it ends with `end`
    pub async fn read_until(&self, end: &str, timeout: Duration) -> Result<ScanResult, ProtocolError> {
        let mut reader = text_reader(&self.inner.device);
        scan::read_until(&mut reader, end, timeout).await
    }

    /// Scan incoming text until `pattern` matches
    pub async fn read_until_match(
        &self,
        pattern: &Regex,
        timeout: Duration,
    ) -> Result<ScanResult, ProtocolError> {
        let mut reader = text_reader(&self.inner.device);
        scan::read_until_match(&mut reader, pattern, timeout).await
    }

    /// Skip incoming text up to `from`, then scan until it ends with `end`
    pub async fn read_from_until(
        &self,
        from: &str,
        end: &str,
        timeout: Duration,
    ) -> Result<ScanResult, ProtocolError> {
        let mut reader = text_reader_after(&self.inner.device, from);
        scan::read_until(&mut reader, end, timeout).await
    }
}

impl SessionInner {
    fn status(&self) -> (ReplState, BusyState) {
        self.status
            .lock()
            .map(|s| *s)
            .unwrap_or((ReplState::Unknown, BusyState::Unknown))
    }

    fn set_status(&self, state: ReplState, busy: BusyState) {
        if let Ok(mut status) = self.status.lock() {
            if *status != (state, busy) {
                debug!("REPL now {:?}/{:?}", state, busy);
            }
            *status = (state, busy);
        }
    }

    fn set_busy(&self, busy: BusyState) {
        if let Ok(mut status) = self.status.lock() {
            status.1 = busy;
        }
    }

    async fn wait_until_running(&self) -> Result<(), ProtocolError> {
        let mut running = self.read_loop_running.subscribe();
        running
            .wait_for(|r| *r)
            .await
            .map(|_| ())
            .map_err(|_| ProtocolError::IllegalState("session shut down".to_string()))
    }

    /// Stop the read loop and consumer
    fn stop(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.stop_running();
        }
        self.read_loop_running.send_replace(false);
        self.queue_running.store(false, Ordering::SeqCst);
    }

    fn on_close(&self) {
        info!("Stopping read loop, serial device closed");
        self.stop();
        self.set_status(ReplState::Unknown, BusyState::Unknown);
    }

    fn on_open(self: &Arc<Self>) {
        info!("Serial device opened, starting session after {:?}", self.config.settle_delay());
        let inner = self.clone();
        let settle = tokio::spawn(async move {
            tokio::time::sleep(inner.config.settle_delay()).await;
            inner.start();
        });
        self.stop();
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.settle = Some(settle);
        }
    }

    /// Install a fresh read loop and start the consumer
    fn start(self: &Arc<Self>) {
        let pipeline = Pipeline::builder()
            .convert(ProtocolType::Binary, ProtocolType::Text, false)
            .logging("repl rx")
            .build();
        let reader = PipelineReader::new(self.device.subscribe(), pipeline);
        let read_loop = tokio::spawn(read_loop(self.clone(), reader));

        let inner = self.clone();
        let consumer = tokio::spawn(async move {
            if let Err(e) = inner.run_command_queue().await {
                warn!("Command queue stopped: {}", e);
            }
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.read_loop = Some(read_loop);
            tasks.consumer = Some(consumer);
        }
        self.read_loop_running.send_replace(true);
    }

    async fn run_command_queue(&self) -> Result<(), ProtocolError> {
        if self.queue_running.swap(true, Ordering::SeqCst) {
            return Err(ProtocolError::IllegalState(
                "command queue is already running".to_string(),
            ));
        }
        let mut queue = self.queue_rx.lock().await;
        while self.queue_running.load(Ordering::SeqCst) {
            let Some(executor) = queue.recv().await else {
                break;
            };
            let _ = executor.dequeued.send(());
            let result = self.write_raw(executor.timeout, &executor.lines).await;
            if let Err(e) = &result {
                warn!("Command failed: {}", e);
            }
            // The caller may have stopped listening
            let _ = executor.result.send(result);
        }
        Ok(())
    }

    async fn write<S: AsRef<str>>(&self, parts: &[S]) -> Result<(), ProtocolError> {
        let data: String = parts.iter().map(|p| p.as_ref()).collect();
        self.device.write(data.as_bytes()).await
    }

    async fn interrupt(&self, friendly: bool) -> Result<Option<ScanResult>, ProtocolError> {
        if !friendly {
            self.write(&[INTERRUPT]).await?;
            return Ok(None);
        }
        let mut reader = text_reader(&self.device);
        self.write(&[INTERRUPT]).await?;
        let result =
            scan::read_until(&mut reader, FRIENDLY_PROMPT, self.config.interrupt_timeout()).await?;
        Ok(Some(result))
    }

    async fn prepare_raw_write(&self) -> Result<(), ProtocolError> {
        self.interrupt(false).await?;
        self.write(&[FRIENDLY_REPL]).await?;

        let mut banner = text_reader(&self.device);
        self.write(&[INTERRUPT, RAW_REPL]).await?;
        let result = scan::read_until(&mut banner, RAW_BANNER, self.config.banner_timeout()).await?;
        if !result.matched {
            warn!("Raw REPL banner not seen, got {:?}", result.buffer);
        }
        Ok(())
    }

    async fn write_raw<S: AsRef<str>>(
        &self,
        timeout: Duration,
        lines: &[S],
    ) -> Result<String, ProtocolError> {
        debug!("Preparing REPL for raw write");
        if let Err(e) = self.prepare_raw_write().await {
            warn!("Couldn't prepare REPL for raw write: {}", e);
        }

        // Subscribe before writing so no output is missed
        let mut output = text_reader_after(&self.device, RAW_EXECUTE_OK);
        self.set_busy(BusyState::Busy);
        let mut parts: Vec<&str> = lines.iter().map(|l| l.as_ref()).collect();
        parts.push(EOF);
        let result = match self.write(&parts).await {
            Ok(()) => scan::read_until(&mut output, EOF, timeout)
                .await
                .and_then(ScanResult::into_complete)
                .map(|mut text| {
                    text.pop();
                    text
                }),
            Err(e) => Err(e),
        };

        // Leave the raw REPL even when the command never got through
        let exited = match self.write(&[FRIENDLY_REPL]).await {
            Ok(()) => self.write(&[FRIENDLY_REPL]).await,
            Err(e) => Err(e),
        };
        let text = result?;
        exited?;
        debug!("Raw write returned {} chars", text.len());
        Ok(text)
    }
}

async fn follow_device(inner: Arc<SessionInner>, mut events: broadcast::Receiver<DeviceEvent>) {
    loop {
        match events.recv().await {
            Ok(DeviceEvent::Opened) => inner.on_open(),
            Ok(DeviceEvent::Closed) => inner.on_close(),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Missed {} device events", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn read_loop(inner: Arc<SessionInner>, mut reader: PipelineReader) {
    let mut tracker = PromptTracker::default();
    loop {
        match reader.next().await {
            Ok(Some(chunk)) => {
                if let Some((state, busy)) = tracker.observe(&chunk.as_text()) {
                    inner.set_status(state, busy);
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("REPL read loop failed: {}", e);
                break;
            }
        }
    }
    debug!("REPL read loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repl_config_defaults() {
        let config = ReplConfig::default();
        assert_eq!(config.settle_delay(), Duration::from_secs(2));
        assert_eq!(config.banner_timeout(), Duration::from_secs(2));
        assert_eq!(config.interrupt_timeout(), Duration::from_secs(1));
        assert_eq!(config.exec_timeout(), Duration::from_secs(5));
        assert_eq!(config.raw_timeout(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_schedule_waits_for_read_loop() {
        let session = ReplSession::new(Device::new(), ReplConfig::default());
        assert!(!session.is_running());
        let scheduled = tokio::time::timeout(
            Duration::from_millis(50),
            session.schedule_execution(Duration::from_secs(1), ["print(1)"]),
        )
        .await;
        assert!(scheduled.is_err());
    }
}
