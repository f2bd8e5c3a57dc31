//! Serial transport
//!
//! [`SerialLink`] is the capability every physical or fake connection
//! provides: an async byte stream plus DTR/RTS/break control.
//!
//! [`Device`] decorates one link per connection. A pump task reads raw chunks
//! and fans them out to every subscriber, writers are serialized behind a
//! single async lock, and open/close notifications are published on a
//! per-device channel.

pub mod serial;

use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::Poll;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::{ProtocolError, DEFAULT_BAUD_RATE};

pub use serial::{find_port_by_vid, list_ports, PortInfo, DEFAULT_VENDOR_ID};

/// Size of a single pump read
const READ_CHUNK: usize = 1024;

/// Buffered chunks per subscriber before it starts lagging
const FANOUT_CAPACITY: usize = 1024;

/// Modem control lines. `None` leaves a line unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Signals {
    pub dtr: Option<bool>,
    pub rts: Option<bool>,
    pub brk: Option<bool>,
}

impl Signals {
    pub fn with_dtr(mut self, level: bool) -> Self {
        self.dtr = Some(level);
        self
    }

    pub fn with_rts(mut self, level: bool) -> Self {
        self.rts = Some(level);
        self
    }

    pub fn with_break(mut self, level: bool) -> Self {
        self.brk = Some(level);
        self
    }
}

/// A bidirectional byte link with modem control
pub trait SerialLink: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Apply the given control line levels
    fn set_signals(&mut self, signals: Signals) -> Result<(), ProtocolError>;
}

/// Connection notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Opened,
    Closed,
}

/// One link shared by the pump and writers.
///
/// The lock is only held inside a single poll, never across an await.
struct SharedLink {
    link: Mutex<Box<dyn SerialLink>>,
}

impl SharedLink {
    fn with<R>(
        &self,
        f: impl FnOnce(Pin<&mut dyn SerialLink>) -> Poll<io::Result<R>>,
    ) -> Poll<io::Result<R>> {
        match self.link.lock() {
            Ok(mut guard) => f(Pin::new(guard.as_mut())),
            Err(_) => Poll::Ready(Err(io::Error::other("serial link lock poisoned"))),
        }
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        poll_fn(|cx| {
            self.with(|link| {
                let mut read_buf = ReadBuf::new(&mut *buf);
                match link.poll_read(cx, &mut read_buf) {
                    Poll::Ready(Ok(())) => Poll::Ready(Ok(read_buf.filled().len())),
                    Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                    Poll::Pending => Poll::Pending,
                }
            })
        })
        .await
    }

    async fn write_all(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let n = poll_fn(|cx| self.with(|link| link.poll_write(cx, data))).await?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            data = &data[n..];
        }
        poll_fn(|cx| self.with(|link| link.poll_flush(cx))).await
    }

    fn set_signals(&self, signals: Signals) -> Result<(), ProtocolError> {
        let mut guard = self
            .link
            .lock()
            .map_err(|_| ProtocolError::Transport("serial link lock poisoned".to_string()))?;
        guard.set_signals(signals)
    }
}

struct Attached {
    link: Arc<SharedLink>,
    pump: JoinHandle<()>,
    generation: u64,
}

struct DeviceInner {
    port_name: Mutex<Option<String>>,
    baud_rate: AtomicU32,
    attached: Mutex<Option<Attached>>,
    generation: AtomicU64,
    write_lock: tokio::sync::Mutex<()>,
    data_tx: broadcast::Sender<Bytes>,
    events_tx: broadcast::Sender<DeviceEvent>,
}

impl DeviceInner {
    fn current_link(&self) -> Result<Arc<SharedLink>, ProtocolError> {
        let attached = self
            .attached
            .lock()
            .map_err(|_| ProtocolError::IllegalState("device state lock poisoned".to_string()))?;
        attached
            .as_ref()
            .map(|a| a.link.clone())
            .ok_or(ProtocolError::NotConnected)
    }

    /// Called by a pump whose stream ended on its own
    fn pump_finished(&self, generation: u64) {
        let detached = match self.attached.lock() {
            Ok(mut attached) => match attached.as_ref() {
                Some(a) if a.generation == generation => attached.take().is_some(),
                _ => false,
            },
            Err(_) => false,
        };
        if detached {
            info!("Device stream ended");
            let _ = self.events_tx.send(DeviceEvent::Closed);
        }
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        if let Ok(mut attached) = self.attached.lock() {
            if let Some(a) = attached.take() {
                a.pump.abort();
            }
        }
    }
}

/// A connection with multi-reader fan-out
///
/// Cloning is cheap; all clones share the same link.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Default for Device {
    fn default() -> Self {
        Self::new()
    }
}

impl Device {
    /// Create a device with nothing attached
    pub fn new() -> Self {
        let (data_tx, _) = broadcast::channel(FANOUT_CAPACITY);
        let (events_tx, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(DeviceInner {
                port_name: Mutex::new(None),
                baud_rate: AtomicU32::new(DEFAULT_BAUD_RATE),
                attached: Mutex::new(None),
                generation: AtomicU64::new(0),
                write_lock: tokio::sync::Mutex::new(()),
                data_tx,
                events_tx,
            }),
        }
    }

    /// Open a serial port and attach it
    pub async fn open(&self, port_name: &str, baud_rate: u32) -> Result<(), ProtocolError> {
        let stream = serial::open_port(port_name, baud_rate)?;
        if let Ok(mut name) = self.inner.port_name.lock() {
            *name = Some(port_name.to_string());
        }
        self.inner.baud_rate.store(baud_rate, Ordering::SeqCst);
        self.attach(stream).await;
        Ok(())
    }

    /// Close and reopen the last opened port at a new baud rate
    pub async fn reopen(&self, baud_rate: u32) -> Result<(), ProtocolError> {
        let name = self
            .port_name()
            .ok_or_else(|| ProtocolError::Config("no port has been opened yet".to_string()))?;
        self.close().await?;
        self.open(&name, baud_rate).await
    }

    /// Attach an already open link, replacing any current one
    pub async fn attach(&self, link: impl SerialLink) {
        self.close().await.ok();

        let shared = Arc::new(SharedLink {
            link: Mutex::new(Box::new(link)),
        });
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let pump = tokio::spawn(pump(
            shared.clone(),
            self.inner.data_tx.clone(),
            Arc::downgrade(&self.inner),
            generation,
        ));

        if let Ok(mut attached) = self.inner.attached.lock() {
            *attached = Some(Attached {
                link: shared,
                pump,
                generation,
            });
        }
        debug!("Device attached (generation {})", generation);
        let _ = self.inner.events_tx.send(DeviceEvent::Opened);
    }

    /// Detach the current link. Closing a closed device is a no-op.
    pub async fn close(&self) -> Result<(), ProtocolError> {
        let previous = self
            .inner
            .attached
            .lock()
            .map_err(|_| ProtocolError::IllegalState("device state lock poisoned".to_string()))?
            .take();
        if let Some(a) = previous {
            a.pump.abort();
            // Wait for any writer still holding the link
            let _guard = self.inner.write_lock.lock().await;
            debug!("Device closed (generation {})", a.generation);
            let _ = self.inner.events_tx.send(DeviceEvent::Closed);
        }
        Ok(())
    }

    /// New subscription to the raw byte stream
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.inner.data_tx.subscribe()
    }

    /// New subscription to open/close notifications
    pub fn events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Write all bytes. Only one writer holds the link at a time.
    pub async fn write(&self, data: &[u8]) -> Result<(), ProtocolError> {
        let link = self.inner.current_link()?;
        let _guard = self.inner.write_lock.lock().await;
        link.write_all(data).await.map_err(|e| {
            warn!("Write of {} bytes failed: {}", data.len(), e);
            ProtocolError::from(e)
        })
    }

    pub fn set_signals(&self, signals: Signals) -> Result<(), ProtocolError> {
        debug!("Setting signals {:?}", signals);
        self.inner.current_link()?.set_signals(signals)
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .attached
            .lock()
            .map(|a| a.is_some())
            .unwrap_or(false)
    }

    pub fn port_name(&self) -> Option<String> {
        self.inner.port_name.lock().ok().and_then(|n| n.clone())
    }

    pub fn baud_rate(&self) -> u32 {
        self.inner.baud_rate.load(Ordering::SeqCst)
    }
}

async fn pump(
    link: Arc<SharedLink>,
    data_tx: broadcast::Sender<Bytes>,
    device: Weak<DeviceInner>,
    generation: u64,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match link.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                // No subscribers is fine, the data is simply not wanted
                let _ = data_tx.send(Bytes::copy_from_slice(&buf[..n]));
            }
            Err(e) => {
                warn!("Serial read failed: {}", e);
                break;
            }
        }
    }
    if let Some(inner) = device.upgrade() {
        inner.pump_finished(generation);
    }
}
