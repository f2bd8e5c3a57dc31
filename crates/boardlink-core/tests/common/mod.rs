//! Shared fixtures: an in-memory serial link and fake device helpers

#![allow(dead_code)]

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use boardlink_core::protocol::{slip_encode, ProtocolError, ResponsePacket};
use boardlink_core::transport::{Device, SerialLink, Signals};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

/// Mock serial port backed by an in-memory duplex pipe
pub struct MockSerial {
    stream: DuplexStream,
    pub signals: Arc<Mutex<Vec<Signals>>>,
    pub fail_on_send: Arc<AtomicBool>,
    /// Fail any write containing this byte
    pub fail_on_byte: Arc<Mutex<Option<u8>>>,
}

/// The far end of a [`MockSerial`], playing the device
pub struct MockRemote {
    pub stream: DuplexStream,
    pub signals: Arc<Mutex<Vec<Signals>>>,
    pub fail_on_send: Arc<AtomicBool>,
    pub fail_on_byte: Arc<Mutex<Option<u8>>>,
}

impl MockSerial {
    pub fn pair() -> (MockSerial, MockRemote) {
        let (ours, theirs) = tokio::io::duplex(4096);
        let signals = Arc::new(Mutex::new(Vec::new()));
        let fail_on_send = Arc::new(AtomicBool::new(false));
        let fail_on_byte = Arc::new(Mutex::new(None));
        (
            MockSerial {
                stream: ours,
                signals: signals.clone(),
                fail_on_send: fail_on_send.clone(),
                fail_on_byte: fail_on_byte.clone(),
            },
            MockRemote {
                stream: theirs,
                signals,
                fail_on_send,
                fail_on_byte,
            },
        )
    }
}

impl AsyncRead for MockSerial {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockSerial {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let rejected = self
            .fail_on_byte
            .lock()
            .ok()
            .and_then(|b| *b)
            .is_some_and(|b| buf.contains(&b));
        if rejected || self.fail_on_send.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "Serial write failed",
            )));
        }
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

impl SerialLink for MockSerial {
    fn set_signals(&mut self, signals: Signals) -> Result<(), ProtocolError> {
        self.signals
            .lock()
            .map_err(|_| ProtocolError::Transport("poisoned".to_string()))?
            .push(signals);
        Ok(())
    }
}

/// A device with a fresh mock link attached
pub async fn attached_device() -> (Device, MockRemote) {
    let device = Device::new();
    let (link, remote) = MockSerial::pair();
    device.attach(link).await;
    (device, remote)
}

/// A SLIP-framed successful response as the bootloader sends it
pub fn response_frame(opcode: u8, value: u32, data: &[u8]) -> Vec<u8> {
    let packet = ResponsePacket {
        opcode,
        return_length: data.len() as u16,
        value,
        data: data.to_vec(),
    };
    slip_encode(&packet.to_bytes())
}

/// A SLIP-framed response with a failure status byte
pub fn failure_frame(opcode: u8, status: [u8; 2]) -> Vec<u8> {
    let mut raw = vec![0x00, opcode, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00];
    raw.extend_from_slice(&status);
    slip_encode(&raw)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Read one SLIP-framed request written by the host.
///
/// Bytes are pulled one at a time so nothing past the frame is consumed.
pub async fn read_request(stream: &mut DuplexStream) -> Vec<u8> {
    use boardlink_core::protocol::SlipCodec;
    use bytes::BytesMut;
    use tokio::io::AsyncReadExt;
    use tokio_util::codec::Decoder;

    let mut codec = SlipCodec::default();
    let mut buf = BytesMut::new();
    loop {
        let byte = stream.read_u8().await.expect("host closed the link");
        buf.extend_from_slice(&[byte]);
        if let Some(frame) = codec.decode(&mut buf).expect("host sent a malformed frame") {
            return frame;
        }
    }
}

/// How the fake interpreter answers one raw-REPL command
pub enum Reply {
    /// `OK`, the output, then both Ctrl-D terminators
    Output(String),
    /// Same as `Output`, after a pause
    Slow(std::time::Duration, String),
    /// `OK` and partial output, never terminated
    Hang(String),
}

/// Play a MicroPython-like interpreter on `stream`.
///
/// Returns the task and the log of raw commands received, in order.
pub fn spawn_fake_repl<F>(
    mut stream: DuplexStream,
    respond: F,
) -> (tokio::task::JoinHandle<()>, Arc<Mutex<Vec<String>>>)
where
    F: Fn(&str) -> Reply + Send + 'static,
{
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let log = Arc::new(Mutex::new(Vec::new()));
    let commands = log.clone();
    let task = tokio::spawn(async move {
        let mut buf = [0u8; 256];
        let mut raw = false;
        let mut cmd = Vec::new();
        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            for &b in &buf[..n] {
                let reply: Option<Vec<u8>> = match b {
                    0x01 => {
                        raw = true;
                        cmd.clear();
                        Some(b"raw REPL; CTRL-B to exit\r\n>".to_vec())
                    }
                    0x02 => {
                        raw = false;
                        cmd.clear();
                        Some(b"\r\nMicroPython v1.22.0\r\n>>> ".to_vec())
                    }
                    0x03 => {
                        cmd.clear();
                        (!raw).then(|| b"\r\n>>> ".to_vec())
                    }
                    0x04 if raw => {
                        let text = String::from_utf8_lossy(&cmd).into_owned();
                        cmd.clear();
                        commands.lock().unwrap().push(text.clone());
                        let out = match respond(&text) {
                            Reply::Output(out) => format!("OK{}\x04\x04>", out),
                            Reply::Slow(delay, out) => {
                                tokio::time::sleep(delay).await;
                                format!("OK{}\x04\x04>", out)
                            }
                            Reply::Hang(partial) => format!("OK{}", partial),
                        };
                        Some(out.into_bytes())
                    }
                    _ => {
                        if raw {
                            cmd.push(b);
                        }
                        None
                    }
                };
                if let Some(reply) = reply {
                    if stream.write_all(&reply).await.is_err() {
                        return;
                    }
                }
            }
        }
    });
    (task, log)
}
