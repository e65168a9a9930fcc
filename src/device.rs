// src/device.rs - virtual interface handles
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Cloneable, non-blocking path for synthetic frames toward the client.
#[derive(Clone, Debug)]
pub struct PacketWriter {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl PacketWriter {
    /// Returns false once the interface side has gone away.
    pub fn write(&self, frame: Bytes) -> bool {
        self.tx.send(frame).is_ok()
    }
}

/// Engine side of the interface: captured frames in, synthetic frames out.
#[derive(Debug)]
pub struct VirtualInterface {
    inbound: mpsc::Receiver<Bytes>,
    writer: PacketWriter,
}

impl VirtualInterface {
    pub fn writer(&self) -> PacketWriter {
        self.writer.clone()
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }

    pub fn into_parts(self) -> (mpsc::Receiver<Bytes>, PacketWriter) {
        (self.inbound, self.writer)
    }
}

/// Peer side, held by whoever owns the platform interface (or a test).
#[derive(Debug)]
pub struct InterfaceHandle {
    pub inbound: mpsc::Sender<Bytes>,
    pub outbound: mpsc::UnboundedReceiver<Bytes>,
}

impl InterfaceHandle {
    pub async fn inject(&self, frame: Bytes) -> bool {
        self.inbound.send(frame).await.is_ok()
    }

    pub async fn next_frame(&mut self) -> Option<Bytes> {
        self.outbound.recv().await
    }
}

pub fn channel(capacity: usize) -> (VirtualInterface, InterfaceHandle) {
    let (in_tx, in_rx) = mpsc::channel(capacity.max(1));
    let (out_tx, out_rx) = mpsc::unbounded_channel();

    (
        VirtualInterface {
            inbound: in_rx,
            writer: PacketWriter { tx: out_tx },
        },
        InterfaceHandle {
            inbound: in_tx,
            outbound: out_rx,
        },
    )
}

/// Reader/writer tasks pumping a TUN descriptor through a channel interface.
pub struct FdBridge {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl FdBridge {
    pub fn shutdown(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for FdBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: `raw` is owned by `fd` and stays open for both calls.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    let rc = unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Bridges a TUN-style descriptor: one `read(2)` is one frame, one frame is
/// one `write(2)`. Must be called inside a tokio runtime.
pub fn attach_fd(fd: OwnedFd, mtu: usize, capacity: usize) -> Result<(VirtualInterface, FdBridge)> {
    set_nonblocking(&fd)?;
    let async_fd = Arc::new(
        AsyncFd::new(fd).map_err(|e| Error::Device(format!("cannot register descriptor: {}", e)))?,
    );
    let (iface, handle) = channel(capacity);
    let InterfaceHandle { inbound, mut outbound } = handle;

    let read_fd = async_fd.clone();
    let reader = tokio::spawn(async move {
        let mut buf = vec![0u8; mtu.max(576)];
        loop {
            let mut guard = match read_fd.readable().await {
                Ok(guard) => guard,
                Err(e) => {
                    error!("Virtual interface poll failed: {}", e);
                    break;
                }
            };

            let result = guard.try_io(|inner| {
                // SAFETY: `buf` is valid for `buf.len()` bytes.
                let n = unsafe {
                    libc::read(inner.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });

            match result {
                Ok(Ok(0)) => {
                    info!("Virtual interface closed");
                    break;
                }
                Ok(Ok(n)) => {
                    if inbound.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        debug!("Engine dropped the interface, stopping reader");
                        break;
                    }
                }
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => {
                    error!("Virtual interface read failed: {}", e);
                    break;
                }
                Err(_would_block) => continue,
            }
        }
    });

    let write_fd = async_fd;
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            loop {
                let mut guard = match write_fd.writable().await {
                    Ok(guard) => guard,
                    Err(e) => {
                        error!("Virtual interface poll failed: {}", e);
                        return;
                    }
                };

                let result = guard.try_io(|inner| {
                    // SAFETY: `frame` is valid for `frame.len()` bytes.
                    let n = unsafe {
                        libc::write(inner.as_raw_fd(), frame.as_ptr() as *const libc::c_void, frame.len())
                    };
                    if n < 0 {
                        Err(std::io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                });

                match result {
                    Ok(Ok(n)) => {
                        if n != frame.len() {
                            warn!("Short write to virtual interface: {} of {} bytes", n, frame.len());
                        }
                        break;
                    }
                    Ok(Err(e)) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Ok(Err(e)) => {
                        warn!("Dropping frame, write failed: {}", e);
                        break;
                    }
                    Err(_would_block) => continue,
                }
            }
        }
    });

    Ok((iface, FdBridge { reader, writer }))
}
