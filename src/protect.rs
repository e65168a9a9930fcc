// src/protect.rs - keep engine-originated sockets off the virtual interface
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpSocket;
use tracing::{debug, warn};

use crate::config::{ExclusionConfig, ExclusionMode};
use crate::error::{Error, Result};

/// Marks a socket so its traffic bypasses the virtual interface. Called on
/// every socket the engine opens, before connect. `false` means the socket
/// would loop back into the engine and must not be used.
pub trait SocketProtector: Send + Sync + fmt::Debug {
    fn exclude(&self, socket: &Socket) -> bool;
}

/// `SO_MARK`, for setups where policy routing skips marked packets.
#[derive(Debug, Clone, Copy)]
pub struct FwMarkProtector {
    pub mark: u32,
}

impl SocketProtector for FwMarkProtector {
    fn exclude(&self, socket: &Socket) -> bool {
        match socket.set_mark(self.mark) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to set routing mark {}: {}", self.mark, e);
                false
            }
        }
    }
}

/// `SO_BINDTODEVICE` onto the real uplink.
#[derive(Debug, Clone)]
pub struct BindDeviceProtector {
    pub device: String,
}

impl SocketProtector for BindDeviceProtector {
    fn exclude(&self, socket: &Socket) -> bool {
        // IFNAMSIZ includes the terminator
        if self.device.is_empty() || self.device.len() > 15 {
            warn!("Invalid uplink interface name: {:?}", self.device);
            return false;
        }
        match socket.bind_device(Some(self.device.as_bytes())) {
            Ok(()) => {
                debug!("Bound socket to interface: {}", self.device);
                true
            }
            Err(e) => {
                warn!("Failed to bind to interface {}: {}", self.device, e);
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoExclusion;

impl SocketProtector for NoExclusion {
    fn exclude(&self, _socket: &Socket) -> bool {
        true
    }
}

/// A non-blocking stream socket that already passed exclusion, optionally
/// bound so its local port is known before connect.
pub fn protected_tcp_socket(protector: &dyn SocketProtector, bind: Option<SocketAddr>) -> Result<TcpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    if !protector.exclude(&socket) {
        return Err(Error::Exclusion(format!("{:?}", protector)));
    }
    socket.set_nodelay(true)?;
    if let Some(addr) = bind {
        socket.bind(&addr.into())?;
    }
    socket.set_nonblocking(true)?;
    Ok(TcpSocket::from_std_stream(socket.into()))
}

pub fn from_config(config: &ExclusionConfig) -> Arc<dyn SocketProtector> {
    match config.mode {
        ExclusionMode::None => Arc::new(NoExclusion),
        ExclusionMode::Mark => Arc::new(FwMarkProtector { mark: config.mark }),
        ExclusionMode::Device => Arc::new(BindDeviceProtector {
            device: config.device.clone(),
        }),
    }
}
