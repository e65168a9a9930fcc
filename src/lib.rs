//! Userspace capture engine for a TUN-style interface: a synthetic TCP peer
//! and UDP relay over real sockets, streaming HTTP sniffing, and optional
//! TLS interception through a local relay.

pub mod ca;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod event;
pub mod graceful;
pub mod packet;
pub mod protect;
pub mod proxy;
pub mod pump;
pub mod sniff;
pub mod state;
pub mod tcp;
pub mod tls;
pub mod tracker;
pub mod udp;

pub use config::EngineConfig;
pub use engine::{Engine, EngineHandle};
pub use error::{Error, Result, SniffError};
pub use event::{AppAttributor, AppIdentity, AppProtocol, EventSink, LogSink, NoAttribution, TrafficEvent};
pub use protect::SocketProtector;
pub use tcp::{FlowKey, Transport};
