// src/error.rs
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by the engine.
///
/// Only `Certificate` (during CA bootstrap) and `Device` are fatal to the
/// whole engine; everything else is scoped to the flow that raised it.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("socket exclusion failed for {0}")]
    Exclusion(String),

    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Sniff error: {0}")]
    Sniff(#[from] SniffError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Virtual interface error: {0}")]
    Device(String),
}

impl Error {
    pub fn certificate(msg: impl Into<String>) -> Self {
        Error::Certificate(msg.into())
    }

    pub fn tls(msg: impl Into<String>) -> Self {
        Error::Tls(msg.into())
    }

    pub fn connect(msg: impl Into<String>) -> Self {
        Error::Connect(msg.into())
    }
}

impl From<rcgen::Error> for Error {
    fn from(value: rcgen::Error) -> Self {
        Error::Certificate(value.to_string())
    }
}

impl From<tokio_rustls::rustls::Error> for Error {
    fn from(value: tokio_rustls::rustls::Error) -> Self {
        Error::Tls(value.to_string())
    }
}

/// Parse failures inside the HTTP/TLS sniffer. These never leave the
/// tracker: the direction is abandoned and forwarding carries on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SniffError {
    #[error("malformed start line: {0:?}")]
    StartLine(String),

    #[error("invalid status code: {0:?}")]
    StatusCode(String),

    #[error("truncated TLS handshake")]
    TruncatedHandshake,

    #[error("not a TLS ClientHello")]
    NotClientHello,
}
