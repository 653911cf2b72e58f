//! Error types for the dexhand library.

use std::net::{Ipv4Addr, SocketAddr};

use thiserror::Error;

/// The main error type for dexhand operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket, bind or membership failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed or unroutable envelope.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// No telemetry arrived for too many watchdog ticks.
    #[error("liveness failure: no telemetry for {ticks} watchdog ticks")]
    LivenessFailure { ticks: u32 },

    /// The session has been terminated.
    #[error("session closed")]
    SessionClosed,

    /// Configuration rejected by validation.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

/// Socket-level errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Device host could not be resolved.
    #[error("cannot resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },

    /// Local bind failed.
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Address is outside 224.0.0.0/4.
    #[error("{0} is not a multicast address")]
    NotMulticast(Ipv4Addr),

    /// Multicast membership could not be joined.
    #[error("cannot join multicast group {group} on {interface}: {source}")]
    Membership {
        group: Ipv4Addr,
        interface: Ipv4Addr,
        #[source]
        source: std::io::Error,
    },

    /// Setting a socket option failed.
    #[error("cannot set socket option {option}: {source}")]
    SocketOption {
        option: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Sending a datagram failed.
    #[error("send failed: {0}")]
    Send(#[source] std::io::Error),

    /// Receiving a datagram failed.
    #[error("receive failed: {0}")]
    Receive(#[source] std::io::Error),
}

/// Envelope-level errors. Always recovered locally by dropping the datagram.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Datagram is not a valid envelope.
    #[error("malformed envelope: {0}")]
    Decode(#[from] serde_json::Error),

    /// Message names a device this client does not know.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// Telemetry for a category not enabled in this session.
    #[error("no telemetry registered for device category {0}")]
    UnregisteredCategory(String),

    /// Multi-instance telemetry without a serial number.
    #[error("{device} telemetry is missing its serial number")]
    MissingInstanceKey { device: String },

    /// Payload did not match the enabled telemetry components.
    #[error("invalid {device} payload: {source}")]
    Payload {
        device: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Result type alias for dexhand operations.
pub type Result<T> = std::result::Result<T, Error>;
