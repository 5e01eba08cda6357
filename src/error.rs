//! Error taxonomy for the acquisition pipeline.
//!
//! Every variant here degrades to "skip this unit of work and continue"; none
//! of them is meant to take the process down.

use std::time::Duration;
use thiserror::Error;

/// Failure of a single register transaction on a bus handle.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to open bus {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to select device 0x{addr:02x}: {source}")]
    Select {
        addr: u8,
        #[source]
        source: std::io::Error,
    },
    #[error("transfer with device 0x{addr:02x} reg 0x{reg:02x} failed: {source}")]
    Transfer {
        addr: u8,
        reg: u8,
        #[source]
        source: std::io::Error,
    },
    #[error("short read from device 0x{addr:02x} reg 0x{reg:02x}: got {actual} of {expected} bytes")]
    ShortRead {
        addr: u8,
        reg: u8,
        expected: usize,
        actual: usize,
    },
    #[error("no device acknowledged at 0x{0:02x}")]
    NoDevice(u8),
    #[error("injected fault on device 0x{addr:02x} reg 0x{reg:02x}")]
    Injected { addr: u8, reg: u8 },
    #[error("bus backend not supported on this platform")]
    Unsupported,
}

/// Malformed or missing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("'sensors' configuration is not an array")]
    NotAnArray,
    #[error("sensor entry is not an object")]
    NotAnObject,
    #[error("sensor is disabled")]
    Disabled,
    #[error("missing required key '{0}'")]
    MissingField(&'static str),
    #[error("invalid value for '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("unknown sensor type '{0}'")]
    UnknownType(String),
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Fatal to one sensor instance; the builder leaves it out of the active set.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("unexpected identity 0x{found:02x} at 0x{addr:02x} (expected 0x{expected:02x})")]
    IdentityMismatch { addr: u8, expected: u8, found: u8 },
    #[error("failed to read identity register: {0}")]
    Identity(#[source] BusError),
    #[error("failed to read calibration data: {0}")]
    Calibration(#[source] BusError),
    #[error("failed to configure sensor: {0}")]
    Configure(#[source] BusError),
    #[error("invalid device address 0x{0:02x}")]
    InvalidAddress(u8),
    #[error("sensor is disabled")]
    Disabled,
}

/// Transient; the sensor stays enrolled and is retried on its next slot.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("conversion not complete (sentinel raw value)")]
    NotReady,
    #[error("every field failed: {0}")]
    AllFieldsFailed(String),
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("a connection attempt is already in progress")]
    InProgress,
    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("broker refused the connection: {0}")]
    Refused(String),
    #[error("connection lost: {0}")]
    Lost(String),
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("cannot publish, not connected")]
    NotConnected,
    #[error("invalid QoS level {0}")]
    InvalidQos(u8),
    #[error("transport rejected message: {0}")]
    Transport(String),
}

/// Top-level failure of the orchestrator.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("transport setup failed: {0}")]
    Transport(String),
}
