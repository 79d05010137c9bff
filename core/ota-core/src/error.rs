//! Error types for the OTA orchestration core.
//!
//! Fatal errors roll up into [`OtaError`] and end the run. [`UploadError`] is
//! per-device and never leaves the session registry.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

// ═══════════════════════════════════════════════════════════════════════════════
// Run-level Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything that aborts an orchestration run.
#[derive(Debug, thiserror::Error)]
pub enum OtaError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Serial(#[from] SerialError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error("Failed to spawn {name} thread: {source}")]
    Thread {
        name: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Convenience type alias for Results using OtaError.
pub type Result<T> = std::result::Result<T, OtaError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Component Errors
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found; example config generated at {0}, edit it as needed")]
    ExampleWritten(PathBuf),

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write example config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Config file malformed: {path}: {details}")]
    Malformed { path: PathBuf, details: String },

    #[error("Missing required config values: {}", .0.join(", "))]
    Missing(Vec<&'static str>),

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },

    #[error("Firmware file does not exist: {0}")]
    FirmwareNotFound(PathBuf),
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("No gateway with VID {vid:#06x} and PID {pid:#06x} found; check the connection and that it is not in the bootloader")]
    NotFound { vid: u16, pid: u16 },

    #[error("Failed to enumerate serial ports: {0}")]
    Enumerate(#[source] serialport::Error),

    #[error("Failed to open gateway port {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: serialport::Error,
    },

    #[error("Failed to set DTR/RTS ({step}): {source}")]
    ControlLine {
        step: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Rendezvous listener failures. Cloneable so every readiness waiter can
/// receive the same value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ListenerError {
    #[error("Failed to bind UDP listener on {addr}: {message}")]
    Bind {
        addr: SocketAddr,
        kind: io::ErrorKind,
        message: String,
    },

    #[error("UDP listener on {0} stopped before it became ready")]
    Stopped(SocketAddr),
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("Failed to write OTA command to the gateway: {0}")]
    CommandWrite(#[source] io::Error),

    #[error("Gateway does not support the OTA update command, update the gateway firmware (gateway said: {0})")]
    UnsupportedCommand(String),

    #[error("Gateway port closed before OTA could start, check the gateway")]
    ConnectionLost,

    #[error("Failed to read from gateway: {0}")]
    Read(#[source] io::Error),
}

/// A single device's upload failure.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Failed to read firmware image {path}: {source}")]
    ReadImage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Socket error during {stage}: {source}")]
    Socket {
        stage: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("No response to invitation after {attempts} attempts")]
    NoResponse { attempts: u32 },

    #[error("Device rejected invitation: {0}")]
    Rejected(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Device did not connect back within {secs}s")]
    ConnectTimeout { secs: u64 },

    #[error("Device reported an error: {0}")]
    Device(String),

    #[error("Device closed the connection before confirming the upload")]
    Unconfirmed,
}
