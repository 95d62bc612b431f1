//! Engine error types

use thiserror::Error;

/// Errors that abort an engine operation
///
/// Per-request transport failures never show up here: they are counted as
/// failed transfers and the run carries on.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid endpoint {0:#04x}")]
    InvalidEndpoint(u8),

    #[error("Endpoint {0:#04x} not found on device")]
    EndpointNotFound(u8),

    #[error("Unsupported transfer type: {0}")]
    UnsupportedTransferType(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid device filter '{0}', expected VID:PID (e.g. '0x04b4:0x00f1')")]
    InvalidFilter(String),

    #[error("No USB device matching {0}")]
    DeviceNotFound(String),

    #[error("Engine is already running")]
    AlreadyRunning,

    #[error("Out of memory allocating transfer slot {slot}: {reason}")]
    OutOfMemory { slot: usize, reason: String },

    #[error("Cannot release transfer pool with {0} request(s) in flight")]
    ReleaseWhileInFlight(usize),

    #[error("Failed to spawn streamer thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
