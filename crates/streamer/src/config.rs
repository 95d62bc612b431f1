//! Engine configuration
//!
//! An [`EngineConfig`] is fixed for the whole run: the engine takes it by
//! reference and never mutates it while transfers are in flight.

use crate::error::{EngineError, Result};
use std::fmt;
use std::time::{Duration, Instant};

/// Default request size in packets (or bursts) per request
pub const DEFAULT_REQUEST_SIZE: usize = 16;

/// Default number of requests kept in flight
pub const DEFAULT_QUEUE_DEPTH: usize = 16;

/// libusb expresses buffer lengths and packet counts as C ints
const MAX_BUFFER_SIZE: usize = i32::MAX as usize;

/// Transfer type of the endpoint under test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Bulk,
    Interrupt,
    Isochronous,
}

impl TransferKind {
    /// Map a descriptor transfer type to a streamable kind
    ///
    /// Control endpoints cannot be streamed and are rejected.
    pub fn from_rusb(transfer_type: rusb::TransferType) -> Result<Self> {
        match transfer_type {
            rusb::TransferType::Bulk => Ok(Self::Bulk),
            rusb::TransferType::Interrupt => Ok(Self::Interrupt),
            rusb::TransferType::Isochronous => Ok(Self::Isochronous),
            rusb::TransferType::Control => Err(EngineError::UnsupportedTransferType(
                "control".to_string(),
            )),
        }
    }

    pub fn is_isochronous(self) -> bool {
        self == Self::Isochronous
    }
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bulk => "bulk",
            Self::Interrupt => "interrupt",
            Self::Isochronous => "isochronous",
        };
        f.write_str(name)
    }
}

/// Check that `address` names a data endpoint
///
/// Bits 4..=6 are reserved and must be clear; endpoint number 0 is the
/// control pipe. Bit 7 selects the direction and may be either value.
pub fn validate_endpoint(address: u8) -> Result<()> {
    if (address & 0x70) != 0 || (address & 0x0f) == 0 {
        return Err(EngineError::InvalidEndpoint(address));
    }
    Ok(())
}

/// Parameters of a streaming run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Endpoint address (direction bit included)
    pub endpoint: u8,
    /// Transfer type of the endpoint
    pub kind: TransferKind,
    /// Maximum packet size, already scaled by burst / high-bandwidth multipliers
    pub packet_size: usize,
    /// Packets (or bursts) per request
    pub request_size: usize,
    /// Number of requests kept in flight
    pub queue_depth: usize,
}

impl EngineConfig {
    /// Create a configuration with the default request size and queue depth
    pub fn new(endpoint: u8, kind: TransferKind, packet_size: usize) -> Self {
        Self {
            endpoint,
            kind,
            packet_size,
            request_size: DEFAULT_REQUEST_SIZE,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }

    pub fn with_request_size(mut self, request_size: usize) -> Self {
        self.request_size = request_size;
        self
    }

    pub fn with_queue_depth(mut self, queue_depth: usize) -> Self {
        self.queue_depth = queue_depth;
        self
    }

    /// Reject configurations before any resource is allocated
    pub fn validate(&self) -> Result<()> {
        validate_endpoint(self.endpoint)?;

        if self.packet_size == 0 {
            return Err(EngineError::InvalidConfig(
                "packet size must be greater than 0".to_string(),
            ));
        }
        if self.request_size == 0 {
            return Err(EngineError::InvalidConfig(
                "request size must be at least one packet".to_string(),
            ));
        }
        if self.queue_depth == 0 {
            return Err(EngineError::InvalidConfig(
                "queue depth must be at least 1".to_string(),
            ));
        }

        match self.request_size.checked_mul(self.packet_size) {
            Some(size) if size <= MAX_BUFFER_SIZE => Ok(()),
            _ => Err(EngineError::InvalidConfig(format!(
                "request of {} x {} bytes exceeds the maximum transfer length",
                self.request_size, self.packet_size
            ))),
        }
    }

    /// Size of each request buffer in bytes
    pub fn buffer_size(&self) -> usize {
        self.request_size * self.packet_size
    }

    /// Number of isochronous packet descriptors each request carries
    pub fn iso_packets(&self) -> usize {
        if self.kind.is_isochronous() {
            self.request_size
        } else {
            0
        }
    }

    /// Bytes credited to a successful bulk or interrupt request
    pub fn nominal_request_bytes(&self) -> u64 {
        self.buffer_size() as u64
    }

    /// Whether the endpoint transfers device-to-host
    pub fn is_in(&self) -> bool {
        (self.endpoint & 0x80) != 0
    }
}

/// How long a run lasts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Stream until [`Engine::request_stop`](crate::Engine::request_stop) is called
    UntilStopped,
    /// Stream for a fixed wall-clock duration (an explicit stop still works)
    For(Duration),
}

impl RunMode {
    /// When the run should stop on its own
    ///
    /// A duration too long to represent as an instant has no deadline.
    pub(crate) fn deadline(self, started: Instant) -> Option<Instant> {
        match self {
            Self::UntilStopped => None,
            Self::For(duration) => started.checked_add(duration),
        }
    }
}
