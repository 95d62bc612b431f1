//! Transport seam between the engine and the device stack
//!
//! A [`Transport`] owns the device side of a run: it allocates one
//! descriptor per pool slot, submits slots, and pumps completions with a
//! bounded wait. Completions are reported back as plain [`Completion`]
//! values so that all accounting stays in safe engine code.

use crate::config::EngineConfig;
use crate::pool::TransferSlot;
use std::time::Duration;
use thiserror::Error;

/// Deadline the device stack enforces on each request
pub const TRANSFER_TIMEOUT: Duration = Duration::from_millis(5000);

/// Final status of a request or of one isochronous packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

impl TransferStatus {
    pub fn is_success(self) -> bool {
        self == Self::Completed
    }
}

/// Outcome of one isochronous micro-frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacket {
    pub status: TransferStatus,
    pub actual_length: usize,
}

/// A finished request as seen by the completion handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Pool slot the request was submitted from
    pub slot: usize,
    /// Status of the request as a whole
    pub status: TransferStatus,
    /// Bytes the device stack reported for the whole request
    pub actual_length: usize,
    /// Per-packet results (isochronous requests only)
    pub iso_packets: Vec<IsoPacket>,
}

impl Completion {
    /// A bulk or interrupt request that completed with `actual_length` bytes
    pub fn success(slot: usize, actual_length: usize) -> Self {
        Self {
            slot,
            status: TransferStatus::Completed,
            actual_length,
            iso_packets: Vec::new(),
        }
    }

    /// A request that failed as a whole
    pub fn failure(slot: usize, status: TransferStatus) -> Self {
        Self {
            slot,
            status,
            actual_length: 0,
            iso_packets: Vec::new(),
        }
    }

    /// An isochronous request with per-packet results
    pub fn isochronous(slot: usize, status: TransferStatus, iso_packets: Vec<IsoPacket>) -> Self {
        let actual_length = iso_packets.iter().map(|p| p.actual_length).sum();
        Self {
            slot,
            status,
            actual_length,
            iso_packets,
        }
    }
}

/// Errors raised by the device stack on submission or event handling
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Insufficient memory")]
    NoMemory,

    #[error("Resource busy")]
    Busy,

    #[error("No such device (it may have been disconnected)")]
    NoDevice,

    #[error("Entity not found")]
    NotFound,

    #[error("Invalid parameter")]
    InvalidParam,

    #[error("Operation not supported")]
    NotSupported,

    #[error("Input/output error")]
    Io,

    #[error("Event handling interrupted")]
    Interrupted,

    #[error("{0}")]
    Other(String),
}

impl From<rusb::Error> for TransportError {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::NoMem => Self::NoMemory,
            rusb::Error::Busy => Self::Busy,
            rusb::Error::NoDevice => Self::NoDevice,
            rusb::Error::NotFound => Self::NotFound,
            rusb::Error::InvalidParam => Self::InvalidParam,
            rusb::Error::NotSupported => Self::NotSupported,
            rusb::Error::Io => Self::Io,
            rusb::Error::Interrupted => Self::Interrupted,
            _ => Self::Other(err.to_string()),
        }
    }
}

/// Device side of a streaming run
///
/// All methods are called from the thread executing the run. Completions
/// must only be reported from [`poll`](Transport::poll), never from
/// another thread, and each submitted slot must be reported exactly once.
pub trait Transport {
    /// Per-slot transfer descriptor, bound to the slot's buffer on submission
    type Descriptor;

    /// Allocate the descriptor for pool slot `slot`
    fn alloc_descriptor(
        &mut self,
        slot: usize,
        config: &EngineConfig,
    ) -> Result<Self::Descriptor, TransportError>;

    /// Submit the slot's request; isochronous packet lengths are re-armed here
    fn submit(
        &mut self,
        slot: &mut TransferSlot<Self::Descriptor>,
        config: &EngineConfig,
    ) -> Result<(), TransportError>;

    /// Wait up to `timeout` for events and return the requests that finished
    fn poll(
        &mut self,
        timeout: Duration,
        slots: &[TransferSlot<Self::Descriptor>],
    ) -> Result<Vec<Completion>, TransportError>;
}
