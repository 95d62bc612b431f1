//! USB transfer-streaming engine
//!
//! Keeps a fixed number of transfer requests outstanding on a single USB
//! endpoint, resubmits each request from its completion, and measures the
//! sustained data rate over windows of `queue_depth` completions.
//!
//! The engine is transport-agnostic: [`Transport`] abstracts descriptor
//! allocation, submission and the bounded event poll. [`usb::LibusbTransport`]
//! drives real hardware through libusb's asynchronous API, and
//! [`test_utils::ScriptedTransport`] replays scripted completions in tests.
//!
//! A run is driven either on the caller's thread ([`Engine::run`]) or on a
//! dedicated worker thread ([`Engine::spawn`]); any clone of the [`Engine`]
//! can query counters or request a stop while the run is in progress.

mod completion;
pub mod config;
pub mod engine;
pub mod error;
pub mod pool;
pub mod report;
pub mod test_utils;
pub mod throughput;
pub mod transport;
pub mod usb;

pub use completion::transferred_bytes;
pub use config::{EngineConfig, RunMode, TransferKind, validate_endpoint};
pub use engine::{Engine, EngineStats, RunState, RunSummary};
pub use error::{EngineError, Result};
pub use pool::{TransferPool, TransferSlot};
pub use report::{FnSink, NullSink, Report, ReportKind, ReportSink, report_channel};
pub use throughput::{ThroughputWindow, WindowSnapshot, rate_kbps};
pub use transport::{
    Completion, IsoPacket, TRANSFER_TIMEOUT, TransferStatus, Transport, TransportError,
};
