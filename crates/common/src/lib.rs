//! Common utilities for usb-perf
//!
//! Application-level support for the `usb-perf` binary: the ambient error
//! type, tracing setup and human-readable formatting of byte counts, data
//! rates and durations. The streaming engine itself does not depend on it.

pub mod error;
pub mod format;
pub mod logging;

pub use error::{Error, Result};
pub use format::{format_bytes, format_duration, format_rate_kbps};
pub use logging::{LOG_LEVELS, setup_logging};
