//! Reporting sink
//!
//! The engine pushes plain counter values to a [`ReportSink`] roughly once
//! per second, whenever a throughput window closes, and once at the end of
//! the run. Sinks must return immediately: a slow consumer loses reports,
//! it never stalls the event loop.

use crate::throughput::WindowSnapshot;
use async_channel::{Receiver, Sender, TrySendError};
use tracing::trace;

/// Why a report was published
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    /// About once per second from the event loop
    Periodic,
    /// A throughput window of `queue_depth` completions closed
    WindowClosed,
    /// The run drained and released its resources
    Final,
}

/// Counter values at the time of publishing
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub kind: ReportKind,
    pub success_count: u64,
    pub failure_count: u64,
    /// Rate of the most recently closed window, in KB/s
    pub rate_kbps: f64,
    pub in_flight: usize,
    /// The window that just closed (`WindowClosed` reports only)
    pub window: Option<WindowSnapshot>,
}

/// Consumer of engine reports
pub trait ReportSink: Send {
    /// Hand over a report; must not block
    fn publish(&self, report: &Report);
}

/// Sink that discards every report
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ReportSink for NullSink {
    fn publish(&self, _report: &Report) {}
}

/// Sink that hands each report to a closure
pub struct FnSink<F>(pub F);

impl<F> ReportSink for FnSink<F>
where
    F: Fn(&Report) + Send,
{
    fn publish(&self, report: &Report) {
        (self.0)(report)
    }
}

impl ReportSink for Sender<Report> {
    fn publish(&self, report: &Report) {
        match self.try_send(report.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                trace!("Report channel full, dropping {:?} report", report.kind);
            }
            Err(TrySendError::Closed(_)) => {
                trace!("Report channel closed");
            }
        }
    }
}

/// Create a bounded channel for streaming reports to an async consumer
pub fn report_channel(capacity: usize) -> (Sender<Report>, Receiver<Report>) {
    async_channel::bounded(capacity)
}
