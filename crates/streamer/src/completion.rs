//! Completion handler
//!
//! Runs once per finished request, always from the event loop of the run
//! that owns the slot. It classifies the outcome, credits the bytes moved,
//! advances the throughput window and, unless a stop was requested, hands
//! the slot straight back to the device.

use crate::config::{EngineConfig, TransferKind};
use crate::engine::Run;
use crate::report::{ReportKind, ReportSink};
use crate::transport::{Completion, Transport};
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Bytes a completed request contributes to the throughput window
///
/// Bulk and interrupt requests count their full nominal size on success
/// and nothing on failure. Isochronous requests always count the actual
/// length of each packet that succeeded on its own, even when the request
/// as a whole reports an error.
pub fn transferred_bytes(config: &EngineConfig, completion: &Completion) -> u64 {
    match config.kind {
        TransferKind::Bulk | TransferKind::Interrupt => {
            if completion.status.is_success() {
                config.nominal_request_bytes()
            } else {
                0
            }
        }
        TransferKind::Isochronous => completion
            .iso_packets
            .iter()
            .take(config.request_size)
            .filter(|packet| packet.status.is_success())
            .map(|packet| packet.actual_length as u64)
            .sum(),
    }
}

impl<T: Transport, S: ReportSink + ?Sized> Run<'_, T, S> {
    pub(crate) fn handle_completion(&mut self, completion: Completion) {
        let index = completion.slot;
        match self.pool.get_mut(index) {
            Some(slot) if slot.is_in_flight() => slot.mark_idle(),
            Some(_) => {
                warn!("Ignoring completion for idle slot {}", index);
                return;
            }
            None => {
                warn!("Ignoring completion for unknown slot {}", index);
                return;
            }
        }

        let bytes = transferred_bytes(self.config, &completion);
        if completion.status.is_success() {
            self.shared.record_success();
        } else {
            debug!(
                "Transfer on slot {} failed: {:?} ({} bytes credited)",
                index, completion.status, bytes
            );
            self.shared.record_failure();
        }
        self.total_bytes += bytes;
        self.shared.request_completed();

        if let Some(snapshot) = self.window.record(bytes, Instant::now()) {
            self.windows += 1;
            let rate = snapshot.rate_kbps();
            self.shared.set_rate(rate);
            trace!(
                "Window closed: {} bytes in {} us ({:.1} KB/s)",
                snapshot.bytes, snapshot.elapsed_us, rate
            );
            self.publish(ReportKind::WindowClosed, Some(snapshot));
        }

        if !self.shared.stop_requested() {
            self.submit(index);
        }
    }
}
