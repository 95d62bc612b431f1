//! Test utilities for the streaming engine
//!
//! [`ScriptedTransport`] stands in for a device: submitted slots queue up
//! in order and are completed on later polls according to a script.
//! A [`TransportProbe`] cloned out of it stays readable after the transport
//! has been moved onto the streamer thread.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use streamer::test_utils::ScriptedTransport;
//! use streamer::{Engine, EngineConfig, NullSink, RunMode, TransferKind};
//!
//! let engine = Engine::new();
//! let mut transport = ScriptedTransport::new();
//! let config = EngineConfig::new(0x81, TransferKind::Bulk, 512).with_queue_depth(4);
//!
//! let summary = engine
//!     .run(&mut transport, &config, RunMode::For(Duration::from_millis(20)), &NullSink)
//!     .unwrap();
//! assert_eq!(summary.failure_count, 0);
//! ```

use crate::config::EngineConfig;
use crate::pool::TransferSlot;
use crate::report::{Report, ReportKind, ReportSink};
use crate::transport::{Completion, IsoPacket, TransferStatus, Transport, TransportError};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// How long an idle scripted poll sleeps at most
const IDLE_POLL: Duration = Duration::from_millis(1);

type Outcome = Box<dyn FnMut(u64, usize, &EngineConfig) -> Completion + Send>;

#[derive(Debug, Default)]
struct ProbeState {
    allocations: AtomicUsize,
    released: AtomicUsize,
    submissions: AtomicUsize,
    rejected: AtomicUsize,
    completions: AtomicUsize,
    outstanding: AtomicUsize,
    max_outstanding: AtomicUsize,
    paused: AtomicBool,
}

/// Shared view of what a [`ScriptedTransport`] has done
#[derive(Debug, Clone, Default)]
pub struct TransportProbe(Arc<ProbeState>);

impl TransportProbe {
    /// Descriptors allocated successfully
    pub fn allocations(&self) -> usize {
        self.0.allocations.load(Ordering::SeqCst)
    }

    /// Descriptors dropped
    pub fn released(&self) -> usize {
        self.0.released.load(Ordering::SeqCst)
    }

    /// Accepted submissions, including resubmissions
    pub fn submissions(&self) -> usize {
        self.0.submissions.load(Ordering::SeqCst)
    }

    /// Submissions refused by the script
    pub fn rejected(&self) -> usize {
        self.0.rejected.load(Ordering::SeqCst)
    }

    /// Completions handed to the engine
    pub fn completions(&self) -> usize {
        self.0.completions.load(Ordering::SeqCst)
    }

    /// Requests submitted and not yet completed
    pub fn outstanding(&self) -> usize {
        self.0.outstanding.load(Ordering::SeqCst)
    }

    /// Highest number of requests ever outstanding at once
    pub fn max_outstanding(&self) -> usize {
        self.0.max_outstanding.load(Ordering::SeqCst)
    }

    /// Hold back completions until [`resume`](Self::resume)
    pub fn pause(&self) {
        self.0.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.0.paused.store(false, Ordering::SeqCst);
    }

    fn is_paused(&self) -> bool {
        self.0.paused.load(Ordering::SeqCst)
    }
}

/// Descriptor handed out by [`ScriptedTransport`]
#[derive(Debug)]
pub struct ScriptedDescriptor {
    slot: usize,
    probe: TransportProbe,
}

impl ScriptedDescriptor {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl Drop for ScriptedDescriptor {
    fn drop(&mut self) {
        self.probe.0.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Mock transport that completes requests according to a script
pub struct ScriptedTransport {
    pending: VecDeque<usize>,
    config: Option<EngineConfig>,
    outcome: Outcome,
    sequence: u64,
    completions_per_poll: usize,
    failing_slots: HashSet<usize>,
    failing_attempts: HashSet<usize>,
    attempts: usize,
    failing_allocation: Option<usize>,
    probe: TransportProbe,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    /// Every request completes successfully with a full payload
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            config: None,
            outcome: Box::new(|_, slot, config| full_completion(slot, config)),
            sequence: 0,
            completions_per_poll: usize::MAX,
            failing_slots: HashSet::new(),
            failing_attempts: HashSet::new(),
            attempts: 0,
            failing_allocation: None,
            probe: TransportProbe::default(),
        }
    }

    /// Decide each completion from its sequence number (0-based) and slot
    pub fn with_outcome<F>(mut self, outcome: F) -> Self
    where
        F: FnMut(u64, usize, &EngineConfig) -> Completion + Send + 'static,
    {
        self.outcome = Box::new(outcome);
        self
    }

    /// Complete at most `n` requests per poll
    pub fn completions_per_poll(mut self, n: usize) -> Self {
        self.completions_per_poll = n.max(1);
        self
    }

    /// Refuse every submission for these slots
    pub fn failing_submissions(mut self, slots: impl IntoIterator<Item = usize>) -> Self {
        self.failing_slots.extend(slots);
        self
    }

    /// Refuse the submission attempts with these 0-based sequence numbers
    ///
    /// Attempts are counted across all slots, priming included, so with a
    /// queue depth of 4 attempt 4 is the first resubmission.
    pub fn failing_attempts(mut self, attempts: impl IntoIterator<Item = usize>) -> Self {
        self.failing_attempts.extend(attempts);
        self
    }

    /// Fail descriptor allocation for `slot`
    pub fn failing_allocation_at(mut self, slot: usize) -> Self {
        self.failing_allocation = Some(slot);
        self
    }

    /// Start with completions held back
    pub fn paused(self) -> Self {
        self.probe.pause();
        self
    }

    pub fn probe(&self) -> TransportProbe {
        self.probe.clone()
    }
}

impl Transport for ScriptedTransport {
    type Descriptor = ScriptedDescriptor;

    fn alloc_descriptor(
        &mut self,
        slot: usize,
        config: &EngineConfig,
    ) -> Result<ScriptedDescriptor, TransportError> {
        if self.failing_allocation == Some(slot) {
            return Err(TransportError::NoMemory);
        }
        self.config = Some(config.clone());
        self.probe.0.allocations.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedDescriptor {
            slot,
            probe: self.probe.clone(),
        })
    }

    fn submit(
        &mut self,
        slot: &mut TransferSlot<ScriptedDescriptor>,
        _config: &EngineConfig,
    ) -> Result<(), TransportError> {
        let index = slot.descriptor().slot();
        let attempt = self.attempts;
        self.attempts += 1;
        if self.failing_slots.contains(&index) || self.failing_attempts.contains(&attempt) {
            self.probe.0.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(TransportError::Busy);
        }

        self.pending.push_back(index);
        self.probe.0.submissions.fetch_add(1, Ordering::SeqCst);
        let outstanding = self.probe.0.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe
            .0
            .max_outstanding
            .fetch_max(outstanding, Ordering::SeqCst);
        Ok(())
    }

    fn poll(
        &mut self,
        timeout: Duration,
        _slots: &[TransferSlot<ScriptedDescriptor>],
    ) -> Result<Vec<Completion>, TransportError> {
        if self.probe.is_paused() || self.pending.is_empty() {
            std::thread::sleep(timeout.min(IDLE_POLL));
            return Ok(Vec::new());
        }

        let Some(config) = self.config.as_ref() else {
            return Ok(Vec::new());
        };

        let count = self.pending.len().min(self.completions_per_poll);
        let mut completions = Vec::with_capacity(count);
        for slot in self.pending.drain(..count) {
            completions.push((self.outcome)(self.sequence, slot, config));
            self.sequence += 1;
            self.probe.0.outstanding.fetch_sub(1, Ordering::SeqCst);
            self.probe.0.completions.fetch_add(1, Ordering::SeqCst);
        }
        Ok(completions)
    }
}

/// Successful completion with a full payload for `config`
pub fn full_completion(slot: usize, config: &EngineConfig) -> Completion {
    if config.kind.is_isochronous() {
        let packets = (0..config.request_size)
            .map(|_| IsoPacket {
                status: TransferStatus::Completed,
                actual_length: config.packet_size,
            })
            .collect();
        Completion::isochronous(slot, TransferStatus::Completed, packets)
    } else {
        Completion::success(slot, config.buffer_size())
    }
}

/// Sink that keeps every report for inspection
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    reports: Arc<Mutex<Vec<Report>>>,
}

impl CollectingSink {
    pub fn reports(&self) -> Vec<Report> {
        self.reports
            .lock()
            .map(|reports| reports.clone())
            .unwrap_or_default()
    }

    /// Reports published when a throughput window closed
    pub fn window_reports(&self) -> Vec<Report> {
        self.reports()
            .into_iter()
            .filter(|report| report.kind == ReportKind::WindowClosed)
            .collect()
    }
}

impl ReportSink for CollectingSink {
    fn publish(&self, report: &Report) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push(report.clone());
        }
    }
}
