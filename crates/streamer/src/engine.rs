//! Lifecycle controller
//!
//! Owns the `Idle -> Running -> Stopping -> Idle` state machine of one
//! engine instance and drives a run end to end:
//!
//! 1. validate the configuration and claim the engine
//! 2. allocate the transfer pool
//! 3. prime every slot
//! 4. pump completions with a bounded wait, reporting about once a second
//! 5. on stop (explicit or duration expiry) keep pumping without
//!    resubmitting until nothing is in flight
//! 6. release the pool and return to idle
//!
//! Counters and the run state live in an [`EngineShared`] behind an `Arc`,
//! so any clone of [`Engine`] can observe the run or request a stop from
//! another thread.

use crate::config::{EngineConfig, RunMode};
use crate::error::{EngineError, Result};
use crate::pool::TransferPool;
use crate::report::{Report, ReportKind, ReportSink};
use crate::throughput::{ThroughputWindow, WindowSnapshot, rate_kbps};
use crate::transport::{Transport, TransportError};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Upper bound on a single event poll
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Cadence of periodic reports
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Pause between drain polls that returned nothing
const DRAIN_IDLE_SLEEP: Duration = Duration::from_millis(10);

/// Back-off after a failed event poll
const POLL_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Run state of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
}

impl RunState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Idle,
        }
    }
}

/// State shared between the run and every engine handle
#[derive(Debug, Default)]
pub(crate) struct EngineShared {
    state: AtomicU8,
    success: AtomicU64,
    failure: AtomicU64,
    in_flight: AtomicUsize,
    rate_bits: AtomicU64,
}

impl EngineShared {
    fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn try_claim(&self) -> bool {
        self.state
            .compare_exchange(
                RunState::Idle as u8,
                RunState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move `Running` to `Stopping`; false if the run was not running
    fn request_stop(&self) -> bool {
        self.state
            .compare_exchange(
                RunState::Running as u8,
                RunState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn set_idle(&self) {
        self.state.store(RunState::Idle as u8, Ordering::Release);
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.state() == RunState::Stopping
    }

    fn reset_counters(&self) {
        self.success.store(0, Ordering::Release);
        self.failure.store(0, Ordering::Release);
        self.in_flight.store(0, Ordering::Release);
        self.rate_bits.store(0f64.to_bits(), Ordering::Release);
    }

    pub(crate) fn record_success(&self) {
        self.success.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_failure(&self) {
        self.failure.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn request_submitted(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn request_completed(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn set_rate(&self, rate_kbps: f64) {
        self.rate_bits.store(rate_kbps.to_bits(), Ordering::Release);
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn stats(&self) -> EngineStats {
        EngineStats {
            state: self.state(),
            success_count: self.success.load(Ordering::Acquire),
            failure_count: self.failure.load(Ordering::Acquire),
            in_flight: self.in_flight(),
            rate_kbps: f64::from_bits(self.rate_bits.load(Ordering::Acquire)),
        }
    }
}

/// Snapshot of the running counters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineStats {
    pub state: RunState,
    pub success_count: u64,
    pub failure_count: u64,
    pub in_flight: usize,
    /// Rate of the most recently closed window, in KB/s
    pub rate_kbps: f64,
}

/// Totals of a finished run
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub success_count: u64,
    pub failure_count: u64,
    pub total_bytes: u64,
    /// Throughput windows closed during the run
    pub windows: u64,
    /// Time from the end of priming to the end of the drain
    pub elapsed: Duration,
}

impl RunSummary {
    /// Average rate over the whole run, in KB/s
    pub fn average_rate_kbps(&self) -> f64 {
        rate_kbps(self.total_bytes, self.elapsed.as_micros() as u64)
    }
}

/// Handle to a streaming engine
///
/// Cloning yields another handle to the same engine. Only one run can be
/// active per engine; independent engines do not share any state.
#[derive(Debug, Clone, Default)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RunState {
        self.shared.state()
    }

    /// Whether a run is active (running or draining)
    pub fn is_running(&self) -> bool {
        self.state() != RunState::Idle
    }

    pub fn stats(&self) -> EngineStats {
        self.shared.stats()
    }

    /// Ask the active run to stop
    ///
    /// Returns immediately. The run stops resubmitting at its next
    /// completion and becomes idle only once every in-flight request has
    /// completed. Calling this when idle or already stopping does nothing.
    pub fn request_stop(&self) {
        if self.shared.request_stop() {
            info!("Stop requested, draining in-flight transfers");
        }
    }

    /// Run on the calling thread until stopped or `mode` expires
    pub fn run<T, S>(
        &self,
        transport: &mut T,
        config: &EngineConfig,
        mode: RunMode,
        sink: &S,
    ) -> Result<RunSummary>
    where
        T: Transport,
        S: ReportSink + ?Sized,
    {
        config.validate()?;
        let claim = self.claim()?;
        claim.execute(transport, config, mode, sink)
    }

    /// Claim the engine, then run on a dedicated `usb-streamer` thread
    ///
    /// Configuration errors and [`EngineError::AlreadyRunning`] are
    /// reported here; everything after the claim, including allocation
    /// failures, is returned through the join handle.
    pub fn spawn<T, S>(
        &self,
        transport: T,
        config: EngineConfig,
        mode: RunMode,
        sink: S,
    ) -> Result<JoinHandle<Result<RunSummary>>>
    where
        T: Transport + Send + 'static,
        S: ReportSink + 'static,
    {
        config.validate()?;
        let claim = self.claim()?;

        std::thread::Builder::new()
            .name("usb-streamer".to_string())
            .spawn(move || {
                let mut transport = transport;
                claim.execute(&mut transport, &config, mode, &sink)
            })
            .map_err(EngineError::Spawn)
    }

    fn claim(&self) -> Result<RunClaim> {
        if !self.shared.try_claim() {
            return Err(EngineError::AlreadyRunning);
        }
        Ok(RunClaim {
            shared: self.shared.clone(),
        })
    }
}

/// Exclusive right to run the engine; returns it to idle when dropped
struct RunClaim {
    shared: Arc<EngineShared>,
}

impl RunClaim {
    fn execute<T, S>(
        self,
        transport: &mut T,
        config: &EngineConfig,
        mode: RunMode,
        sink: &S,
    ) -> Result<RunSummary>
    where
        T: Transport,
        S: ReportSink + ?Sized,
    {
        self.shared.reset_counters();

        info!(
            "Starting test: endpoint {:#04x} ({}), packet size {}, request size {}, queue depth {}",
            config.endpoint,
            config.kind,
            config.packet_size,
            config.request_size,
            config.queue_depth
        );

        let pool = TransferPool::allocate(config.queue_depth, config.buffer_size(), |slot| {
            transport.alloc_descriptor(slot, config)
        })?;

        let mut run = Run::new(&self.shared, transport, config, pool, sink);
        run.prime();
        run.stream(mode);
        run.drain();
        run.finish()
    }
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        self.shared.set_idle();
    }
}

/// Everything one run owns between priming and release
pub(crate) struct Run<'a, T: Transport, S: ReportSink + ?Sized> {
    pub(crate) shared: &'a EngineShared,
    pub(crate) transport: &'a mut T,
    pub(crate) config: &'a EngineConfig,
    pub(crate) pool: TransferPool<T::Descriptor>,
    pub(crate) window: ThroughputWindow,
    pub(crate) sink: &'a S,
    pub(crate) total_bytes: u64,
    pub(crate) windows: u64,
    started: Instant,
}

impl<'a, T: Transport, S: ReportSink + ?Sized> Run<'a, T, S> {
    pub(crate) fn new(
        shared: &'a EngineShared,
        transport: &'a mut T,
        config: &'a EngineConfig,
        pool: TransferPool<T::Descriptor>,
        sink: &'a S,
    ) -> Self {
        let now = Instant::now();
        Self {
            shared,
            transport,
            config,
            pool,
            window: ThroughputWindow::new(config.queue_depth, now),
            sink,
            total_bytes: 0,
            windows: 0,
            started: now,
        }
    }

    /// Submit every slot once; returns the number queued
    ///
    /// A slot whose submission fails stays idle. The window clock starts
    /// only after priming.
    pub(crate) fn prime(&mut self) -> usize {
        for index in 0..self.pool.len() {
            if self.shared.stop_requested() {
                break;
            }
            self.submit(index);
        }

        let queued = self.shared.in_flight();
        info!("Queued {} requests", queued);
        if queued < self.pool.len() {
            warn!(
                "{} of {} requests could not be queued",
                self.pool.len() - queued,
                self.pool.len()
            );
        }

        let now = Instant::now();
        self.window.restart(now);
        self.started = now;
        queued
    }

    /// Submit one idle slot; failures leave it idle without retrying
    pub(crate) fn submit(&mut self, index: usize) -> bool {
        let Some(slot) = self.pool.get_mut(index) else {
            return false;
        };
        if slot.is_in_flight() {
            return false;
        }

        match self.transport.submit(slot, self.config) {
            Ok(()) => {
                slot.mark_in_flight();
                self.shared.request_submitted();
                true
            }
            Err(e) => {
                debug!("Failed to submit request on slot {}: {}", index, e);
                false
            }
        }
    }

    /// Wait up to `timeout` for completions and handle each one
    pub(crate) fn pump(&mut self, timeout: Duration) -> usize {
        match self.transport.poll(timeout, self.pool.slots()) {
            Ok(completions) => {
                let count = completions.len();
                for completion in completions {
                    self.handle_completion(completion);
                }
                count
            }
            Err(TransportError::Interrupted) => {
                debug!("USB event handling interrupted");
                0
            }
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                std::thread::sleep(POLL_ERROR_BACKOFF);
                0
            }
        }
    }

    /// Event loop until a stop is requested or the run duration elapses
    pub(crate) fn stream(&mut self, mode: RunMode) {
        let deadline = mode.deadline(self.started);
        let mut last_report = Instant::now();

        while !self.shared.stop_requested() {
            let now = Instant::now();
            let timeout = match deadline {
                Some(deadline) if now >= deadline => {
                    info!("Test duration is complete. Stopping transfers");
                    self.shared.request_stop();
                    break;
                }
                Some(deadline) => POLL_TIMEOUT.min(deadline - now),
                None => POLL_TIMEOUT,
            };

            self.pump(timeout);

            if last_report.elapsed() >= REPORT_INTERVAL {
                self.publish(ReportKind::Periodic, None);
                last_report = Instant::now();
            }
        }
    }

    /// Keep pumping, without resubmitting, until nothing is in flight
    pub(crate) fn drain(&mut self) {
        while self.shared.in_flight() > 0 {
            debug!("{} requests are pending", self.shared.in_flight());
            if self.pump(POLL_TIMEOUT) == 0 {
                std::thread::sleep(DRAIN_IDLE_SLEEP);
            }
        }
        info!("Transfers completed");
    }

    /// Release the pool and publish the final report
    pub(crate) fn finish(mut self) -> Result<RunSummary> {
        self.pool.release_all()?;
        self.publish(ReportKind::Final, None);

        let stats = self.shared.stats();
        let summary = RunSummary {
            success_count: stats.success_count,
            failure_count: stats.failure_count,
            total_bytes: self.total_bytes,
            windows: self.windows,
            elapsed: self.started.elapsed(),
        };
        info!(
            "Streaming finished: {} pass, {} fail, {} bytes in {:?}",
            summary.success_count, summary.failure_count, summary.total_bytes, summary.elapsed
        );
        Ok(summary)
    }

    pub(crate) fn publish(&self, kind: ReportKind, window: Option<WindowSnapshot>) {
        let stats = self.shared.stats();
        self.sink.publish(&Report {
            kind,
            success_count: stats.success_count,
            failure_count: stats.failure_count,
            rate_kbps: stats.rate_kbps,
            in_flight: stats.in_flight,
            window,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferKind;
    use crate::report::NullSink;
    use crate::test_utils::{CollectingSink, ScriptedTransport};
    use crate::transport::{Completion, TransferStatus};

    fn bulk_config() -> EngineConfig {
        EngineConfig::new(0x81, TransferKind::Bulk, 512)
            .with_request_size(16)
            .with_queue_depth(4)
    }

    fn new_run<'a>(
        shared: &'a EngineShared,
        transport: &'a mut ScriptedTransport,
        config: &'a EngineConfig,
        sink: &'a CollectingSink,
    ) -> Run<'a, ScriptedTransport, CollectingSink> {
        assert!(shared.try_claim());
        shared.reset_counters();
        let pool = TransferPool::allocate(config.queue_depth, config.buffer_size(), |slot| {
            transport.alloc_descriptor(slot, config)
        })
        .unwrap();
        Run::new(shared, transport, config, pool, sink)
    }

    #[test]
    fn test_prime_fills_queue() {
        let shared = EngineShared::default();
        let config = bulk_config();
        let mut transport = ScriptedTransport::new();
        let probe = transport.probe();
        let sink = CollectingSink::default();
        let mut run = new_run(&shared, &mut transport, &config, &sink);

        assert_eq!(run.prime(), 4);
        assert_eq!(shared.in_flight(), 4);
        assert_eq!(run.pool.in_flight_count(), 4);
        assert_eq!(probe.submissions(), 4);
    }

    #[test]
    fn test_prime_skips_failed_submissions() {
        let shared = EngineShared::default();
        let config = bulk_config();
        let mut transport = ScriptedTransport::new().failing_submissions([2]);
        let sink = CollectingSink::default();
        let mut run = new_run(&shared, &mut transport, &config, &sink);

        assert_eq!(run.prime(), 3);
        assert!(!run.pool.slots()[2].is_in_flight());
    }

    #[test]
    fn test_full_window_scenario() {
        let shared = EngineShared::default();
        let config = bulk_config();
        let mut transport = ScriptedTransport::new().completions_per_poll(1);
        let sink = CollectingSink::default();
        let mut run = new_run(&shared, &mut transport, &config, &sink);
        run.prime();

        for _ in 0..4 {
            assert_eq!(run.pump(Duration::ZERO), 1);
            assert_eq!(shared.in_flight(), 4);
        }

        let stats = shared.stats();
        assert_eq!(stats.success_count, 4);
        assert_eq!(stats.failure_count, 0);

        let windows = sink.window_reports();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].window.unwrap().bytes, 4 * 16 * 512);
        assert_eq!(run.window.completions(), 0);
        assert_eq!(run.window.bytes(), 0);
    }

    #[test]
    fn test_alternating_failures_scenario() {
        let shared = EngineShared::default();
        let config = bulk_config();
        let mut transport = ScriptedTransport::new()
            .completions_per_poll(1)
            .with_outcome(|sequence, slot, config| {
                if sequence % 2 == 1 {
                    Completion::failure(slot, TransferStatus::TimedOut)
                } else {
                    Completion::success(slot, config.buffer_size())
                }
            });
        let sink = CollectingSink::default();
        let mut run = new_run(&shared, &mut transport, &config, &sink);
        run.prime();

        for _ in 0..4 {
            run.pump(Duration::ZERO);
        }

        let stats = shared.stats();
        assert_eq!(stats.success_count, 2);
        assert_eq!(stats.failure_count, 2);
        // Timed-out requests are resubmitted like any other
        assert_eq!(stats.in_flight, 4);

        let windows = sink.window_reports();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].window.unwrap().bytes, 2 * 16 * 512);
    }

    #[test]
    fn test_stop_with_three_in_flight_drains_without_resubmitting() {
        let shared = EngineShared::default();
        let config = bulk_config();
        let mut transport = ScriptedTransport::new()
            .failing_submissions([3])
            .completions_per_poll(1);
        let probe = transport.probe();
        let sink = CollectingSink::default();
        let mut run = new_run(&shared, &mut transport, &config, &sink);

        assert_eq!(run.prime(), 3);
        assert!(shared.request_stop());
        assert_eq!(shared.state(), RunState::Stopping);

        let mut previous = shared.in_flight();
        for _ in 0..3 {
            assert_eq!(run.pump(Duration::ZERO), 1);
            let now = shared.in_flight();
            assert!(now < previous);
            previous = now;
            // Not idle until everything has drained
            assert_eq!(shared.state(), RunState::Stopping);
        }

        assert_eq!(shared.in_flight(), 0);
        assert_eq!(probe.submissions(), 3);
        assert_eq!(shared.stats().success_count, 3);

        run.drain();
        let summary = run.finish().unwrap();
        assert_eq!(summary.success_count, 3);
        assert_eq!(summary.total_bytes, 3 * 16 * 512);
        assert_eq!(probe.released(), 4);
    }

    #[test]
    fn test_refused_resubmission_leaves_slot_idle() {
        let shared = EngineShared::default();
        let config = bulk_config();
        // Attempt 4 is the resubmission of slot 0 after its first completion
        let mut transport = ScriptedTransport::new()
            .failing_attempts([4])
            .completions_per_poll(1);
        let probe = transport.probe();
        let sink = CollectingSink::default();
        let mut run = new_run(&shared, &mut transport, &config, &sink);
        assert_eq!(run.prime(), 4);

        assert_eq!(run.pump(Duration::ZERO), 1);
        assert_eq!(shared.in_flight(), 3);
        assert!(!run.pool.slots()[0].is_in_flight());
        assert_eq!(probe.rejected(), 1);

        // The run carries on with the remaining slots
        for _ in 0..9 {
            assert_eq!(run.pump(Duration::ZERO), 1);
            assert_eq!(shared.in_flight(), 3);
            assert!(!run.pool.slots()[0].is_in_flight());
        }

        let stats = shared.stats();
        assert_eq!(stats.success_count, 10);
        assert_eq!(
            stats.success_count + stats.failure_count,
            probe.completions() as u64
        );
        assert_eq!(probe.rejected(), 1);
        assert_eq!(probe.outstanding(), 3);

        assert!(shared.request_stop());
        run.drain();
        let summary = run.finish().unwrap();
        assert_eq!(summary.success_count, 13);
        assert_eq!(probe.submissions(), 13);
    }

    #[test]
    fn test_unknown_or_idle_slot_completion_ignored() {
        let shared = EngineShared::default();
        let config = bulk_config();
        let mut transport = ScriptedTransport::new();
        let sink = CollectingSink::default();
        let mut run = new_run(&shared, &mut transport, &config, &sink);

        run.handle_completion(Completion::success(0, 8192));
        run.handle_completion(Completion::success(99, 8192));

        let stats = shared.stats();
        assert_eq!(stats.success_count, 0);
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.in_flight, 0);
    }

    #[test]
    fn test_run_duration_bound() {
        let engine = Engine::new();
        let mut transport = ScriptedTransport::new();
        let config = bulk_config();

        let summary = engine
            .run(
                &mut transport,
                &config,
                RunMode::For(Duration::from_millis(50)),
                &NullSink,
            )
            .unwrap();

        assert!(summary.success_count > 0);
        assert_eq!(summary.failure_count, 0);
        assert_eq!(summary.total_bytes, summary.success_count * 16 * 512);
        assert_eq!(engine.state(), RunState::Idle);
        assert_eq!(engine.stats().in_flight, 0);
    }

    #[test]
    fn test_run_rejects_invalid_config_without_claiming() {
        let engine = Engine::new();
        let mut transport = ScriptedTransport::new();
        let probe = transport.probe();
        let config = EngineConfig::new(0x80, TransferKind::Bulk, 512);

        let result = engine.run(&mut transport, &config, RunMode::UntilStopped, &NullSink);
        assert!(matches!(result, Err(EngineError::InvalidEndpoint(0x80))));
        assert_eq!(engine.state(), RunState::Idle);
        assert_eq!(probe.allocations(), 0);
    }

    #[test]
    fn test_allocation_failure_returns_to_idle() {
        let engine = Engine::new();
        let mut transport = ScriptedTransport::new().failing_allocation_at(2);
        let probe = transport.probe();
        let config = bulk_config();

        let result = engine.run(&mut transport, &config, RunMode::UntilStopped, &NullSink);
        assert!(matches!(result, Err(EngineError::OutOfMemory { slot: 2, .. })));
        assert_eq!(engine.state(), RunState::Idle);
        assert_eq!(probe.allocations(), 2);
        assert_eq!(probe.released(), 2);
        assert_eq!(probe.submissions(), 0);
    }

    #[test]
    fn test_request_stop_when_idle_is_noop() {
        let engine = Engine::new();
        engine.request_stop();
        engine.request_stop();
        assert_eq!(engine.state(), RunState::Idle);
        assert!(!engine.is_running());
    }
}
