//! Throughput aggregation over windows of completions
//!
//! A window spans exactly `queue_depth` completions. When it closes, the
//! bytes it accumulated and the time it took are turned into a rate and the
//! window starts over. Windows are disjoint; nothing is smoothed across them.

use std::time::Instant;

/// Convert a byte count over `elapsed_us` microseconds into KB/s
///
/// A window can close within the same clock tick it started in, so a zero
/// interval yields a rate of 0 rather than a division by zero.
pub fn rate_kbps(bytes: u64, elapsed_us: u64) -> f64 {
    if elapsed_us == 0 {
        return 0.0;
    }
    (bytes as f64 / 1024.0) / (elapsed_us as f64 / 1_000_000.0)
}

/// Measurement captured when a window closes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub elapsed_us: u64,
    pub bytes: u64,
}

impl WindowSnapshot {
    pub fn rate_kbps(&self) -> f64 {
        rate_kbps(self.bytes, self.elapsed_us)
    }
}

/// The currently open window
#[derive(Debug)]
pub struct ThroughputWindow {
    depth: usize,
    completions: usize,
    bytes: u64,
    started: Instant,
}

impl ThroughputWindow {
    pub fn new(depth: usize, now: Instant) -> Self {
        Self {
            depth: depth.max(1),
            completions: 0,
            bytes: 0,
            started: now,
        }
    }

    /// Discard the open window and start a new one at `now`
    pub fn restart(&mut self, now: Instant) {
        self.completions = 0;
        self.bytes = 0;
        self.started = now;
    }

    /// Account one completion that moved `bytes`
    ///
    /// Returns the snapshot of the window if this completion closed it.
    pub fn record(&mut self, bytes: u64, now: Instant) -> Option<WindowSnapshot> {
        self.bytes += bytes;
        self.completions += 1;

        if self.completions < self.depth {
            return None;
        }

        let snapshot = WindowSnapshot {
            elapsed_us: now.saturating_duration_since(self.started).as_micros() as u64,
            bytes: self.bytes,
        };
        self.restart(now);
        Some(snapshot)
    }

    /// Bytes accumulated in the open window
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Completions counted in the open window
    pub fn completions(&self) -> usize {
        self.completions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_rate_kbps() {
        assert_eq!(rate_kbps(1024 * 1000, 1_000_000), 1000.0);
        assert_eq!(rate_kbps(32768, 500_000), 64.0);
    }

    #[test]
    fn test_rate_zero_elapsed() {
        assert_eq!(rate_kbps(32768, 0), 0.0);
        assert_eq!(rate_kbps(0, 0), 0.0);
    }

    #[test]
    fn test_window_closes_at_depth() {
        let start = Instant::now();
        let mut window = ThroughputWindow::new(4, start);

        for i in 1..4 {
            assert!(window.record(8192, start).is_none());
            assert_eq!(window.completions(), i);
        }
        assert_eq!(window.bytes(), 3 * 8192);

        let end = start + Duration::from_millis(250);
        let snapshot = window.record(8192, end).expect("window should close");
        assert_eq!(snapshot.bytes, 32768);
        assert_eq!(snapshot.elapsed_us, 250_000);
        assert_eq!(snapshot.rate_kbps(), 128.0);

        assert_eq!(window.completions(), 0);
        assert_eq!(window.bytes(), 0);
    }

    #[test]
    fn test_windows_are_disjoint() {
        let start = Instant::now();
        let mut window = ThroughputWindow::new(2, start);

        window.record(100, start);
        let first = window
            .record(100, start + Duration::from_millis(10))
            .unwrap();
        window.record(50, start + Duration::from_millis(10));
        let second = window
            .record(50, start + Duration::from_millis(30))
            .unwrap();

        assert_eq!(first.bytes, 200);
        assert_eq!(first.elapsed_us, 10_000);
        assert_eq!(second.bytes, 100);
        assert_eq!(second.elapsed_us, 20_000);
    }

    #[test]
    fn test_window_closing_in_same_tick_reports_zero() {
        let now = Instant::now();
        let mut window = ThroughputWindow::new(1, now);
        let snapshot = window.record(4096, now).unwrap();
        assert_eq!(snapshot.elapsed_us, 0);
        assert_eq!(snapshot.rate_kbps(), 0.0);
    }
}
