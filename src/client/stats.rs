//! Windowed round-trip latency aggregation.
//!
//! Each worker owns one `LatencyStats`. Only iterations whose 0-based index
//! falls inside the window contribute, which drops the warm-up requests at
//! the start of a run and the cool-down requests at its end.

use std::fmt;
use std::time::Duration;

/// Span of the run (in ms) discarded as warm-up.
const WARMUP_MS: u64 = 10_000;

/// End of the measured span (in ms); later iterations are cool-down.
const COOL_DOWN_MS: u64 = 50_000;

/// Inclusive range of iteration indices that are measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsWindow {
    warmup: u64,
    cool_down: u64,
}

impl StatsWindow {
    pub fn new(warmup: u64, cool_down: u64) -> Self {
        Self { warmup, cool_down }
    }

    /// Window for a run pacing one request every `delay_ms`.
    pub fn for_delay(delay_ms: u64) -> Self {
        let delay_ms = delay_ms.max(1);
        Self::new(WARMUP_MS / delay_ms, COOL_DOWN_MS / delay_ms)
    }

    pub fn warmup(&self) -> u64 {
        self.warmup
    }

    pub fn cool_down(&self) -> u64 {
        self.cool_down
    }

    pub fn contains(&self, index: u64) -> bool {
        index >= self.warmup && index <= self.cool_down
    }

    /// Divisor used for the average. This is the window width, not the
    /// number of samples actually recorded.
    pub fn denominator(&self) -> u64 {
        (self.cool_down + 1).saturating_sub(self.warmup).max(1)
    }
}

/// Running min/max/sum over the windowed samples.
#[derive(Debug, Clone)]
pub struct LatencyStats {
    window: StatsWindow,
    min_ms: f64,
    max_ms: f64,
    sum_ms: f64,
    sample_count: u64,
}

impl LatencyStats {
    pub fn new(window: StatsWindow) -> Self {
        Self {
            window,
            min_ms: f64::INFINITY,
            max_ms: f64::NEG_INFINITY,
            sum_ms: 0.0,
            sample_count: 0,
        }
    }

    pub fn window(&self) -> StatsWindow {
        self.window
    }

    /// Record the round trip of iteration `index`.
    ///
    /// Returns `false` when the index lies outside the window and the sample
    /// was dropped.
    pub fn record(&mut self, index: u64, elapsed: Duration) -> bool {
        if !self.window.contains(index) {
            return false;
        }
        let ms = elapsed.as_nanos() as f64 / 1_000_000.0;
        self.sum_ms += ms;
        self.min_ms = self.min_ms.min(ms);
        self.max_ms = self.max_ms.max(ms);
        self.sample_count += 1;
        true
    }

    #[cfg(test)]
    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    /// Finalize the average over the fixed window width.
    pub fn finish(&self) -> LatencySummary {
        LatencySummary {
            min_ms: self.min_ms,
            max_ms: self.max_ms,
            avg_ms: self.sum_ms / self.window.denominator() as f64,
            samples: self.sample_count,
        }
    }
}

/// Per-worker result reported once the measured loop ends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySummary {
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub samples: u64,
}

impl fmt::Display for LatencySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.3} \t {:.3} \t {:.3}",
            self.max_ms, self.min_ms, self.avg_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_window_for_delay() {
        assert_eq!(StatsWindow::for_delay(1000), StatsWindow::new(10, 50));
        assert_eq!(StatsWindow::for_delay(1), StatsWindow::new(10_000, 50_000));
        assert_eq!(StatsWindow::for_delay(300), StatsWindow::new(33, 166));
        // Slower than the warm-up span: only iteration 0 is measured.
        assert_eq!(StatsWindow::for_delay(60_000), StatsWindow::new(0, 0));
        assert_eq!(StatsWindow::for_delay(60_000).denominator(), 1);
    }

    #[test]
    fn test_window_bounds_inclusive() {
        let window = StatsWindow::new(10, 50);
        assert!(!window.contains(9));
        assert!(window.contains(10));
        assert!(window.contains(50));
        assert!(!window.contains(51));
        assert_eq!(window.denominator(), 41);
    }

    #[test]
    fn test_empty_stats() {
        let stats = LatencyStats::new(StatsWindow::new(0, 3));
        let summary = stats.finish();
        assert_eq!(summary.samples, 0);
        assert_eq!(summary.min_ms, f64::INFINITY);
        assert_eq!(summary.max_ms, f64::NEG_INFINITY);
        assert_eq!(summary.avg_ms, 0.0);
    }

    #[test]
    fn test_windowed_min_max_avg() {
        let mut stats = LatencyStats::new(StatsWindow::new(2, 5));
        let samples = [900, 1, 7, 3, 12, 5, 0, 400];

        for (i, &t) in samples.iter().enumerate() {
            stats.record(i as u64, ms(t));
        }

        // Only indices 2..=5 -> [7, 3, 12, 5]
        let summary = stats.finish();
        assert_eq!(summary.samples, 4);
        assert_eq!(summary.min_ms, 3.0);
        assert_eq!(summary.max_ms, 12.0);
        assert_eq!(summary.avg_ms, 27.0 / 4.0);
    }

    #[test]
    fn test_average_uses_window_width() {
        // The loop stopped after index 3, so only two samples landed in a
        // four-wide window; the divisor stays at four.
        let mut stats = LatencyStats::new(StatsWindow::new(2, 5));
        for i in 0..4 {
            stats.record(i, ms(10));
        }
        let summary = stats.finish();
        assert_eq!(summary.samples, 2);
        assert_eq!(summary.avg_ms, 20.0 / 4.0);
    }

    #[test]
    fn test_record_reports_membership() {
        let mut stats = LatencyStats::new(StatsWindow::new(1, 1));
        assert!(!stats.record(0, ms(1)));
        assert!(stats.record(1, ms(1)));
        assert!(!stats.record(2, ms(1)));
        assert_eq!(stats.sample_count(), 1);
    }

    #[test]
    fn test_sub_millisecond_resolution() {
        let mut stats = LatencyStats::new(StatsWindow::new(0, 0));
        stats.record(0, Duration::from_micros(1500));
        assert_eq!(stats.finish().min_ms, 1.5);
    }
}
