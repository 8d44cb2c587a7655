// Composite pass rate measurement
use std::time::{Duration, Instant};

/// Summary of one reporting interval
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassReport {
    pub passes_per_second: f64,
    /// Surfaces skipped because their texture was not ready
    pub skipped: u32,
}

/// Counts composite passes and reports a rate once per interval
pub struct PassCounter {
    /// When the current interval started
    started: Instant,
    passes: u32,
    skipped: u32,
    interval: Duration,
}

impl PassCounter {
    pub fn new(interval: Duration) -> Self {
        Self {
            started: Instant::now(),
            passes: 0,
            skipped: 0,
            interval,
        }
    }

    /// Call after each composite pass.
    /// Returns a report when the interval elapsed.
    pub fn tick(&mut self, skipped: usize) -> Option<PassReport> {
        self.passes += 1;
        self.skipped += skipped as u32;

        let elapsed = self.started.elapsed();
        if elapsed < self.interval {
            return None;
        }

        let report = PassReport {
            passes_per_second: self.passes as f64 / elapsed.as_secs_f64(),
            skipped: self.skipped,
        };
        self.passes = 0;
        self.skipped = 0;
        self.started = Instant::now();
        Some(report)
    }
}

impl Default for PassCounter {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}
