//! Timers
//!
//! Timing utilities used to profile paging stages.

use std::time::{Duration, Instant};

/// Timer that emits a tracing event when dropped
pub struct ScopedTimer<'a> {
    name: &'a str,
    start: Instant,
}

impl<'a> ScopedTimer<'a> {
    /// Start timing `name`
    pub fn traced(name: &'a str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }

    /// Elapsed time so far
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        tracing::debug!(
            target: "timing",
            name = self.name,
            duration_us = self.start.elapsed().as_micros() as u64,
            "Timer completed"
        );
    }
}

/// Rolling window of duration samples
#[derive(Debug, Clone)]
pub struct RollingTimer {
    samples: Vec<Duration>,
    index: usize,
    count: usize,
}

impl RollingTimer {
    /// Create a rolling timer keeping the last `window` samples
    pub fn new(window: usize) -> Self {
        Self {
            samples: vec![Duration::ZERO; window.max(1)],
            index: 0,
            count: 0,
        }
    }

    /// Record a sample
    pub fn record(&mut self, sample: Duration) {
        self.samples[self.index] = sample;
        self.index = (self.index + 1) % self.samples.len();
        self.count = (self.count + 1).min(self.samples.len());
    }

    fn window(&self) -> &[Duration] {
        &self.samples[..self.count]
    }

    /// Average of the recorded samples
    pub fn average(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        self.window().iter().sum::<Duration>() / self.count as u32
    }

    /// Smallest recorded sample
    pub fn min(&self) -> Duration {
        self.window().iter().copied().min().unwrap_or_default()
    }

    /// Largest recorded sample
    pub fn max(&self) -> Duration {
        self.window().iter().copied().max().unwrap_or_default()
    }

    /// Number of recorded samples
    pub fn count(&self) -> usize {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolling_timer_window() {
        let mut timer = RollingTimer::new(2);
        timer.record(Duration::from_millis(10));
        timer.record(Duration::from_millis(20));
        timer.record(Duration::from_millis(30));

        assert_eq!(timer.count(), 2);
        assert_eq!(timer.min(), Duration::from_millis(20));
        assert_eq!(timer.max(), Duration::from_millis(30));
        assert_eq!(timer.average(), Duration::from_millis(25));
    }

    #[test]
    fn test_rolling_timer_empty() {
        let mut timer = RollingTimer::new(4);
        assert_eq!(timer.average(), Duration::ZERO);
        assert_eq!(timer.max(), Duration::ZERO);
        timer.record(Duration::from_millis(5));
        assert_eq!(timer.count(), 1);
        assert_eq!(timer.min(), Duration::from_millis(5));
    }

    #[test]
    fn test_scoped_timer_elapsed() {
        let timer = ScopedTimer::traced("stage");
        std::thread::sleep(Duration::from_millis(1));
        assert!(timer.elapsed() >= Duration::from_millis(1));
    }
}
