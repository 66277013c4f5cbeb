//! Transfer speed and ETA estimation.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

const DEFAULT_WINDOW: Duration = Duration::from_secs(5);
const DEFAULT_MAX_SAMPLES: usize = 100;
const LOG_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct Sample {
    received: u64,
    at: Instant,
}

/// Sliding-window speed estimate over the cumulative byte count of one
/// connection.
#[derive(Debug)]
pub struct SpeedCalculator {
    samples: VecDeque<Sample>,
    window: Duration,
    max_samples: usize,
    last_log: Option<Instant>,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_MAX_SAMPLES)
    }
}

impl SpeedCalculator {
    pub fn new(window: Duration, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
            max_samples: max_samples.max(2),
            last_log: None,
        }
    }

    /// Records the running total at the current instant.
    pub fn record(&mut self, received: u64) {
        let now = Instant::now();
        self.samples.push_back(Sample { received, at: now });

        // Keep one sample older than the window as the baseline.
        while self.samples.len() > 2
            && self
                .samples
                .get(1)
                .is_some_and(|s| now.duration_since(s.at) >= self.window)
        {
            self.samples.pop_front();
        }
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    /// Average speed in bytes/second across the window; 0 with fewer than
    /// two samples.
    pub fn bytes_per_second(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let elapsed = last.at.duration_since(first.at);
        if elapsed.is_zero() {
            return 0.0;
        }
        last.received.saturating_sub(first.received) as f64 / elapsed.as_secs_f64()
    }

    /// Estimated time to receive `remaining` more bytes.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / speed))
    }

    /// True at most once per second; gates progress log lines.
    pub fn should_log(&mut self) -> bool {
        let now = Instant::now();
        match self.last_log {
            Some(at) if now.duration_since(at) < LOG_INTERVAL => false,
            _ => {
                self.last_log = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn speed_over_window() {
        let mut calc = SpeedCalculator::default();
        calc.record(0);
        assert_eq!(calc.bytes_per_second(), 0.0);

        tokio::time::advance(Duration::from_secs(1)).await;
        calc.record(1000);
        tokio::time::advance(Duration::from_secs(1)).await;
        calc.record(2000);

        let speed = calc.bytes_per_second();
        assert!((speed - 1000.0).abs() < 1.0, "speed = {speed}");
        let eta = calc.eta(5000).unwrap();
        assert!((eta.as_secs_f64() - 5.0).abs() < 0.01);
    }

    #[tokio::test(start_paused = true)]
    async fn old_samples_fall_out_of_window() {
        let mut calc = SpeedCalculator::new(Duration::from_secs(2), 100);
        calc.record(0);
        tokio::time::advance(Duration::from_secs(10)).await;
        calc.record(100);
        tokio::time::advance(Duration::from_secs(1)).await;
        calc.record(1100);
        tokio::time::advance(Duration::from_secs(1)).await;
        calc.record(2100);

        let speed = calc.bytes_per_second();
        assert!((speed - 1000.0).abs() < 1.0, "speed = {speed}");
    }

    #[test]
    fn no_eta_without_samples() {
        let calc = SpeedCalculator::default();
        assert!(calc.eta(100).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn log_gate_throttles() {
        let mut calc = SpeedCalculator::default();
        assert!(calc.should_log());
        assert!(!calc.should_log());
        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(calc.should_log());
    }
}
