//! Per-channel round-trip latency with z-score outlier rejection.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

pub const WINDOW_CAPACITY: usize = 100;
/// Samples needed before outlier rejection kicks in
pub const BOOTSTRAP_SAMPLES: usize = 3;
pub const MAX_Z_SCORE: f64 = 7.0;

/// Well-known channel names.
pub const CHANNEL_CONNECTION: &str = "Connection";
pub const CHANNEL_BLOCK_SYNC: &str = "BlockSync";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyReport {
    /// Published latency: window minimum during bootstrap, mean afterwards.
    pub latency_ms: f64,
    pub mean_ms: f64,
    pub std_dev_ms: f64,
    pub admitted: bool,
    pub samples: usize,
}

#[derive(Debug, Clone)]
pub struct LatencyChannel {
    name: String,
    window: VecDeque<f64>,
    mean: f64,
    std_dev: f64,
}

impl LatencyChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            window: VecDeque::with_capacity(WINDOW_CAPACITY),
            mean: 0.0,
            std_dev: 0.0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn samples(&self) -> impl Iterator<Item = f64> + '_ {
        self.window.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn std_dev(&self) -> f64 {
        self.std_dev
    }

    pub fn record(&mut self, elapsed: Duration) -> LatencyReport {
        let sample = elapsed.as_secs_f64() * 1000.0;

        if self.window.len() < BOOTSTRAP_SAMPLES {
            self.admit(sample);
            self.republish();
            let min = self.window.iter().copied().fold(f64::INFINITY, f64::min);
            return LatencyReport {
                latency_ms: min,
                mean_ms: self.mean,
                std_dev_ms: self.std_dev,
                admitted: true,
                samples: self.window.len(),
            };
        }

        // A perfectly flat window would make every other sample infinitely far
        // away; floor sigma at 1% of the mean.
        let sigma = self.std_dev.max(self.mean.abs() * 0.01).max(f64::EPSILON);
        let z = (sample - self.mean) / sigma;
        let admitted = z.abs() < MAX_Z_SCORE;
        if admitted {
            self.admit(sample);
        } else {
            tracing::debug!(
                "⏱️  [{}] rejected latency outlier {:.2}ms (z = {:.1})",
                self.name,
                sample,
                z
            );
        }
        self.republish();

        LatencyReport {
            latency_ms: self.mean,
            mean_ms: self.mean,
            std_dev_ms: self.std_dev,
            admitted,
            samples: self.window.len(),
        }
    }

    fn admit(&mut self, sample: f64) {
        if self.window.len() == WINDOW_CAPACITY {
            self.window.pop_front();
        }
        self.window.push_back(sample);
    }

    fn republish(&mut self) {
        let n = self.window.len() as f64;
        if n == 0.0 {
            self.mean = 0.0;
            self.std_dev = 0.0;
            return;
        }
        let mean = self.window.iter().sum::<f64>() / n;
        let variance = self.window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        self.mean = mean;
        self.std_dev = variance.sqrt();
    }
}

/// Independent channels owned by one connection.
#[derive(Debug, Default)]
pub struct LatencyTracker {
    channels: HashMap<String, LatencyChannel>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, channel: &str, start: Instant) -> LatencyReport {
        self.record_elapsed(channel, start.elapsed())
    }

    pub fn record_elapsed(&mut self, channel: &str, elapsed: Duration) -> LatencyReport {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| LatencyChannel::new(channel))
            .record(elapsed)
    }

    pub fn channel(&self, name: &str) -> Option<&LatencyChannel> {
        self.channels.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: f64) -> Duration {
        Duration::from_secs_f64(v / 1000.0)
    }

    #[test]
    fn test_bootstrap_reports_minimum() {
        let mut channel = LatencyChannel::new(CHANNEL_CONNECTION);
        assert_eq!(channel.record(ms(50.0)).latency_ms.round(), 50.0);
        assert_eq!(channel.record(ms(20.0)).latency_ms.round(), 20.0);
        let report = channel.record(ms(900.0));
        // Bootstrap admits anything
        assert!(report.admitted);
        assert_eq!(report.latency_ms.round(), 20.0);
        assert_eq!(channel.len(), 3);
    }

    #[test]
    fn test_outlier_leaves_window_unchanged() {
        let mut channel = LatencyChannel::new(CHANNEL_CONNECTION);
        for v in [10.0, 10.2, 9.8, 10.1, 9.9, 10.0] {
            assert!(channel.record(ms(v)).admitted);
        }
        let before: Vec<f64> = channel.samples().collect();
        let (mean, std_dev) = (channel.mean(), channel.std_dev());

        let report = channel.record(ms(10.0 + 50.0 * std_dev.max(0.1)));
        assert!(!report.admitted);

        let after: Vec<f64> = channel.samples().collect();
        assert_eq!(before, after);
        assert!((report.mean_ms - mean).abs() < 1e-9);
        assert!((report.std_dev_ms - std_dev).abs() < 1e-9);
    }

    #[test]
    fn test_inlier_is_admitted() {
        let mut channel = LatencyChannel::new(CHANNEL_BLOCK_SYNC);
        for v in [100.0, 110.0, 90.0, 105.0] {
            channel.record(ms(v));
        }
        assert!(channel.record(ms(115.0)).admitted);
        assert_eq!(channel.len(), 5);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut channel = LatencyChannel::new(CHANNEL_CONNECTION);
        for i in 0..250 {
            channel.record(ms(10.0 + (i % 3) as f64));
        }
        assert_eq!(channel.len(), WINDOW_CAPACITY);
    }

    #[test]
    fn test_channels_are_independent() {
        let mut tracker = LatencyTracker::new();
        tracker.record_elapsed(CHANNEL_CONNECTION, ms(5.0));
        tracker.record_elapsed(CHANNEL_BLOCK_SYNC, ms(500.0));
        assert_eq!(tracker.channel(CHANNEL_CONNECTION).unwrap().len(), 1);
        assert_eq!(tracker.channel(CHANNEL_BLOCK_SYNC).unwrap().len(), 1);
        assert!(tracker.channel("Unknown").is_none());
    }
}
