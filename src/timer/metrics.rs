use std::time::{Duration, Instant};

/// Number of samples the rolling execution-time average spans.
pub const AVERAGE_WINDOW: u32 = 20;

const RATE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct TimerMetrics {
    pub average_execution: Duration,
    pub last_execution: Option<Duration>,
    /// Fires per second over the last completed one-second window.
    pub measured_rate: f64,
    pub total_fires: u64,
}

#[derive(Debug)]
pub(crate) struct MetricsRecorder {
    average_ms: f64,
    last_execution: Option<Duration>,
    measured_rate: f64,
    total_fires: u64,
    window_fires: u32,
    window_start: Instant,
}

impl MetricsRecorder {
    pub(crate) fn new() -> Self {
        Self {
            average_ms: 0.0,
            last_execution: None,
            measured_rate: 0.0,
            total_fires: 0,
            window_fires: 0,
            window_start: Instant::now(),
        }
    }

    pub(crate) fn record(&mut self, execution: Duration) {
        self.record_at(execution, Instant::now());
    }

    fn record_at(&mut self, execution: Duration, now: Instant) {
        let sample = execution.as_secs_f64() * 1000.0;
        let window = f64::from(AVERAGE_WINDOW);
        self.average_ms = if self.total_fires == 0 {
            sample
        } else {
            (self.average_ms * (window - 1.0) + sample) / window
        };
        self.last_execution = Some(execution);
        self.total_fires += 1;
        self.window_fires += 1;

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= RATE_WINDOW {
            self.measured_rate = f64::from(self.window_fires) / elapsed.as_secs_f64();
            self.window_fires = 0;
            self.window_start = now;
        }
    }

    /// Restarts the rate window, e.g. after a pause.
    pub(crate) fn resync(&mut self) {
        self.window_fires = 0;
        self.window_start = Instant::now();
    }

    pub(crate) fn snapshot(&self) -> TimerMetrics {
        TimerMetrics {
            average_execution: Duration::from_secs_f64(self.average_ms.max(0.0) / 1000.0),
            last_execution: self.last_execution,
            measured_rate: self.measured_rate,
            total_fires: self.total_fires,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_average() {
        let mut recorder = MetricsRecorder::new();
        recorder.record(Duration::from_millis(40));
        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.average_execution, Duration::from_millis(40));
        assert_eq!(snapshot.total_fires, 1);
    }

    #[test]
    fn average_moves_by_one_twentieth() {
        let mut recorder = MetricsRecorder::new();
        recorder.record(Duration::from_millis(100));
        recorder.record(Duration::from_millis(300));
        // (100 * 19 + 300) / 20
        let average = recorder.snapshot().average_execution.as_secs_f64() * 1000.0;
        assert!((average - 110.0).abs() < 1e-6);
    }

    #[test]
    fn rate_is_resynchronised_each_second() {
        let mut recorder = MetricsRecorder::new();
        let start = recorder.window_start;
        for i in 1..=9 {
            recorder.record_at(Duration::ZERO, start + Duration::from_millis(i * 100));
        }
        assert_eq!(recorder.snapshot().measured_rate, 0.0);

        recorder.record_at(Duration::ZERO, start + Duration::from_millis(1000));
        assert!((recorder.snapshot().measured_rate - 10.0).abs() < 1e-9);
        assert_eq!(recorder.window_fires, 0);
    }
}
