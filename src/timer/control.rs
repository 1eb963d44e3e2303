//! Adaptive interval control.
//!
//! Overruns back the period off multiplicatively and add a penalty to the wait
//! multiplier. While the multiplier is positive the period creeps back toward
//! the target one step at a time; once it reaches zero the approach becomes
//! multiplicative again.

use std::time::Duration;

use schedtools_config::AdaptiveConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    /// The batch overran its period.
    BackedOff,
    /// Linear step toward the target while the wait multiplier decays.
    Stepped,
    /// Multiplicative approach toward the target.
    Decayed,
    /// Interval was below target and jumped straight to it.
    Snapped,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct IntervalController {
    interval_ms: u64,
    target_ms: u64,
    wait_multiplier: u32,
    config: AdaptiveConfig,
}

impl IntervalController {
    pub fn new(interval: Duration, target: Duration, config: AdaptiveConfig) -> Self {
        Self {
            interval_ms: millis(interval),
            target_ms: millis(target),
            wait_multiplier: 0,
            config,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn target(&self) -> Duration {
        Duration::from_millis(self.target_ms)
    }

    pub fn wait_multiplier(&self) -> u32 {
        self.wait_multiplier
    }

    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval_ms = millis(interval);
    }

    pub fn set_target(&mut self, target: Duration) {
        self.target_ms = millis(target);
    }

    /// Feeds one batch execution time into the controller.
    pub fn observe(&mut self, execution: Duration) -> Adjustment {
        let interval = self.interval_ms;
        let target = self.target_ms;

        if execution > self.interval() {
            // Tolerance keeps float noise (e.g. 20 * 1.05) from rounding up a whole ms.
            let scaled = (interval as f64 * self.config.backoff_factor - 1e-9).ceil() as u64;
            let mut next = scaled.max(interval + 1);
            if let Some(cap) = self.config.max_interval_ms {
                next = next.min(cap.max(target).max(1));
            }
            self.interval_ms = next;
            self.wait_multiplier = self
                .wait_multiplier
                .saturating_add(self.config.overrun_penalty);
            return Adjustment::BackedOff;
        }

        if interval > target {
            if self.wait_multiplier > 0 {
                self.wait_multiplier -= 1;
                self.interval_ms = interval.saturating_sub(self.config.step_ms).max(target);
                Adjustment::Stepped
            } else {
                let scaled = (interval as f64 * self.config.decay_factor) as u64;
                self.interval_ms = scaled.max(target).max(1);
                Adjustment::Decayed
            }
        } else if interval < target {
            self.interval_ms = target;
            Adjustment::Snapped
        } else {
            Adjustment::Unchanged
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}
