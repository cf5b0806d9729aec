//! Exponential backoff schedule

use rand::Rng;
use std::time::Duration;

/// Produces successive delays `initial, initial * m, initial * m^2, ...`
/// capped at `max`. With jitter enabled every delay is scaled by a random
/// factor in `[0.7, 1.3)` (still capped at `max`).
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: bool,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: bool) -> Self {
        let multiplier = if multiplier < 1.0 { 1.0 } else { multiplier };
        Self {
            initial,
            max,
            multiplier,
            jitter,
            current: initial.min(max),
        }
    }

    /// Delay to wait before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;

        let grown = (self.current.as_millis() as f64 * self.multiplier)
            .min(self.max.as_millis() as f64);
        self.current = Duration::from_millis(grown as u64);

        if self.jitter {
            apply_jitter(base).min(self.max)
        } else {
            base
        }
    }

    /// Start over from the initial delay (after a successful attempt).
    pub fn reset(&mut self) {
        self.current = self.initial.min(self.max);
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_delay())
    }
}

fn apply_jitter(base: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let factor = 1.0 + rng.gen_range(-0.3..0.3);
    Duration::from_millis((base.as_millis() as f64 * factor) as u64)
}
