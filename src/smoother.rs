//! Clock smoothing for the capture direction.
//!
//! Packet arrival times jitter; the stream position they imply does not
//! advance linearly. The smoother pairs each arrival timestamp with the
//! byte-derived stream position and maintains a drift-corrected estimate
//! of position as a function of time, so latency queries between packets
//! stay monotonic.

use std::time::Duration;

/// Exponential weight applied to each new rate observation.
const RATE_ALPHA: f64 = 0.1;
/// Accepted rate band around nominal (rejects wild outliers from
/// scheduling hiccups).
const MIN_RATE: f64 = 0.5;
const MAX_RATE: f64 = 2.0;

/// Drift-tracking map from monotonic time to stream position.
#[derive(Debug)]
pub struct Smoother {
    /// Last observation: (time, position), in seconds.
    last: Option<(f64, f64)>,
    /// Smoothed position advance per wall second.
    rate: f64,
    paused: bool,
}

impl Smoother {
    pub fn new() -> Self {
        Self {
            last: None,
            rate: 1.0,
            paused: true,
        }
    }

    /// Record that at time `when` the stream had consumed `position`
    /// worth of audio.
    pub fn put(&mut self, when: Duration, position: Duration) {
        let x = when.as_secs_f64();
        let y = position.as_secs_f64();

        if let Some((px, py)) = self.last {
            let dx = x - px;
            if dx > 0.0 {
                let observed = (y - py) / dx;
                if (MIN_RATE..=MAX_RATE).contains(&observed) {
                    self.rate += RATE_ALPHA * (observed - self.rate);
                }
            }
        }
        self.last = Some((x, y));
    }

    /// Resume estimation after a gap (stream setup or unpause). Estimates
    /// before the next `put` extrapolate from the resume point.
    pub fn resume(&mut self, when: Duration) {
        if self.paused {
            self.paused = false;
            if self.last.is_none() {
                self.last = Some((when.as_secs_f64(), 0.0));
            }
        }
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Estimated stream position at time `when`.
    pub fn get(&self, when: Duration) -> Duration {
        let Some((px, py)) = self.last else {
            return Duration::ZERO;
        };
        if self.paused {
            return Duration::from_secs_f64(py.max(0.0));
        }
        let dx = when.as_secs_f64() - px;
        let estimate = py + self.rate * dx.max(0.0);
        Duration::from_secs_f64(estimate.max(0.0))
    }
}

impl Default for Smoother {
    fn default() -> Self {
        Self::new()
    }
}
