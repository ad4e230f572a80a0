//! Exponential moving average for round-trip times
//!
//! The pool ranks servers by a Brown simple moving average over observed
//! round-trip times: `value <- (value * (N - 1) + sample) / N` with
//! `N = 10`. A fresh average holds a negative sentinel until the first
//! sample or an explicit seed, and every consumer must tolerate that
//! sentinel when comparing values.

/// Smoothing window of the round-trip average
pub const RTT_EWMA_DECAY: f64 = 10.0;

/// Sentinel meaning "no measurement yet"
const NO_VALUE: f64 = -1.0;

/// Brown simple moving average with a "no value yet" sentinel
#[derive(Debug, Clone, Copy)]
pub struct MovingAverage {
    value: f64,
    decay: f64,
}

impl MovingAverage {
    /// Create an empty average with the given smoothing window
    pub fn new(decay: f64) -> Self {
        Self {
            value: NO_VALUE,
            decay,
        }
    }

    /// Feed one sample into the average
    ///
    /// The first sample becomes the value as-is; later samples are
    /// blended with weight `1/decay`.
    pub fn add(&mut self, sample: f64) {
        if self.value < 0.0 {
            self.value = sample;
        } else {
            self.value = (self.value * (self.decay - 1.0) + sample) / self.decay;
        }
    }

    /// Overwrite the average, bypassing smoothing
    pub fn set(&mut self, value: f64) {
        self.value = value;
    }

    /// Current value; negative until the first sample or seed
    pub fn value(&self) -> f64 {
        self.value
    }
}

impl Default for MovingAverage {
    fn default() -> Self {
        Self::new(RTT_EWMA_DECAY)
    }
}
