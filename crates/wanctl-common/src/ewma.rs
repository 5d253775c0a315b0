//! Exponentially-weighted moving average.

/// Small stateful EWMA: seeds on the first sample, then
/// `value = (1 - alpha) * value + alpha * sample`.
#[derive(Debug, Clone, Copy)]
pub struct Ewma {
    alpha: f64,
    value: Option<f64>,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Ewma { alpha, value: None }
    }

    /// Resume from a persisted value.
    pub fn with_value(alpha: f64, value: f64) -> Self {
        Ewma {
            alpha,
            value: Some(value),
        }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            Some(v) => (1.0 - self.alpha) * v + self.alpha * sample,
            None => sample,
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    pub fn set(&mut self, value: f64) {
        self.value = Some(value);
    }
}
