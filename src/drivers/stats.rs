use std::sync::{PoisonError, RwLock};

use crate::types::{Channel, Sample};

/// Full-session statistics for one channel. Not windowed: ring buffer
/// eviction has no effect on these numbers.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RunningAverage {
    pub count: u64,
    pub mean: f64,
    /// Sum of squared deviations from the mean (Welford).
    m2: f64,
    pub min: f64,
    pub max: f64,
}

impl Default for RunningAverage {
    fn default() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl RunningAverage {
    pub fn update(&mut self, value: f64) {
        self.count += 1;
        // mean_n = mean_{n-1} + (x - mean_{n-1}) / n; no raw sum is kept.
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// `(count, mean)`; the mean is 0.0 until the first update.
    pub fn pair(&self) -> (u64, f64) {
        (self.count, self.mean)
    }

    /// Population variance, 0.0 for fewer than two values.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn range(&self) -> Option<(f64, f64)> {
        (self.count > 0).then_some((self.min, self.max))
    }
}

/// Per-channel running averages shared between the acquisition worker
/// (writer) and any number of readers.
pub struct RunningStats {
    channels: RwLock<[RunningAverage; Channel::COUNT]>,
}

impl Default for RunningStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RunningStats {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new([RunningAverage::default(); Channel::COUNT]),
        }
    }

    pub fn update(&self, channel: Channel, value: f64) {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        channels[channel.index()].update(value);
    }

    /// Updates all 13 channels of `sample` as one unit.
    pub fn update_sample(&self, sample: &Sample) {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        for (avg, value) in channels.iter_mut().zip(sample.values()) {
            avg.update(value);
        }
    }

    pub fn current(&self, channel: Channel) -> RunningAverage {
        self.channels.read().unwrap_or_else(PoisonError::into_inner)[channel.index()]
    }

    pub fn all(&self) -> [RunningAverage; Channel::COUNT] {
        *self.channels.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reset(&self) {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        *channels = [RunningAverage::default(); Channel::COUNT];
    }
}
