//! Append-only signal history.

use super::types::Signal;

/// Time-ordered log of the samples a port produced, one per iteration.
///
/// Entries are only ever appended by the simulator; [`SignalHistory::pop`]
/// exists for rewinding a speculative step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalHistory {
    samples: Vec<Signal>,
}

impl SignalHistory {
    /// Create an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample.
    pub fn push(&mut self, signal: Signal) {
        self.samples.push(signal);
    }

    /// Remove and return the newest sample.
    pub fn pop(&mut self) -> Option<Signal> {
        self.samples.pop()
    }

    /// The newest sample.
    pub fn last(&self) -> Option<&Signal> {
        self.samples.last()
    }

    /// The sample recorded at `iteration`.
    pub fn get(&self, iteration: usize) -> Option<&Signal> {
        self.samples.get(iteration)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Drop every sample.
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Signal> {
        self.samples.iter()
    }

    /// All recorded values in iteration order.
    pub fn values(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.value).collect()
    }

    /// All recorded times in iteration order.
    pub fn times(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.time).collect()
    }

    /// The history as two parallel sequences `(times, values)`, the shape
    /// plotting layers poll.
    pub fn data_xy(&self) -> (Vec<f64>, Vec<f64>) {
        self.samples.iter().map(|s| (s.time, s.value)).unzip()
    }

    pub fn as_slice(&self) -> &[Signal] {
        &self.samples
    }
}
