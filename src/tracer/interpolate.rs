//! Resampling of raw samples at a fixed communication interval.

/// How values between two raw samples are reconstructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interpolation {
    /// Straight line between the samples.
    #[default]
    Linear,
    /// The older sample until the newer one is reached.
    Hold,
}

impl Interpolation {
    /// Value at `x` between `(x0, y0)` and `(x1, y1)`, clamped to the ends.
    pub fn apply(self, x0: f64, y0: f64, x1: f64, y1: f64, x: f64) -> f64 {
        if x <= x0 {
            return y0;
        }
        if x1 <= x {
            return y1;
        }
        match self {
            Interpolation::Linear => (y1 - y0) / (x1 - x0) * (x - x0) + y0,
            Interpolation::Hold => y0,
        }
    }
}

/// Turns raw samples at arbitrary times into rows at `start`,
/// `start + interval`, `start + 2 * interval`, ...
#[derive(Debug, Clone)]
pub struct Interpolator {
    interval: f64,
    method: Interpolation,
    /// Time of the last emitted row.
    last_time: f64,
    /// Decimal digits kept when advancing `last_time`.
    precision: i32,
    previous: Option<(f64, Vec<f64>)>,
}

impl Interpolator {
    pub fn new(interval: f64, method: Interpolation, start_time: f64) -> Self {
        Self {
            interval,
            method,
            last_time: start_time - interval,
            precision: precision_of(interval),
            previous: None,
        }
    }

    pub fn interval(&self) -> f64 {
        self.interval
    }

    /// Time of the next row to emit.
    pub fn next_time(&self) -> f64 {
        self.last_time + self.interval
    }

    /// Rows that became available with the raw sample `(time, values)`.
    pub fn feed(&mut self, time: f64, values: &[f64]) -> Vec<(f64, Vec<f64>)> {
        let (t0, v0) = match &self.previous {
            Some((t, v)) => (*t, v.clone()),
            None => (time, values.to_vec()),
        };
        let passed = ((time - self.last_time) / self.interval).floor();
        let mut rows = Vec::new();
        for _ in 0..passed.max(0.0) as usize {
            let x = self.next_time();
            if x <= time {
                let row = v0
                    .iter()
                    .zip(values)
                    .map(|(y0, y1)| self.method.apply(t0, *y0, time, *y1, x))
                    .collect();
                rows.push((x, row));
            }
            self.last_time = round_to(self.last_time + self.interval, self.precision);
        }
        self.previous = Some((time, values.to_vec()));
        rows
    }
}

/// Decimal digits of `interval`, rounded up to a multiple of 3 and capped
/// at 15.
fn precision_of(interval: f64) -> i32 {
    let text = interval.to_string();
    let digits = text
        .split_once('.')
        .map(|(_, fraction)| fraction.trim_end_matches('0').len())
        .unwrap_or(0) as i32;
    ((digits + 2) / 3 * 3).min(15)
}

fn round_to(value: f64, precision: i32) -> f64 {
    let scale = 10f64.powi(precision);
    (value * scale).round() / scale
}
