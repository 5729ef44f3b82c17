//! Crossing-time locators.
//!
//! Every locator works on values already shifted by the event level, so
//! the crossing is a root. `f(t)` re-evaluates the shifted signal at a time
//! inside the bracket; the simulator implements it by computing one
//! forced step and rewinding it.

use tracing::trace;

use super::{detect, Direction};
use crate::error::{CbdError, Result};

/// Signal evaluation at a time inside the bracket.
pub type Probe<'a> = dyn FnMut(f64) -> Result<f64> + 'a;

/// Estimates when a signal crossed zero between two samples.
///
/// Only called on brackets that contain a crossing in `direction`.
pub trait StateEventLocator {
    fn locate(&self, p1: (f64, f64), p2: (f64, f64), f: &mut Probe<'_>, direction: Direction) -> Result<f64>;
}

/// The start of the step: an under-estimate.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreCrossing;

impl StateEventLocator for PreCrossing {
    fn locate(&self, p1: (f64, f64), _p2: (f64, f64), _f: &mut Probe<'_>, _direction: Direction) -> Result<f64> {
        Ok(p1.0)
    }
}

/// The end of the step: an over-estimate.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostCrossing;

impl StateEventLocator for PostCrossing {
    fn locate(&self, _p1: (f64, f64), p2: (f64, f64), _f: &mut Probe<'_>, _direction: Direction) -> Result<f64> {
        Ok(p2.0)
    }
}

/// Straight line between the two samples.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearInterpolation;

impl StateEventLocator for LinearInterpolation {
    fn locate(&self, p1: (f64, f64), p2: (f64, f64), _f: &mut Probe<'_>, _direction: Direction) -> Result<f64> {
        let ((t1, y1), (t2, y2)) = (p1, p2);
        if y1 == y2 {
            return Ok(t1);
        }
        Ok((t2 - t1) / (y2 - y1) * -y1 + t1)
    }
}

/// Halves the bracket a fixed number of times.
#[derive(Debug, Clone, Copy)]
pub struct Bisection {
    pub iterations: usize,
}

impl Default for Bisection {
    fn default() -> Self {
        Self { iterations: 10 }
    }
}

impl Bisection {
    pub fn new(iterations: usize) -> Result<Self> {
        if iterations == 0 {
            return Err(CbdError::invalid_parameter("iterations", "bisection needs at least one iteration"));
        }
        Ok(Self { iterations })
    }
}

impl StateEventLocator for Bisection {
    fn locate(&self, mut p1: (f64, f64), mut p2: (f64, f64), f: &mut Probe<'_>, direction: Direction) -> Result<f64> {
        let mut tc = p1.0;
        for _ in 0..self.iterations {
            tc = (p2.0 - p1.0) / 2.0 + p1.0;
            let yc = f(tc)?;
            if detect(p1.1, yc, 0.0, direction) {
                p2 = (tc, yc);
            } else if detect(yc, p2.1, 0.0, direction) {
                p1 = (tc, yc);
            } else {
                break;
            }
        }
        Ok(tc)
    }
}

/// False position with the Illinois modification: an endpoint kept twice
/// in a row has its value halved.
#[derive(Debug, Clone, Copy)]
pub struct RegulaFalsi {
    /// Half of the relative error bound on the bracket.
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for RegulaFalsi {
    fn default() -> Self {
        Self {
            tolerance: 1e-5,
            max_iterations: 5_000_000,
        }
    }
}

impl StateEventLocator for RegulaFalsi {
    fn locate(&self, p1: (f64, f64), p2: (f64, f64), f: &mut Probe<'_>, direction: Direction) -> Result<f64> {
        let ((mut t1, mut y1), (mut t2, mut y2)) = (p1, p2);
        let mut tn = t1;
        // -1: the right end moved last, 1: the left end did.
        let mut side = 0;
        for iteration in 0..self.max_iterations {
            if (t1 - t2).abs() < self.tolerance * (t1 + t2).abs() {
                break;
            }
            tn = if (y1 - y2).abs() < self.tolerance {
                (t2 - t1) / 2.0 + t1
            } else {
                (y1 * t2 - y2 * t1) / (y1 - y2)
            };
            let yn = f(tn)?;
            trace!(iteration, t = tn, y = yn, "regula falsi");
            if yn == 0.0 {
                break;
            }
            if detect(y1, yn, 0.0, direction) {
                t2 = tn;
                y2 = yn;
                if side == -1 {
                    y1 /= 2.0;
                }
                side = -1;
            } else if detect(yn, y2, 0.0, direction) {
                t1 = tn;
                y1 = yn;
                if side == 1 {
                    y2 /= 2.0;
                }
                side = 1;
            } else {
                break;
            }
        }
        Ok(tn)
    }
}

/// Interpolate-Truncate-Project: bisection's worst case with better than
/// false position's average case.
#[derive(Debug, Clone, Copy)]
pub struct Itp {
    /// Bracket width at which the search stops (half of it, precisely).
    pub epsilon: f64,
    pub k1: f64,
    pub k2: f64,
    pub n0: f64,
}

impl Default for Itp {
    fn default() -> Self {
        Self {
            epsilon: 1e-5,
            k1: 0.1,
            k2: 1.5,
            n0: 0.0,
        }
    }
}

impl Itp {
    /// Requires `k1 > 0`, `1 <= k2 <= 1 + φ` and `n0 >= 0`.
    pub fn new(epsilon: f64, k1: f64, k2: f64, n0: f64) -> Result<Self> {
        let phi = (1.0 + 5f64.sqrt()) / 2.0;
        if !(epsilon > 0.0) {
            return Err(CbdError::invalid_parameter("epsilon", "must be strictly positive"));
        }
        if !(k1 > 0.0) {
            return Err(CbdError::invalid_parameter("k1", "must be strictly positive"));
        }
        if !(1.0..=1.0 + phi).contains(&k2) {
            return Err(CbdError::invalid_parameter("k2", "must be in [1, 1 + phi]"));
        }
        if !(n0 >= 0.0) {
            return Err(CbdError::invalid_parameter("n0", "must be positive or zero"));
        }
        Ok(Self { epsilon, k1, k2, n0 })
    }
}

impl StateEventLocator for Itp {
    fn locate(&self, p1: (f64, f64), p2: (f64, f64), f: &mut Probe<'_>, direction: Direction) -> Result<f64> {
        let ((mut a, mut ya), (mut b, mut yb)) = (p1, p2);
        if ya == 0.0 {
            return Ok(a);
        }
        if yb == 0.0 {
            return Ok(b);
        }
        let eps = self.epsilon;
        let n_half = ((b - a) / (2.0 * eps)).log2().ceil();
        let n_max = n_half + self.n0;
        let mut j = 0.0;
        while (b - a) > 2.0 * eps {
            // Interpolation
            let x_half = (b - a) / 2.0 + a;
            let radius = eps * 2f64.powf(n_max - j) - (b - a) / 2.0;
            let delta = self.k1 * (b - a).powf(self.k2);
            let x_f = if (yb - ya).abs() < eps {
                x_half
            } else {
                (yb * a - ya * b) / (yb - ya)
            };

            // Truncation
            let sigma = if x_half > x_f {
                1.0
            } else if x_half < x_f {
                -1.0
            } else {
                0.0
            };
            let x_t = if delta <= (x_half - x_f).abs() {
                x_f + sigma * delta
            } else {
                x_half
            };

            // Projection
            let x_itp = if (x_t - x_half).abs() <= radius {
                x_t
            } else {
                x_half - sigma * radius
            };

            let y_itp = f(x_itp)?;
            if (ya - yb) * y_itp < 0.0 && detect(ya, y_itp, 0.0, direction) {
                b = x_itp;
                yb = y_itp;
            } else if (ya - yb) * y_itp > 0.0 && detect(y_itp, yb, 0.0, direction) {
                a = x_itp;
                ya = y_itp;
            } else {
                a = x_itp;
                b = x_itp;
            }
            j += 1.0;
        }
        Ok((a + b) / 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::PI;

    /// `sin t cos 2t + 6` shifted by the level 6.
    fn shifted(t: f64) -> f64 {
        t.sin() * (2.0 * t).cos() + 6.0 - 6.0
    }

    fn point(t: f64) -> (f64, f64) {
        (t, shifted(t))
    }

    fn locate(locator: &dyn StateEventLocator, a: f64, b: f64, direction: Direction) -> f64 {
        let mut probe = |t: f64| -> Result<f64> {
            assert!((a..=b).contains(&t));
            Ok(shifted(t))
        };
        locator.locate(point(a), point(b), &mut probe, direction).unwrap()
    }

    const BRACKETS: [(f64, f64, Direction, f64); 2] = [
        (0.5, 1.2, Direction::FromAbove, PI / 4.0),
        (1.9, 2.6, Direction::FromBelow, 3.0 * PI / 4.0),
    ];

    #[test]
    fn test_root_finders_converge() {
        let bisection = Bisection::new(200).unwrap();
        let regula_falsi = RegulaFalsi::default();
        let itp = Itp::default();
        let locators: [&dyn StateEventLocator; 3] = [&bisection, &regula_falsi, &itp];
        for (a, b, direction, root) in BRACKETS {
            for locator in locators {
                assert_abs_diff_eq!(locate(locator, a, b, direction), root, epsilon = 1e-5);
                assert_abs_diff_eq!(locate(locator, a, b, Direction::Any), root, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_default_bisection_is_coarse() {
        let t = locate(&Bisection::default(), 0.5, 1.2, Direction::FromAbove);
        assert_abs_diff_eq!(t, PI / 4.0, epsilon = 1e-3);
        assert!((t - PI / 4.0).abs() > 1e-5);
    }

    #[test]
    fn test_trivial_locators() {
        for (a, b, direction, _) in BRACKETS {
            assert_eq!(locate(&PreCrossing, a, b, direction), a);
            assert_eq!(locate(&PostCrossing, a, b, direction), b);
            let (y1, y2) = (shifted(a), shifted(b));
            let expected = (b - a) / (y2 - y1) * -y1 + a;
            assert_eq!(locate(&LinearInterpolation, a, b, direction), expected);
        }
        assert_abs_diff_eq!(
            locate(&LinearInterpolation, 0.5, 1.2, Direction::Any),
            0.691611,
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_parameter_validation() {
        assert!(Bisection::new(0).is_err());
        assert!(Itp::new(1e-5, 0.0, 1.5, 0.0).is_err());
        assert!(Itp::new(1e-5, 0.1, 0.5, 0.0).is_err());
        assert!(Itp::new(1e-5, 0.1, 2.7, 0.0).is_err());
        assert!(Itp::new(1e-5, 0.1, 1.5, -1.0).is_err());
        assert!(Itp::new(1e-5, 0.1, 2.6, 1.0).is_ok());
    }
}
