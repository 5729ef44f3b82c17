//! Wall-clock pacing of a simulation run.

use std::thread;
use std::time::{Duration, Instant};

use tracing::warn;

use super::OVERDUE_PAUSE;

/// Outcome of [`RealTimePacer::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pace {
    /// Slept until the wall clock caught up with the simulation.
    OnTime,
    /// The wall clock was already past the target time.
    Overdue,
    /// Too many overdue iterations in a row: paused briefly to let other
    /// threads run.
    Yielded,
}

/// Keeps simulated time in step with the wall clock.
///
/// Simulated time `t` is due `(t - origin) * scale` seconds after
/// [`RealTimePacer::start`]; a scale of 2 runs at half speed.
#[derive(Debug, Clone)]
pub struct RealTimePacer {
    scale: f64,
    origin: Instant,
    sim_origin: f64,
    overdue: usize,
    overdue_limit: usize,
}

impl RealTimePacer {
    pub fn new(scale: f64, overdue_limit: usize) -> Self {
        Self {
            scale,
            origin: Instant::now(),
            sim_origin: 0.0,
            overdue: 0,
            overdue_limit,
        }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Anchor simulated time `sim_time` to now.
    pub fn start(&mut self, sim_time: f64) {
        self.origin = Instant::now();
        self.sim_origin = sim_time;
        self.overdue = 0;
    }

    /// Block until simulated time `sim_time` is due.
    pub fn wait(&mut self, sim_time: f64) -> Pace {
        let due = (sim_time - self.sim_origin) * self.scale;
        let remaining = due - self.origin.elapsed().as_secs_f64();
        if remaining > 0.0 {
            self.overdue = 0;
            thread::sleep(Duration::from_secs_f64(remaining));
            return Pace::OnTime;
        }
        self.overdue += 1;
        if self.overdue > self.overdue_limit {
            warn!(
                time = sim_time,
                late = -remaining,
                "simulation cannot keep up with the wall clock"
            );
            self.overdue = 0;
            thread::sleep(OVERDUE_PAUSE);
            return Pace::Yielded;
        }
        Pace::Overdue
    }
}
