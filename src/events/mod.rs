//! State events: level crossings of a signal that interrupt the simulation.
//!
//! After every committed step the simulator checks each armed
//! [`StateEvent`] with [`detect`]. When a crossing is found, a
//! [`StateEventLocator`] narrows down its time by re-evaluating the model
//! inside the last step; the simulator then lands exactly on the crossing,
//! runs the event's callback and restarts from there.

mod locators;

pub use locators::{
    Bisection, Itp, LinearInterpolation, PostCrossing, PreCrossing, RegulaFalsi, StateEventLocator,
};

use std::fmt;

use crate::error::Result;
use crate::model::Diagram;

/// Direction in which a signal must cross its level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// From a value below the level to one above it.
    FromBelow,
    /// From a value above the level to one below it.
    FromAbove,
    #[default]
    Any,
}

/// Whether the signal crossed `level` between `prev` and `curr`. Touching
/// the level counts as a crossing.
pub fn detect(prev: f64, curr: f64, level: f64, direction: Direction) -> bool {
    let (prev, curr) = (prev - level, curr - level);
    let from_below = prev <= 0.0 && 0.0 <= curr;
    let from_above = prev >= 0.0 && 0.0 >= curr;
    match direction {
        Direction::FromBelow => from_below,
        Direction::FromAbove => from_above,
        Direction::Any => from_below || from_above,
    }
}

/// Invoked with the crossing time and the model, before the restart.
pub type EventCallback = Box<dyn FnMut(f64, &mut Diagram) -> Result<()>>;

/// A watched level crossing of an output signal.
pub struct StateEvent {
    output: String,
    level: f64,
    direction: Direction,
    callback: EventCallback,
    pub(crate) fired: bool,
}

impl StateEvent {
    /// Watch `output` (a signal name as accepted by
    /// [`Diagram::signal_history`]) for crossings of `level`.
    pub fn new<F>(output: impl Into<String>, level: f64, direction: Direction, callback: F) -> Self
    where
        F: FnMut(f64, &mut Diagram) -> Result<()> + 'static,
    {
        Self {
            output: output.into(),
            level,
            direction,
            callback: Box::new(callback),
            fired: false,
        }
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn level(&self) -> f64 {
        self.level
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Whether the last two samples of the watched signal cross the level.
    pub fn crossed(&self, diagram: &Diagram) -> Result<bool> {
        let history = diagram.signal_history(&self.output)?;
        let n = history.len();
        if n < 2 {
            return Ok(false);
        }
        match (history.get(n - 2), history.get(n - 1)) {
            (Some(prev), Some(curr)) => Ok(detect(prev.value, curr.value, self.level, self.direction)),
            _ => Ok(false),
        }
    }

    /// Whether the newest sample of the watched signal sits exactly on the
    /// level.
    pub fn on_level(&self, diagram: &Diagram) -> Result<bool> {
        let history = diagram.signal_history(&self.output)?;
        Ok(history.last().map_or(false, |s| s.value == self.level))
    }

    /// Whether a fired event may watch again: one full step has passed since
    /// the restart and the signal has left the level.
    pub fn can_rearm(&self, diagram: &Diagram) -> Result<bool> {
        let history = diagram.signal_history(&self.output)?;
        Ok(history.len() >= 2 && !self.on_level(diagram)?)
    }

    pub(crate) fn fire(&mut self, time: f64, diagram: &mut Diagram) -> Result<()> {
        (self.callback)(time, diagram)
    }
}

impl fmt::Debug for StateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateEvent")
            .field("output", &self.output)
            .field("level", &self.level)
            .field("direction", &self.direction)
            .field("fired", &self.fired)
            .finish()
    }
}
