//! Simulation engine.
//!
//! One iteration of a causal block diagram is computed in three stages:
//!
//! 1. [`DepGraph`] records, for the current iteration, which block needs
//!    which other block's output before it can compute.
//! 2. [`Scheduler`] splits that graph into strongly connected components
//!    and orders them so every component comes after its influencers.
//!    A component with more than one block (or a block feeding itself) is
//!    an algebraic loop.
//! 3. [`Simulator`] computes the components in order. Algebraic loops are
//!    handed to a [`LoopSolver`], which assembles and solves the linear
//!    system
//!
//! ```text
//! A x = z
//! ```
//!
//! where `x` holds the unknown block outputs of the loop and `z` the
//! contributions of signals computed earlier in the iteration.
//!
//! Time advances through the model's clock block. State events are checked
//! after every committed iteration and, once located, restart the clock at
//! the crossing time.

mod depgraph;
mod linear;
mod realtime;
mod scheduler;
mod simulator;

pub use depgraph::{DepGraph, DepNode};
pub use linear::{LinearSolver, LinearSystem, LoopSolver};
pub use realtime::{Pace, RealTimePacer};
pub use scheduler::{must_compute, Group, RecomputePolicy, Scheduler};
pub use simulator::{Simulator, SimulatorConfig, TerminationCondition};

use std::time::Duration;

/// Step size of the clock added to models that have none.
pub const DEFAULT_DELTA_T: f64 = 0.1;

/// Relative tolerance when checking whether a time falls on a block's rate.
pub const RATE_TOLERANCE: f64 = 1e-6;

/// Pivots below this magnitude make a loop's matrix singular.
pub const PIVOT_EPSILON: f64 = 1e-15;

/// Decimal digits kept when comparing the remaining time to the step size.
pub const TERMINATION_PRECISION: i32 = 8;

/// Consecutive late iterations tolerated before the real-time pacer yields.
pub const DEFAULT_OVERDUE_LIMIT: usize = 100;

/// Pause taken by the real-time pacer once too many iterations were late.
pub const OVERDUE_PAUSE: Duration = Duration::from_millis(10);
