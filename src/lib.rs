//! # CBD Core
//!
//! A simulation kernel for causal block diagrams.
//!
//! This library provides:
//! - A hierarchical block diagram model with signal histories
//! - A library of primitive operators and reusable composite blocks
//! - Dependency analysis and scheduling with algebraic loop detection
//! - A linear solver for algebraic loops
//! - State events located inside a step by root finding
//! - Tracers receiving the samples of a run on a background thread
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`model`] - Blocks, ports, connections, flattening
//! - [`blocks`] - Primitive operators and composite builders
//! - [`solver`] - Dependency graph, scheduler, loop solver and simulator
//! - [`events`] - Level crossings and crossing-time locators
//! - [`tracer`] - Delivery of samples to consumers
//! - [`demos`] - Ready-made models
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cbd_core::{blocks::BlockKind, Diagram, Simulator, SimulatorConfig};
//!
//! let mut d = Diagram::new("model", &[], &["OUT1"]);
//! let root = d.root();
//! d.add_block(root, "c", BlockKind::constant(3.0))?;
//! d.add_block(root, "neg", BlockKind::Negator)?;
//! d.connect(root, "c", "neg")?;
//! d.connect(root, "neg", "OUT1")?;
//!
//! let config = SimulatorConfig::new().with_delta_t(0.1).with_termination_time(1.0);
//! let mut sim = Simulator::with_config(d, config);
//! sim.run()?;
//! println!("{:?}", sim.diagram().signal_history("OUT1")?.values());
//! ```
//!
//! ## Simulation Method
//!
//! Time is discrete: iteration `k` happens at the clock's time for `k`.
//! For each iteration:
//!
//! 1. Build the dependency graph of the iteration
//! 2. Order its strongly connected components, influencers first
//! 3. Compute single blocks directly and solve algebraic loops as `A x = z`
//! 4. Check state events; a crossing replaces the iteration by one ending
//!    exactly at the crossing and restarts the clock there

pub mod blocks;
pub mod demos;
pub mod error;
pub mod events;
pub mod model;
pub mod solver;
pub mod tracer;

// Re-export main types for convenience
pub use error::{CbdError, Result};
pub use model::Diagram;
pub use solver::{Simulator, SimulatorConfig};

/// Default simulation step.
pub const DEFAULT_DELTA_T: f64 = solver::DEFAULT_DELTA_T;

/// Default end time of the command line driver.
pub const DEFAULT_END_TIME: f64 = 10.0;

/// Initialize the tracing subscriber for logging.
///
/// `RUST_LOG` takes precedence over `level`.
#[cfg(feature = "cli")]
pub fn init_logging(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
