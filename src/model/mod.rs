//! Hierarchical block diagram representation.
//!
//! A [`Diagram`] owns every block in an arena indexed by [`BlockId`].
//! Composite blocks hold children; ports are addressed by [`PortId`] and
//! links are stored on both ends. Every output port of a primitive block
//! carries the [`SignalHistory`] the simulator appends to.

mod diagram;
mod flatten;
mod signal;
mod types;

pub use diagram::{hash64, Block, Diagram, Port, PATH_SEPARATOR};
pub use signal::SignalHistory;
pub use types::*;
