//! Core types for block diagram representation.

use std::fmt;

/// A handle to a block in the diagram arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub usize);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

/// Direction of a port relative to its block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PortDirection {
    Input,
    Output,
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortDirection::Input => write!(f, "in"),
            PortDirection::Output => write!(f, "out"),
        }
    }
}

/// A handle to a port: the owning block, the direction and the
/// position in that block's input or output list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId {
    pub block: BlockId,
    pub direction: PortDirection,
    pub index: usize,
}

impl PortId {
    /// Handle to the `index`-th input port of `block`.
    pub fn input(block: BlockId, index: usize) -> Self {
        Self {
            block,
            direction: PortDirection::Input,
            index,
        }
    }

    /// Handle to the `index`-th output port of `block`.
    pub fn output(block: BlockId, index: usize) -> Self {
        Self {
            block,
            direction: PortDirection::Output,
            index,
        }
    }

    pub fn is_input(&self) -> bool {
        self.direction == PortDirection::Input
    }

    pub fn is_output(&self) -> bool {
        self.direction == PortDirection::Output
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}{}", self.block, self.direction, self.index)
    }
}

/// A single sample on a port: the simulation time and the value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Signal {
    pub time: f64,
    pub value: f64,
}

impl Signal {
    pub fn new(time: f64, value: f64) -> Self {
        Self { time, value }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.time, self.value)
    }
}
