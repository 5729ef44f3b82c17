//! Error types for the CBD simulation kernel.
//!
//! This module provides a unified error type [`CbdError`] that covers
//! all error conditions that can occur during model construction,
//! dependency analysis, algebraic loop solving and simulation.

use thiserror::Error;

/// Result type alias using [`CbdError`].
pub type Result<T> = std::result::Result<T, CbdError>;

/// Unified error type for all CBD operations.
#[derive(Error, Debug)]
pub enum CbdError {
    // ============ Model Construction Errors ============
    /// A block with the same name (or a parent port with that name) exists
    #[error("Duplicate block name '{name}' in '{parent}'")]
    DuplicateBlock { parent: String, name: String },

    /// Block lookup failed
    #[error("Block '{path}' not found")]
    BlockNotFound { path: String },

    /// Port lookup failed
    #[error("Port '{port}' not found on block '{block}'")]
    PortNotFound { block: String, port: String },

    /// An input port already has an incoming connection
    #[error("Fan-in is not allowed: input '{port}' of '{block}' is already connected")]
    FanIn { block: String, port: String },

    /// No unconnected `INn` port is left on the target block
    #[error("Block '{block}' has no free input port")]
    NoFreeInputPort { block: String },

    /// Operand order matters, so the input port must be named explicitly
    #[error("Block '{block}' ({kind}) is order-sensitive: the input port must be named")]
    OrderSensitivePort { block: String, kind: String },

    /// Connection endpoints do not belong to the same level of the hierarchy
    #[error("Invalid connection in '{parent}': {message}")]
    InvalidConnection { parent: String, message: String },

    /// Forwarding through composite ports loops back on itself
    #[error("Loop detected while resolving port '{port}'")]
    ForwardingLoop { port: String },

    /// A port resolves to nothing that can drive it
    #[error("Input '{port}' of '{block}' is not connected to a signal source")]
    UnconnectedInput { block: String, port: String },

    /// No clock block in the model
    #[error("Model '{model}' has no clock block")]
    MissingClock { model: String },

    /// More than one clock block in the model
    #[error("Model '{model}' has {count} clock blocks, exactly one is required")]
    MultipleClocks { model: String, count: usize },

    /// Operation requires a composite block
    #[error("Block '{block}' is not a composite block")]
    NotComposite { block: String },

    /// Flat analysis was requested on a hierarchical model
    #[error("Model is not flat: composite block '{block}' remains")]
    NotFlat { block: String },

    // ============ Dependency Graph Errors ============
    /// Node added twice to a dependency graph
    #[error("'{node}' is already a member of the dependency graph")]
    MemberExists { node: String },

    /// Node missing from a dependency graph
    #[error("'{node}' is not a member of the dependency graph")]
    NotMember { node: String },

    // ============ Algebraic Loop Errors ============
    /// A non-linear operator takes part in an algebraic loop
    #[error("Non-linear block '{path}' ({kind}) in algebraic loop")]
    NonLinearLoop { path: String, kind: String },

    /// The loop's coefficient matrix cannot be inverted
    #[error("Singular matrix while solving loop [{blocks}]: {reason}")]
    SingularMatrix { blocks: String, reason: String },

    // ============ Numeric Errors ============
    /// Division (inversion) by a value too close to zero
    #[error("Division by zero in block '{block}'")]
    DivisionByZero { block: String },

    /// Selector outside of the available inputs
    #[error("Index {index} out of range in block '{block}'")]
    IndexOutOfRange { block: String, index: f64 },

    /// Root with an undefined degree
    #[error("Invalid root in block '{block}': {message}")]
    InvalidRoot { block: String, message: String },

    /// Function evaluated outside of its domain
    #[error("{function} evaluated outside of its domain in block '{block}' (input {input})")]
    DomainError {
        block: String,
        function: String,
        input: f64,
    },

    // ============ Simulation Errors ============
    /// A signal value was requested for an iteration that has not been computed
    #[error("No signal on '{path}' at iteration {iteration}")]
    MissingSignal { path: String, iteration: usize },

    /// A top-level input port has no external value
    #[error("No value supplied for model input '{port}'")]
    MissingInput { port: String },

    /// A logging block at error level fired
    #[error("Block '{block}' reported a failure: {message}")]
    LoggedFailure { block: String, message: String },

    /// Invalid configuration or block parameter
    #[error("Invalid parameter '{param}': {message}")]
    InvalidParameter { param: String, message: String },

    /// A state-event callback failed
    #[error("State event callback failed: {message}")]
    EventCallback { message: String },

    /// The tracer worker thread could not be started
    #[error("Tracer worker failed: {message}")]
    TracerWorker { message: String },
}

impl CbdError {
    /// Create a block-not-found error
    pub fn block_not_found(path: impl Into<String>) -> Self {
        Self::BlockNotFound { path: path.into() }
    }

    /// Create a port-not-found error
    pub fn port_not_found(block: impl Into<String>, port: impl Into<String>) -> Self {
        Self::PortNotFound {
            block: block.into(),
            port: port.into(),
        }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(param: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            param: param.into(),
            message: message.into(),
        }
    }

    /// Create a missing signal error
    pub fn missing_signal(path: impl Into<String>, iteration: usize) -> Self {
        Self::MissingSignal {
            path: path.into(),
            iteration,
        }
    }
}
