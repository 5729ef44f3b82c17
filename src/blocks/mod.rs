//! Block library for causal block diagrams.
//!
//! Every primitive operator is a variant of the closed [`BlockKind`] enum:
//! - Sources: Constant, Sequence, Time, DeltaT, Clock
//! - Arithmetic: Negator, Inverter, Gain, Adder, Product, Modulo, Root,
//!   Power, Abs, Int, Clamp, Generic math functions, Min, Max
//! - Logic: LessThan, LessThanOrEquals, Equals, Not, Or, And, Multiplexer
//! - Routing and memory: Split, Delay
//! - Sinks: Logging
//!
//! Composite blocks carry [`BlockKind::Composite`] and are assembled from
//! primitives; reusable ones live in [`library`].
//!
//! Each variant knows its port layout, which inputs it needs at a given
//! iteration, whether it may take part in an algebraic loop, and how to
//! compute its outputs.

mod logic;
mod math;
mod timing;

pub mod library;

pub use math::MathFunction;

use std::fmt;

use crate::error::{CbdError, Result};

/// Default output port name.
pub const DEFAULT_OUTPUT: &str = "OUT1";

/// Input port carrying a delay's initial condition.
pub const INITIAL_CONDITION: &str = "IC";

/// Clock input port holding the delta for the next iteration.
pub const CLOCK_DELTA_INPUT: &str = "h";

/// Clock output ports.
pub const CLOCK_OUTPUTS: [&str; 3] = ["time", "rel_time", "delta_t"];

/// Severity of a [`BlockKind::Logging`] block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Warning,
    /// Logs and aborts the run.
    Error,
    /// Logs and aborts the run.
    Critical,
}

/// Time information handed to every block of one iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepContext {
    /// Iteration index since the last (re)start.
    pub iteration: usize,
    /// Absolute simulation time of this iteration.
    pub time: f64,
    /// Step that led to this iteration.
    pub delta: f64,
    /// Time at which the clock (re)started.
    pub start_time: f64,
}

impl StepContext {
    /// Time since the clock (re)started.
    pub fn relative_time(&self) -> f64 {
        self.time - self.start_time
    }
}

/// A block operator.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockKind {
    /// A sub-diagram. The type name identifies it for flattening filters.
    Composite { type_name: String },

    /// The simulation clock.
    Clock { start_time: f64, start_delta: f64 },
    Constant { value: f64 },
    /// Outputs `values[iteration % len]`.
    Sequence { values: Vec<f64> },
    /// Absolute and relative time.
    Time,
    /// The current step size, bounded from below.
    DeltaT { min: f64 },

    Negator,
    /// `1 / IN1`, failing when `|IN1| < tolerance`.
    Inverter { tolerance: f64 },
    Gain { gain: f64 },
    Adder { inputs: usize },
    Product { inputs: usize },
    /// Floating point remainder of `IN1 / IN2`.
    Modulo,
    /// `IN1 ^ (1 / IN2)`.
    Root { tolerance: f64 },
    /// `IN1 ^ IN2`.
    Power,
    Abs,
    /// Truncates towards zero.
    Int,
    /// Limits `IN1`; bounds come from the parameters or from `IN2`/`IN3`.
    Clamp { min: f64, max: f64, use_const: bool },
    Generic { function: MathFunction },
    Min { inputs: usize },
    Max { inputs: usize },

    LessThan,
    LessThanOrEquals,
    Equals,
    Not,
    Or { inputs: usize },
    And { inputs: usize },
    /// Forwards the input picked by `select`.
    Multiplexer { inputs: usize, zero_based: bool },

    /// Copies `IN1` to every output.
    Split { outputs: usize },
    /// Outputs `IC` at iteration 0 and the previous `IN1` afterwards.
    Delay,

    /// Logs `message` whenever `IN1` is non-zero.
    Logging { message: String, level: LogLevel },
}

fn numbered(prefix: &str, count: usize) -> Vec<String> {
    (1..=count).map(|i| format!("{}{}", prefix, i)).collect()
}

impl BlockKind {
    /// Composite with the given type name.
    pub fn composite(type_name: impl Into<String>) -> Self {
        BlockKind::Composite {
            type_name: type_name.into(),
        }
    }

    /// Clock starting at `start_time` with an initial step of `start_delta`.
    pub fn clock(start_time: f64, start_delta: f64) -> Self {
        BlockKind::Clock {
            start_time,
            start_delta,
        }
    }

    pub fn constant(value: f64) -> Self {
        BlockKind::Constant { value }
    }

    /// Two-input adder.
    pub fn adder() -> Self {
        BlockKind::Adder { inputs: 2 }
    }

    /// Two-input product.
    pub fn product() -> Self {
        BlockKind::Product { inputs: 2 }
    }

    pub fn inverter() -> Self {
        BlockKind::Inverter { tolerance: 1e-30 }
    }

    pub fn sequence(values: impl Into<Vec<f64>>) -> Self {
        BlockKind::Sequence {
            values: values.into(),
        }
    }

    /// Operator name, or the type name for composites.
    pub fn type_name(&self) -> &str {
        match self {
            BlockKind::Composite { type_name } => type_name,
            BlockKind::Clock { .. } => "Clock",
            BlockKind::Constant { .. } => "Constant",
            BlockKind::Sequence { .. } => "Sequence",
            BlockKind::Time => "Time",
            BlockKind::DeltaT { .. } => "DeltaT",
            BlockKind::Negator => "Negator",
            BlockKind::Inverter { .. } => "Inverter",
            BlockKind::Gain { .. } => "Gain",
            BlockKind::Adder { .. } => "Adder",
            BlockKind::Product { .. } => "Product",
            BlockKind::Modulo => "Modulo",
            BlockKind::Root { .. } => "Root",
            BlockKind::Power => "Power",
            BlockKind::Abs => "Abs",
            BlockKind::Int => "Int",
            BlockKind::Clamp { .. } => "Clamp",
            BlockKind::Generic { .. } => "Generic",
            BlockKind::Min { .. } => "Min",
            BlockKind::Max { .. } => "Max",
            BlockKind::LessThan => "LessThan",
            BlockKind::LessThanOrEquals => "LessThanOrEquals",
            BlockKind::Equals => "Equals",
            BlockKind::Not => "Not",
            BlockKind::Or { .. } => "Or",
            BlockKind::And { .. } => "And",
            BlockKind::Multiplexer { .. } => "Multiplexer",
            BlockKind::Split { .. } => "Split",
            BlockKind::Delay => "Delay",
            BlockKind::Logging { .. } => "Logging",
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, BlockKind::Composite { .. })
    }

    pub fn is_clock(&self) -> bool {
        matches!(self, BlockKind::Clock { .. })
    }

    /// Whether the operator may be part of an automatically solved
    /// algebraic loop.
    ///
    /// A product is only linear when at most one factor is unknown; the
    /// loop solver checks that per loop.
    pub fn is_linear_safe(&self) -> bool {
        matches!(
            self,
            BlockKind::Adder { .. } | BlockKind::Product { .. } | BlockKind::Negator | BlockKind::Delay
        )
    }

    /// Whether the meaning of the inputs depends on their position, so that
    /// connections must name the target port explicitly.
    pub fn is_order_sensitive(&self) -> bool {
        match self {
            BlockKind::Modulo
            | BlockKind::Root { .. }
            | BlockKind::Power
            | BlockKind::LessThan
            | BlockKind::LessThanOrEquals
            | BlockKind::Multiplexer { .. } => true,
            BlockKind::Clamp { use_const, .. } => !use_const,
            _ => false,
        }
    }

    /// Input port names of a primitive operator. Composites declare their
    /// own ports and return an empty list here.
    pub fn input_names(&self) -> Vec<String> {
        match self {
            BlockKind::Composite { .. }
            | BlockKind::Constant { .. }
            | BlockKind::Sequence { .. }
            | BlockKind::Time
            | BlockKind::DeltaT { .. } => Vec::new(),
            BlockKind::Clock { .. } => vec![CLOCK_DELTA_INPUT.to_string()],
            BlockKind::Adder { inputs }
            | BlockKind::Product { inputs }
            | BlockKind::Min { inputs }
            | BlockKind::Max { inputs }
            | BlockKind::Or { inputs }
            | BlockKind::And { inputs } => numbered("IN", *inputs),
            BlockKind::Modulo
            | BlockKind::Root { .. }
            | BlockKind::Power
            | BlockKind::LessThan
            | BlockKind::LessThanOrEquals
            | BlockKind::Equals => numbered("IN", 2),
            BlockKind::Clamp { use_const, .. } => numbered("IN", if *use_const { 1 } else { 3 }),
            BlockKind::Multiplexer { inputs, .. } => {
                let mut names = vec!["select".to_string()];
                names.extend(numbered("IN", *inputs));
                names
            }
            BlockKind::Delay => vec!["IN1".to_string(), INITIAL_CONDITION.to_string()],
            BlockKind::Negator
            | BlockKind::Inverter { .. }
            | BlockKind::Gain { .. }
            | BlockKind::Abs
            | BlockKind::Int
            | BlockKind::Generic { .. }
            | BlockKind::Not
            | BlockKind::Split { .. }
            | BlockKind::Logging { .. } => numbered("IN", 1),
        }
    }

    /// Output port names of a primitive operator.
    pub fn output_names(&self) -> Vec<String> {
        match self {
            BlockKind::Composite { .. } | BlockKind::Logging { .. } => Vec::new(),
            BlockKind::Clock { .. } => CLOCK_OUTPUTS.iter().map(|s| s.to_string()).collect(),
            BlockKind::Time => vec![DEFAULT_OUTPUT.to_string(), "relative".to_string()],
            BlockKind::Split { outputs } => numbered("OUT", *outputs),
            _ => vec![DEFAULT_OUTPUT.to_string()],
        }
    }

    /// Indices of the input ports whose current value is needed at
    /// `iteration`.
    ///
    /// A delay only needs its initial condition at iteration 0 and nothing
    /// afterwards; this is what breaks feedback loops through a delay.
    pub fn dependency_ports(&self, iteration: usize) -> Vec<usize> {
        match self {
            BlockKind::Clock { .. } | BlockKind::Composite { .. } => Vec::new(),
            BlockKind::Delay => {
                if iteration == 0 {
                    vec![1]
                } else {
                    Vec::new()
                }
            }
            _ => (0..self.input_names().len()).collect(),
        }
    }

    /// Compute the outputs of a primitive block for one iteration.
    ///
    /// `input(port, iteration)` reads the value driving input `port` at the
    /// given iteration. `path` is only used for error reporting.
    pub fn compute<F>(&self, path: &str, ctx: &StepContext, input: F) -> Result<Vec<f64>>
    where
        F: Fn(usize, usize) -> Result<f64>,
    {
        let it = ctx.iteration;
        let all = |n: usize| -> Result<Vec<f64>> { (0..n).map(|i| input(i, it)).collect() };

        let value = match self {
            BlockKind::Composite { .. } => {
                return Err(CbdError::InvalidParameter {
                    param: path.to_string(),
                    message: "composite blocks are not computed directly".to_string(),
                })
            }
            BlockKind::Clock { .. } => return Ok(timing::clock(ctx)),
            BlockKind::Time => return Ok(vec![ctx.time, ctx.relative_time()]),
            BlockKind::Split { outputs } => return Ok(vec![input(0, it)?; *outputs]),
            BlockKind::Logging { message, level } => {
                timing::log(path, message, *level, ctx, input(0, it)?)?;
                return Ok(Vec::new());
            }

            BlockKind::Constant { value } => *value,
            BlockKind::Sequence { values } => timing::sequence(path, values, it)?,
            BlockKind::DeltaT { min } => ctx.delta.max(*min),
            BlockKind::Delay => timing::delay(it, &input)?,

            BlockKind::Negator => -input(0, it)?,
            BlockKind::Inverter { tolerance } => math::invert(path, input(0, it)?, *tolerance)?,
            BlockKind::Gain { gain } => input(0, it)? * gain,
            BlockKind::Adder { inputs } => all(*inputs)?.iter().sum(),
            BlockKind::Product { inputs } => all(*inputs)?.iter().product(),
            BlockKind::Modulo => math::modulo(path, input(0, it)?, input(1, it)?)?,
            BlockKind::Root { tolerance } => {
                math::root(path, input(0, it)?, input(1, it)?, *tolerance)?
            }
            BlockKind::Power => input(0, it)?.powf(input(1, it)?),
            BlockKind::Abs => input(0, it)?.abs(),
            BlockKind::Int => input(0, it)?.trunc(),
            BlockKind::Clamp { min, max, use_const } => {
                let x = input(0, it)?;
                if *use_const {
                    math::clamp(x, *min, *max)
                } else {
                    math::clamp(x, input(1, it)?, input(2, it)?)
                }
            }
            BlockKind::Generic { function } => function.evaluate(path, input(0, it)?)?,
            BlockKind::Min { inputs } => all(*inputs)?.into_iter().fold(f64::INFINITY, f64::min),
            BlockKind::Max { inputs } => all(*inputs)?.into_iter().fold(f64::NEG_INFINITY, f64::max),

            BlockKind::LessThan => logic::truth(input(0, it)? < input(1, it)?),
            BlockKind::LessThanOrEquals => logic::truth(input(0, it)? <= input(1, it)?),
            BlockKind::Equals => logic::truth(input(0, it)? == input(1, it)?),
            BlockKind::Not => logic::truth(!logic::is_truthy(input(0, it)?)),
            BlockKind::Or { inputs } => logic::truth(all(*inputs)?.into_iter().any(logic::is_truthy)),
            BlockKind::And { inputs } => logic::truth(all(*inputs)?.into_iter().all(logic::is_truthy)),
            BlockKind::Multiplexer { inputs, zero_based } => {
                let port = logic::select(path, input(0, it)?, *inputs, *zero_based)?;
                input(port, it)?
            }
        };

        Ok(vec![value])
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ctx(iteration: usize) -> StepContext {
        StepContext {
            iteration,
            time: iteration as f64 * 0.5,
            delta: 0.5,
            start_time: 0.0,
        }
    }

    fn run(kind: &BlockKind, inputs: &[f64]) -> Result<Vec<f64>> {
        kind.compute("test", &ctx(0), |port, _| Ok(inputs[port]))
    }

    #[test]
    fn test_port_layouts() {
        assert_eq!(BlockKind::Adder { inputs: 3 }.input_names(), vec!["IN1", "IN2", "IN3"]);
        assert_eq!(BlockKind::Delay.input_names(), vec!["IN1", "IC"]);
        assert_eq!(
            BlockKind::Multiplexer { inputs: 2, zero_based: true }.input_names(),
            vec!["select", "IN1", "IN2"]
        );
        assert_eq!(BlockKind::clock(0.0, 1.0).output_names(), vec!["time", "rel_time", "delta_t"]);
        assert_eq!(BlockKind::Split { outputs: 2 }.output_names(), vec!["OUT1", "OUT2"]);
        assert!(BlockKind::Logging {
            message: String::new(),
            level: LogLevel::Warning
        }
        .output_names()
        .is_empty());
    }

    #[test]
    fn test_capabilities() {
        assert!(BlockKind::adder().is_linear_safe());
        assert!(BlockKind::Delay.is_linear_safe());
        assert!(!BlockKind::inverter().is_linear_safe());
        assert!(!BlockKind::Gain { gain: 2.0 }.is_linear_safe());

        assert!(BlockKind::Modulo.is_order_sensitive());
        assert!(!BlockKind::Clamp { min: 0.0, max: 1.0, use_const: true }.is_order_sensitive());
        assert!(BlockKind::Clamp { min: 0.0, max: 1.0, use_const: false }.is_order_sensitive());
        assert!(!BlockKind::adder().is_order_sensitive());
    }

    #[test]
    fn test_delay_dependencies_change_after_first_iteration() {
        assert_eq!(BlockKind::Delay.dependency_ports(0), vec![1]);
        assert!(BlockKind::Delay.dependency_ports(1).is_empty());
        assert_eq!(BlockKind::adder().dependency_ports(5), vec![0, 1]);
        assert!(BlockKind::clock(0.0, 1.0).dependency_ports(0).is_empty());
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(run(&BlockKind::Adder { inputs: 3 }, &[1.0, 2.0, 3.5]).unwrap(), vec![6.5]);
        assert_eq!(run(&BlockKind::product(), &[2.0, -4.0]).unwrap(), vec![-8.0]);
        assert_eq!(run(&BlockKind::Negator, &[3.0]).unwrap(), vec![-3.0]);
        assert_eq!(run(&BlockKind::Gain { gain: 2.5 }, &[4.0]).unwrap(), vec![10.0]);
        assert_eq!(run(&BlockKind::Modulo, &[8.0, 3.0]).unwrap(), vec![2.0]);
        assert_eq!(run(&BlockKind::Modulo, &[-8.0, 3.0]).unwrap(), vec![-2.0]);
        assert_eq!(run(&BlockKind::Power, &[2.0, 10.0]).unwrap(), vec![1024.0]);
        assert_eq!(run(&BlockKind::Int, &[-2.7]).unwrap(), vec![-2.0]);
        assert_eq!(run(&BlockKind::Abs, &[-2.7]).unwrap(), vec![2.7]);
        assert_eq!(run(&BlockKind::Min { inputs: 3 }, &[4.0, -1.0, 2.0]).unwrap(), vec![-1.0]);
        assert_eq!(run(&BlockKind::Max { inputs: 3 }, &[4.0, -1.0, 2.0]).unwrap(), vec![4.0]);

        let root = run(&BlockKind::Root { tolerance: 1e-30 }, &[27.0, 3.0]).unwrap();
        assert_relative_eq!(root[0], 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_numeric_failures_abort() {
        assert!(matches!(
            run(&BlockKind::inverter(), &[0.0]),
            Err(CbdError::DivisionByZero { .. })
        ));
        assert!(matches!(
            run(&BlockKind::Root { tolerance: 1e-30 }, &[4.0, 0.0]),
            Err(CbdError::DivisionByZero { .. })
        ));
        assert!(matches!(
            run(&BlockKind::Multiplexer { inputs: 2, zero_based: true }, &[2.0, 1.0, 2.0]),
            Err(CbdError::IndexOutOfRange { .. })
        ));
        assert!(matches!(
            run(&BlockKind::Generic { function: MathFunction::Sqrt }, &[-1.0]),
            Err(CbdError::DomainError { .. })
        ));
    }

    #[test]
    fn test_logic() {
        assert_eq!(run(&BlockKind::LessThan, &[1.0, 2.0]).unwrap(), vec![1.0]);
        assert_eq!(run(&BlockKind::LessThan, &[2.0, 2.0]).unwrap(), vec![0.0]);
        assert_eq!(run(&BlockKind::LessThanOrEquals, &[2.0, 2.0]).unwrap(), vec![1.0]);
        assert_eq!(run(&BlockKind::Equals, &[2.0, 2.0]).unwrap(), vec![1.0]);
        assert_eq!(run(&BlockKind::Not, &[0.0]).unwrap(), vec![1.0]);
        assert_eq!(run(&BlockKind::Or { inputs: 3 }, &[0.0, 0.0, 3.0]).unwrap(), vec![1.0]);
        assert_eq!(run(&BlockKind::And { inputs: 2 }, &[1.0, 0.0]).unwrap(), vec![0.0]);
        assert_eq!(
            run(&BlockKind::Multiplexer { inputs: 2, zero_based: true }, &[1.0, 10.0, 20.0]).unwrap(),
            vec![20.0]
        );
        assert_eq!(
            run(&BlockKind::Multiplexer { inputs: 2, zero_based: false }, &[1.0, 10.0, 20.0]).unwrap(),
            vec![10.0]
        );
    }

    #[test]
    fn test_clamp_variants() {
        let fixed = BlockKind::Clamp { min: -1.0, max: 1.0, use_const: true };
        assert_eq!(run(&fixed, &[5.0]).unwrap(), vec![1.0]);
        assert_eq!(run(&fixed, &[-5.0]).unwrap(), vec![-1.0]);

        let dynamic = BlockKind::Clamp { min: 0.0, max: 0.0, use_const: false };
        assert_eq!(run(&dynamic, &[5.0, 0.0, 2.0]).unwrap(), vec![2.0]);
    }

    #[test]
    fn test_time_sources() {
        let c = ctx(3);
        let clock = BlockKind::clock(0.0, 0.5);
        assert_eq!(clock.compute("clk", &c, |_, _| Ok(0.5)).unwrap(), vec![1.5, 1.5, 0.5]);
        assert_eq!(BlockKind::Time.compute("t", &c, |_, _| Ok(0.0)).unwrap(), vec![1.5, 1.5]);
        assert_eq!(
            BlockKind::DeltaT { min: 1.0 }.compute("dt", &c, |_, _| Ok(0.0)).unwrap(),
            vec![1.0]
        );
        assert_eq!(
            BlockKind::sequence([1.0, 2.0]).compute("s", &c, |_, _| Ok(0.0)).unwrap(),
            vec![2.0]
        );
    }

    #[test]
    fn test_delay_reads_initial_condition_then_previous_input() {
        let read = |port: usize, iteration: usize| -> Result<f64> {
            Ok(if port == 1 { 100.0 } else { iteration as f64 })
        };
        assert_eq!(BlockKind::Delay.compute("d", &ctx(0), read).unwrap(), vec![100.0]);
        assert_eq!(BlockKind::Delay.compute("d", &ctx(4), read).unwrap(), vec![3.0]);
    }

    #[test]
    fn test_logging_levels() {
        let warn = BlockKind::Logging {
            message: "hot".to_string(),
            level: LogLevel::Warning,
        };
        assert!(run(&warn, &[1.0]).unwrap().is_empty());

        let fatal = BlockKind::Logging {
            message: "overheated".to_string(),
            level: LogLevel::Critical,
        };
        assert!(run(&fatal, &[0.0]).is_ok());
        assert!(matches!(run(&fatal, &[1.0]), Err(CbdError::LoggedFailure { .. })));
    }
}
