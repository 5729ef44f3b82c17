//! Time sources, memory and logging.

use tracing::warn;

use super::{LogLevel, StepContext};
use crate::error::{CbdError, Result};

/// Clock outputs: absolute time, relative time and the current delta.
pub(super) fn clock(ctx: &StepContext) -> Vec<f64> {
    vec![ctx.time, ctx.relative_time(), ctx.delta]
}

pub(super) fn sequence(block: &str, values: &[f64], iteration: usize) -> Result<f64> {
    if values.is_empty() {
        return Err(CbdError::invalid_parameter(block, "sequence is empty"));
    }
    Ok(values[iteration % values.len()])
}

/// `IC` at iteration 0, the previous `IN1` afterwards.
pub(super) fn delay<F>(iteration: usize, input: &F) -> Result<f64>
where
    F: Fn(usize, usize) -> Result<f64>,
{
    if iteration == 0 {
        input(1, 0)
    } else {
        input(0, iteration - 1)
    }
}

pub(super) fn log(block: &str, message: &str, level: LogLevel, ctx: &StepContext, value: f64) -> Result<()> {
    if value == 0.0 {
        return Ok(());
    }
    match level {
        LogLevel::Warning => {
            warn!(block, time = ctx.time, "{}", message);
            Ok(())
        }
        LogLevel::Error | LogLevel::Critical => {
            tracing::error!(block, time = ctx.time, ?level, "{}", message);
            Err(CbdError::LoggedFailure {
                block: block.to_string(),
                message: format!("[{}] {}", ctx.time, message),
            })
        }
    }
}
