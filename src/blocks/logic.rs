//! Comparison, boolean and selection operators.
//!
//! Booleans travel as numbers: zero is false, everything else is true.

use crate::error::{CbdError, Result};

pub(super) fn truth(condition: bool) -> f64 {
    if condition {
        1.0
    } else {
        0.0
    }
}

pub(super) fn is_truthy(value: f64) -> bool {
    value != 0.0
}

/// Map a multiplexer `select` value to the input port index to forward.
///
/// Port 0 is `select` itself, so the first data input is port 1.
pub(super) fn select(block: &str, select: f64, inputs: usize, zero_based: bool) -> Result<usize> {
    let index = if zero_based { select + 1.0 } else { select }.trunc();
    if !(index >= 1.0 && index <= inputs as f64) {
        return Err(CbdError::IndexOutOfRange {
            block: block.to_string(),
            index: select,
        });
    }
    Ok(index as usize)
}
