//! Arithmetic operators.

use std::fmt;
use std::str::FromStr;

use crate::error::{CbdError, Result};

/// Single-argument functions available to [`super::BlockKind::Generic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MathFunction {
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Exp,
    /// Natural logarithm.
    Ln,
    Log10,
    Log2,
    Sqrt,
    Floor,
    Ceil,
}

impl MathFunction {
    pub fn name(&self) -> &'static str {
        match self {
            MathFunction::Sin => "sin",
            MathFunction::Cos => "cos",
            MathFunction::Tan => "tan",
            MathFunction::Asin => "asin",
            MathFunction::Acos => "acos",
            MathFunction::Atan => "atan",
            MathFunction::Sinh => "sinh",
            MathFunction::Cosh => "cosh",
            MathFunction::Tanh => "tanh",
            MathFunction::Exp => "exp",
            MathFunction::Ln => "ln",
            MathFunction::Log10 => "log10",
            MathFunction::Log2 => "log2",
            MathFunction::Sqrt => "sqrt",
            MathFunction::Floor => "floor",
            MathFunction::Ceil => "ceil",
        }
    }

    fn apply(&self, x: f64) -> f64 {
        match self {
            MathFunction::Sin => x.sin(),
            MathFunction::Cos => x.cos(),
            MathFunction::Tan => x.tan(),
            MathFunction::Asin => x.asin(),
            MathFunction::Acos => x.acos(),
            MathFunction::Atan => x.atan(),
            MathFunction::Sinh => x.sinh(),
            MathFunction::Cosh => x.cosh(),
            MathFunction::Tanh => x.tanh(),
            MathFunction::Exp => x.exp(),
            MathFunction::Ln => x.ln(),
            MathFunction::Log10 => x.log10(),
            MathFunction::Log2 => x.log2(),
            MathFunction::Sqrt => x.sqrt(),
            MathFunction::Floor => x.floor(),
            MathFunction::Ceil => x.ceil(),
        }
    }

    /// Evaluate the function, rejecting inputs outside of its domain.
    pub fn evaluate(&self, block: &str, x: f64) -> Result<f64> {
        let y = self.apply(x);
        if y.is_nan() && !x.is_nan() {
            return Err(CbdError::DomainError {
                block: block.to_string(),
                function: self.name().to_string(),
                input: x,
            });
        }
        if matches!(self, MathFunction::Ln | MathFunction::Log10 | MathFunction::Log2) && x == 0.0 {
            return Err(CbdError::DomainError {
                block: block.to_string(),
                function: self.name().to_string(),
                input: x,
            });
        }
        Ok(y)
    }
}

impl FromStr for MathFunction {
    type Err = CbdError;

    fn from_str(s: &str) -> Result<Self> {
        let function = match s.to_lowercase().as_str() {
            "sin" => MathFunction::Sin,
            "cos" => MathFunction::Cos,
            "tan" => MathFunction::Tan,
            "asin" => MathFunction::Asin,
            "acos" => MathFunction::Acos,
            "atan" => MathFunction::Atan,
            "sinh" => MathFunction::Sinh,
            "cosh" => MathFunction::Cosh,
            "tanh" => MathFunction::Tanh,
            "exp" => MathFunction::Exp,
            "ln" | "log" => MathFunction::Ln,
            "log10" => MathFunction::Log10,
            "log2" => MathFunction::Log2,
            "sqrt" => MathFunction::Sqrt,
            "floor" => MathFunction::Floor,
            "ceil" => MathFunction::Ceil,
            other => {
                return Err(CbdError::invalid_parameter(
                    "function",
                    format!("unknown math function '{}'", other),
                ))
            }
        };
        Ok(function)
    }
}

impl fmt::Display for MathFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub(super) fn invert(block: &str, x: f64, tolerance: f64) -> Result<f64> {
    if x.abs() < tolerance {
        return Err(CbdError::DivisionByZero {
            block: block.to_string(),
        });
    }
    Ok(1.0 / x)
}

pub(super) fn modulo(block: &str, x: f64, y: f64) -> Result<f64> {
    if y == 0.0 {
        return Err(CbdError::DivisionByZero {
            block: block.to_string(),
        });
    }
    Ok(x % y)
}

/// `x ^ (1 / degree)`.
pub(super) fn root(block: &str, x: f64, degree: f64, tolerance: f64) -> Result<f64> {
    if degree.abs() < tolerance {
        return Err(CbdError::DivisionByZero {
            block: block.to_string(),
        });
    }
    let y = x.powf(1.0 / degree);
    if y.is_nan() {
        return Err(CbdError::InvalidRoot {
            block: block.to_string(),
            message: format!("root of degree {} of {} is undefined", degree, x),
        });
    }
    Ok(y)
}

pub(super) fn clamp(x: f64, min: f64, max: f64) -> f64 {
    x.max(min).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_function_names_parse() {
        assert_eq!("sqrt".parse::<MathFunction>().unwrap(), MathFunction::Sqrt);
        assert_eq!("log".parse::<MathFunction>().unwrap(), MathFunction::Ln);
        assert_eq!("COS".parse::<MathFunction>().unwrap(), MathFunction::Cos);
        assert!("gamma".parse::<MathFunction>().is_err());
    }

    #[test]
    fn test_evaluate() {
        assert_relative_eq!(MathFunction::Exp.evaluate("g", 1.0).unwrap(), std::f64::consts::E);
        assert!(MathFunction::Ln.evaluate("g", 0.0).is_err());
        assert!(MathFunction::Acos.evaluate("g", 2.0).is_err());
    }

    #[test]
    fn test_root_of_negative_value() {
        assert!(matches!(
            root("r", -8.0, 2.0, 1e-30),
            Err(CbdError::InvalidRoot { .. })
        ));
    }
}
