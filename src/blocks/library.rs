//! Reusable composite blocks built from primitives.
//!
//! Each builder adds a composite to `parent`, wires its internals and
//! returns the new block's id. The composite's type name is what
//! [`Diagram::flatten`] filters on.

use super::{BlockKind, CLOCK_DELTA_INPUT, INITIAL_CONDITION};
use crate::error::Result;
use crate::model::{BlockId, Diagram};

/// Smallest step a [`BlockKind::DeltaT`] inside a library block reports.
pub const MIN_DELTA: f64 = 1e-6;

/// `OUT1 = IN1 + 1`.
pub fn add_one(d: &mut Diagram, parent: BlockId, name: &str) -> Result<BlockId> {
    let id = d.add_composite(parent, name, "AddOne", &["IN1"], &["OUT1"])?;
    d.add_block(id, "OneConstant", BlockKind::constant(1.0))?;
    d.add_block(id, "PlusOne", BlockKind::adder())?;
    d.connect(id, "IN1", "PlusOne")?;
    d.connect(id, "OneConstant", "PlusOne")?;
    d.connect(id, "PlusOne", "OUT1")?;
    Ok(id)
}

/// Backward difference of `IN1` over the current step.
///
/// At iteration 0 the output equals `IC`.
pub fn add_derivator(d: &mut Diagram, parent: BlockId, name: &str) -> Result<BlockId> {
    let id = d.add_composite(parent, name, "Derivator", &["IN1", INITIAL_CONDITION], &["OUT1"])?;
    d.add_block(id, "delta_t", BlockKind::DeltaT { min: MIN_DELTA })?;
    d.add_block(id, "multIc", BlockKind::product())?;
    d.add_block(id, "neg1", BlockKind::Negator)?;
    d.add_block(id, "sum1", BlockKind::adder())?;
    d.add_block(id, "delay", BlockKind::Delay)?;
    d.add_block(id, "neg2", BlockKind::Negator)?;
    d.add_block(id, "sum2", BlockKind::adder())?;
    d.add_block(id, "mult", BlockKind::product())?;
    d.add_block(id, "inv", BlockKind::inverter())?;

    // The delay starts at IN1 - IC * dt so that the first difference is IC.
    d.connect(id, INITIAL_CONDITION, "multIc")?;
    d.connect(id, "delta_t", "multIc")?;
    d.connect(id, "multIc", "neg1")?;
    d.connect(id, "neg1", "sum1")?;
    d.connect(id, "IN1", "sum1")?;
    d.add_connection(id, "sum1", "delay", None, Some(INITIAL_CONDITION))?;
    d.add_connection(id, "IN1", "delay", None, Some("IN1"))?;
    d.connect(id, "delay", "neg2")?;
    d.connect(id, "neg2", "sum2")?;
    d.connect(id, "IN1", "sum2")?;
    d.connect(id, "sum2", "mult")?;
    d.connect(id, "delta_t", "inv")?;
    d.connect(id, "inv", "mult")?;
    d.connect(id, "mult", "OUT1")?;
    Ok(id)
}

/// Forward Euler integral of `IN1`, starting at `IC`.
pub fn add_integrator(d: &mut Diagram, parent: BlockId, name: &str) -> Result<BlockId> {
    let id = d.add_composite(parent, name, "Integrator", &["IN1", INITIAL_CONDITION], &["OUT1"])?;
    d.add_block(id, "zero", BlockKind::constant(0.0))?;
    d.add_block(id, "delta_t", BlockKind::DeltaT { min: MIN_DELTA })?;
    d.add_block(id, "delayIn", BlockKind::Delay)?;
    d.add_block(id, "multDelta", BlockKind::product())?;
    d.add_block(id, "delayState", BlockKind::Delay)?;
    d.add_block(id, "sumState", BlockKind::adder())?;

    d.add_connection(id, "zero", "delayIn", None, Some(INITIAL_CONDITION))?;
    d.add_connection(id, "IN1", "delayIn", None, Some("IN1"))?;
    d.connect(id, "delayIn", "multDelta")?;
    d.connect(id, "delta_t", "multDelta")?;
    d.connect(id, "multDelta", "sumState")?;
    d.add_connection(id, INITIAL_CONDITION, "delayState", None, Some(INITIAL_CONDITION))?;
    d.connect(id, "delayState", "sumState")?;
    d.add_connection(id, "sumState", "delayState", None, Some("IN1"))?;
    d.connect(id, "sumState", "OUT1")?;
    Ok(id)
}

/// Add a clock named `{prefix}-clock` ticking every `delta` from
/// `start_time`, with its step held by the constant `{prefix}-delta`.
pub fn add_fixed_rate_clock(
    d: &mut Diagram,
    parent: BlockId,
    prefix: &str,
    delta: f64,
    start_time: f64,
) -> Result<BlockId> {
    let clock_name = format!("{}-clock", prefix);
    let delta_name = format!("{}-delta", prefix);
    let clock = d.add_block(parent, &clock_name, BlockKind::clock(start_time, delta))?;
    d.add_block(parent, &delta_name, BlockKind::constant(delta))?;
    d.add_connection(parent, &delta_name, &clock_name, None, Some(CLOCK_DELTA_INPUT))?;
    Ok(clock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::{Simulator, SimulatorConfig};
    use approx::assert_relative_eq;

    fn values(sim: &Simulator, path: &str) -> Vec<f64> {
        sim.diagram().signal_history(path).unwrap().values()
    }

    fn simulate(d: Diagram, steps: usize) -> Simulator {
        let mut sim = Simulator::with_config(d, SimulatorConfig::new().with_delta_t(1.0));
        sim.run_steps(steps).unwrap();
        sim
    }

    #[test]
    fn test_add_one_on_sequence() {
        let mut d = Diagram::new("model", &[], &["OUT1"]);
        let root = d.root();
        d.add_block(root, "seq", BlockKind::sequence([1.0, 2.0, 5.0, 7.0, 3.0])).unwrap();
        add_one(&mut d, root, "add1").unwrap();
        d.connect(root, "seq", "add1").unwrap();
        d.connect(root, "add1", "OUT1").unwrap();

        let sim = simulate(d, 5);
        assert_eq!(values(&sim, "OUT1"), vec![2.0, 3.0, 6.0, 8.0, 4.0]);
        assert_eq!(values(&sim, "add1.PlusOne"), vec![2.0, 3.0, 6.0, 8.0, 4.0]);
    }

    #[test]
    fn test_derivator_of_ramp() {
        let mut d = Diagram::new("model", &[], &["OUT1"]);
        let root = d.root();
        d.add_block(root, "time", BlockKind::Time).unwrap();
        d.add_block(root, "five", BlockKind::constant(5.0)).unwrap();
        d.add_block(root, "ramp", BlockKind::product()).unwrap();
        d.add_block(root, "ic", BlockKind::constant(0.0)).unwrap();
        add_derivator(&mut d, root, "der").unwrap();
        d.connect(root, "time", "ramp").unwrap();
        d.connect(root, "five", "ramp").unwrap();
        d.add_connection(root, "ramp", "der", None, Some("IN1")).unwrap();
        d.add_connection(root, "ic", "der", None, Some("IC")).unwrap();
        d.connect(root, "der", "OUT1").unwrap();

        let sim = simulate(d, 5);
        let out = values(&sim, "OUT1");
        assert_eq!(out.len(), 5);
        for (got, want) in out.iter().zip([0.0, 5.0, 5.0, 5.0, 5.0]) {
            assert_relative_eq!(*got, want, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_integrator_of_constant() {
        let mut d = Diagram::new("model", &[], &["OUT1"]);
        let root = d.root();
        d.add_block(root, "rate", BlockKind::constant(2.0)).unwrap();
        d.add_block(root, "ic", BlockKind::constant(10.0)).unwrap();
        add_integrator(&mut d, root, "int").unwrap();
        d.add_connection(root, "rate", "int", None, Some("IN1")).unwrap();
        d.add_connection(root, "ic", "int", None, Some("IC")).unwrap();
        d.connect(root, "int", "OUT1").unwrap();

        let sim = simulate(d, 4);
        assert_eq!(values(&sim, "OUT1"), vec![10.0, 12.0, 14.0, 16.0]);
    }

    #[test]
    fn test_fixed_rate_clock() {
        let mut d = Diagram::new("model", &[], &[]);
        let root = d.root();
        let clock = add_fixed_rate_clock(&mut d, root, "clock", 0.5, 2.0).unwrap();
        assert_eq!(d.clock().unwrap(), clock);
        assert_eq!(d.path_of(clock), "clock-clock");
        assert!(d.find("clock-delta").is_ok());
        d.validate().unwrap();

        let sim = simulate(d, 3);
        assert_eq!(values(&sim, "clock-clock.time"), vec![2.0, 2.5, 3.0]);
        assert_eq!(values(&sim, "clock-clock.rel_time"), vec![0.0, 0.5, 1.0]);
    }
}
