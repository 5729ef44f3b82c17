//! Ready-made models for the command line driver and for experimenting.

use crate::blocks::{library, BlockKind, INITIAL_CONDITION};
use crate::error::{CbdError, Result};
use crate::events::{Direction, StateEvent};
use crate::model::Diagram;
use crate::solver::{Simulator, SimulatorConfig};

/// Names accepted by [`demo`].
pub const DEMOS: [&str; 3] = ["bouncing_ball", "algebraic_loop", "oscillator"];

/// Gravity used by the bouncing ball.
pub const GRAVITY: f64 = -9.81;

/// A model together with the state events it needs.
pub struct Demo {
    pub diagram: Diagram,
    pub events: Vec<StateEvent>,
}

impl Demo {
    /// Simulator for the model with every event registered.
    pub fn into_simulator(self, config: SimulatorConfig) -> Simulator {
        let mut sim = Simulator::with_config(self.diagram, config);
        for event in self.events {
            sim.register_state_event(event);
        }
        sim
    }
}

/// Build the demo called `name`.
pub fn demo(name: &str) -> Result<Demo> {
    match name {
        "bouncing_ball" => bouncing_ball(100.0, 0.7),
        "algebraic_loop" => algebraic_loop(),
        "oscillator" => oscillator(),
        other => Err(CbdError::invalid_parameter(
            "demo",
            format!("unknown demo '{}', expected one of {}", other, DEMOS.join(", ")),
        )),
    }
}

/// A ball dropped from `height` that loses part of its speed on every
/// bounce: its velocity is reversed and scaled by `restitution`.
///
/// Outputs `height` and `velocity`.
pub fn bouncing_ball(height: f64, restitution: f64) -> Result<Demo> {
    let mut d = Diagram::new("BouncingBall", &[], &["height", "velocity"]);
    let root = d.root();
    d.add_block(root, "g", BlockKind::constant(GRAVITY))?;
    d.add_block(root, "v0", BlockKind::constant(0.0))?;
    d.add_block(root, "y0", BlockKind::constant(height))?;
    library::add_integrator(&mut d, root, "v")?;
    library::add_integrator(&mut d, root, "y")?;

    d.add_connection(root, "g", "v", None, Some("IN1"))?;
    d.add_connection(root, "v", "y", None, Some("IN1"))?;
    d.add_connection(root, "v0", "v", None, Some(INITIAL_CONDITION))?;
    d.add_connection(root, "y0", "y", None, Some(INITIAL_CONDITION))?;
    d.connect(root, "v", "velocity")?;
    d.connect(root, "y", "height")?;

    let bounce = StateEvent::new("height", 0.0, Direction::FromAbove, move |_, model: &mut Diagram| {
        let velocity = model
            .signal_history("velocity")?
            .last()
            .map(|s| s.value)
            .ok_or_else(|| CbdError::EventCallback {
                message: "no velocity at the bounce".to_string(),
            })?;
        model.set_constant("v0", -velocity * restitution)?;
        model.set_constant("y0", 0.0)
    });

    Ok(Demo {
        diagram: d,
        events: vec![bounce],
    })
}

/// Two algebraic loops, the second fed by the first through a product.
///
/// ```text
/// a1 = a3 + 3      a4 = -p + a5
/// a2 = 2 + a3      a5 = 1 - a4
/// a3 = a1 + a2     p  = 1.5 * a3
/// ```
pub fn algebraic_loop() -> Result<Demo> {
    let mut d = Diagram::new("AlgebraicLoop", &[], &["OUT1", "OUT2"]);
    let root = d.root();
    for (name, value) in [("c1", 3.0), ("c2", 2.0), ("c3", 1.5), ("c4", 1.0)] {
        d.add_block(root, name, BlockKind::constant(value))?;
    }
    for name in ["a1", "a2", "a3", "a4", "a5"] {
        d.add_block(root, name, BlockKind::adder())?;
    }
    d.add_block(root, "p", BlockKind::product())?;
    d.add_block(root, "n1", BlockKind::Negator)?;
    d.add_block(root, "n2", BlockKind::Negator)?;
    for (from, to) in [
        ("a3", "a1"),
        ("c1", "a1"),
        ("c2", "a2"),
        ("a3", "a2"),
        ("a1", "a3"),
        ("a2", "a3"),
        ("a3", "p"),
        ("c3", "p"),
        ("p", "n1"),
        ("n1", "a4"),
        ("a5", "a4"),
        ("c4", "a5"),
        ("n2", "a5"),
        ("a4", "n2"),
        ("a3", "OUT1"),
        ("a4", "OUT2"),
    ] {
        d.connect(root, from, to)?;
    }
    Ok(Demo {
        diagram: d,
        events: Vec::new(),
    })
}

/// `x'' = -x` with `x(0) = 1`, integrated with two forward Euler
/// integrators. Outputs `x` and `v`.
pub fn oscillator() -> Result<Demo> {
    let mut d = Diagram::new("Oscillator", &[], &["x", "v"]);
    let root = d.root();
    d.add_block(root, "x0", BlockKind::constant(1.0))?;
    d.add_block(root, "v0", BlockKind::constant(0.0))?;
    d.add_block(root, "neg", BlockKind::Negator)?;
    library::add_integrator(&mut d, root, "vel")?;
    library::add_integrator(&mut d, root, "pos")?;

    d.connect(root, "pos", "neg")?;
    d.add_connection(root, "neg", "vel", None, Some("IN1"))?;
    d.add_connection(root, "v0", "vel", None, Some(INITIAL_CONDITION))?;
    d.add_connection(root, "vel", "pos", None, Some("IN1"))?;
    d.add_connection(root, "x0", "pos", None, Some(INITIAL_CONDITION))?;
    d.connect(root, "pos", "x")?;
    d.connect(root, "vel", "v")?;
    Ok(Demo {
        diagram: d,
        events: Vec::new(),
    })
}
