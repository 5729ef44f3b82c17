//! Algebraic loop solving.
//!
//! A group of blocks that depend on each other within one iteration is
//! turned into a linear system `A x = z` with one unknown per block (its
//! output) and solved with Gauss-Jordan elimination.
//!
//! Row `i` describes block `i` of the group with `-1` on the diagonal:
//! - Adder: `+1` for each in-loop input, known inputs move to `z`
//! - Product: the product of the known factors for the in-loop factor
//! - Negator: `-1` for the in-loop input
//! - Delay (iteration 0 only): `+1` for an in-loop initial condition

use std::collections::HashMap;

use tracing::debug;

use super::PIVOT_EPSILON;
use crate::blocks::{BlockKind, INITIAL_CONDITION};
use crate::error::{CbdError, Result};
use crate::model::{BlockId, Diagram, PortId};

/// Dense linear system `A x = z`.
#[derive(Debug, Clone)]
pub struct LinearSystem {
    /// System matrix A (row-major)
    pub a: Vec<f64>,
    /// Right-hand side z
    pub z: Vec<f64>,
    /// Solution vector x
    pub x: Vec<f64>,
    /// Matrix dimension
    pub size: usize,
}

impl LinearSystem {
    pub fn new(size: usize) -> Self {
        Self {
            a: vec![0.0; size * size],
            z: vec![0.0; size],
            x: vec![0.0; size],
            size,
        }
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.a[row * self.size + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.a[row * self.size + col] = value;
    }

    pub fn add(&mut self, row: usize, col: usize, value: f64) {
        self.a[row * self.size + col] += value;
    }

    pub fn add_source(&mut self, row: usize, value: f64) {
        self.z[row] += value;
    }

    /// Solve with Gauss-Jordan elimination and full pivoting, leaving the
    /// solution in `x`. `a` and `z` are left untouched.
    pub fn solve(&mut self) -> Result<()> {
        let n = self.size;
        let mut a = self.a.clone();
        let mut b = self.z.clone();
        let mut pivot_uses = vec![0u32; n];

        for _ in 0..n {
            // Largest candidate among unused rows and columns.
            let mut big = 0.0;
            let (mut irow, mut icol) = (0, 0);
            for j in 0..n {
                if pivot_uses[j] == 1 {
                    continue;
                }
                for k in 0..n {
                    match pivot_uses[k] {
                        0 if a[j * n + k].abs() >= big => {
                            big = a[j * n + k].abs();
                            irow = j;
                            icol = k;
                        }
                        0 => {}
                        1 => {}
                        _ => return Err(singular("pivot reused")),
                    }
                }
            }
            pivot_uses[icol] += 1;
            if pivot_uses[icol] > 1 {
                return Err(singular("pivot reused"));
            }

            if irow != icol {
                for l in 0..n {
                    a.swap(irow * n + l, icol * n + l);
                }
                b.swap(irow, icol);
            }

            let pivot = a[icol * n + icol];
            if pivot.abs() < PIVOT_EPSILON {
                return Err(singular("zero pivot"));
            }
            let inverse = 1.0 / pivot;
            a[icol * n + icol] = 1.0;
            for l in 0..n {
                a[icol * n + l] *= inverse;
            }
            b[icol] *= inverse;

            for row in 0..n {
                if row == icol {
                    continue;
                }
                let factor = a[row * n + icol];
                a[row * n + icol] = 0.0;
                for l in 0..n {
                    a[row * n + l] -= a[icol * n + l] * factor;
                }
                b[row] -= b[icol] * factor;
            }
        }

        self.x = b;
        Ok(())
    }
}

fn singular(reason: &str) -> CbdError {
    CbdError::SingularMatrix {
        blocks: String::new(),
        reason: reason.to_string(),
    }
}

/// Strategy for computing an algebraic loop.
pub trait LoopSolver {
    /// Fail if the group cannot be handled by this solver.
    fn check_validity(&self, diagram: &Diagram, group: &[BlockId], iteration: usize) -> Result<()>;

    /// Build the system for `group` from the values already computed in
    /// this iteration.
    fn construct_input(&self, diagram: &Diagram, group: &[BlockId], iteration: usize) -> Result<LinearSystem>;

    /// Output value of every block of `group`, in group order.
    fn solve(&self, diagram: &Diagram, group: &[BlockId], iteration: usize) -> Result<Vec<f64>> {
        self.check_validity(diagram, group, iteration)?;
        let mut system = self.construct_input(diagram, group, iteration)?;
        system.solve().map_err(|e| match e {
            CbdError::SingularMatrix { reason, .. } => CbdError::SingularMatrix {
                blocks: group.iter().map(|id| diagram.path_of(*id)).collect::<Vec<_>>().join(", "),
                reason,
            },
            other => other,
        })?;
        debug!(iteration, size = system.size, "algebraic loop solved");
        Ok(system.x)
    }
}

/// Solver for loops made of adders, products with one unknown factor,
/// negators and delays at iteration 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearSolver;

/// Where input `port` of `block` gets its value from: another group member
/// or an already known signal.
enum Operand {
    Unknown(usize),
    Known(f64),
}

fn operand(
    diagram: &Diagram,
    index: &HashMap<BlockId, usize>,
    block: BlockId,
    port: usize,
    iteration: usize,
) -> Result<Operand> {
    let driver = diagram.driver_of(PortId::input(block, port))?;
    if driver.is_output() {
        if let Some(&j) = index.get(&driver.block) {
            return Ok(Operand::Unknown(j));
        }
    }
    Ok(Operand::Known(diagram.input_signal(block, port, iteration)?.value))
}

fn non_linear(diagram: &Diagram, block: BlockId, kind: &BlockKind) -> CbdError {
    CbdError::NonLinearLoop {
        path: diagram.path_of(block),
        kind: kind.type_name().to_string(),
    }
}

fn group_index(group: &[BlockId]) -> HashMap<BlockId, usize> {
    group.iter().enumerate().map(|(i, id)| (*id, i)).collect()
}

impl LoopSolver for LinearSolver {
    fn check_validity(&self, diagram: &Diagram, group: &[BlockId], iteration: usize) -> Result<()> {
        let index = group_index(group);
        for &id in group {
            let kind = diagram.block(id)?.kind();
            let linear = match kind {
                BlockKind::Delay => iteration == 0,
                BlockKind::Product { inputs } => {
                    let mut unknowns = 0;
                    for port in 0..*inputs {
                        let driver = diagram.driver_of(PortId::input(id, port))?;
                        if driver.is_output() && index.contains_key(&driver.block) {
                            unknowns += 1;
                        }
                    }
                    unknowns <= 1
                }
                other => other.is_linear_safe(),
            };
            if !linear {
                return Err(non_linear(diagram, id, kind));
            }
        }
        Ok(())
    }

    fn construct_input(&self, diagram: &Diagram, group: &[BlockId], iteration: usize) -> Result<LinearSystem> {
        let index = group_index(group);
        let mut system = LinearSystem::new(group.len());
        for (i, &id) in group.iter().enumerate() {
            system.set(i, i, -1.0);
            let kind = diagram.block(id)?.kind();
            match kind {
                BlockKind::Adder { inputs } => {
                    for port in 0..*inputs {
                        match operand(diagram, &index, id, port, iteration)? {
                            Operand::Unknown(j) => system.add(i, j, 1.0),
                            Operand::Known(v) => system.add_source(i, -v),
                        }
                    }
                }
                BlockKind::Product { inputs } => {
                    let mut known = 1.0;
                    let mut unknown = None;
                    for port in 0..*inputs {
                        match operand(diagram, &index, id, port, iteration)? {
                            Operand::Unknown(j) => unknown = Some(j),
                            Operand::Known(v) => known *= v,
                        }
                    }
                    match unknown {
                        Some(j) => system.add(i, j, known),
                        None => system.add_source(i, -known),
                    }
                }
                BlockKind::Negator => match operand(diagram, &index, id, 0, iteration)? {
                    Operand::Unknown(j) => system.add(i, j, -1.0),
                    Operand::Known(v) => system.add_source(i, v),
                },
                BlockKind::Delay if iteration == 0 => {
                    let ic = diagram
                        .block(id)?
                        .input_index(INITIAL_CONDITION)
                        .ok_or_else(|| CbdError::port_not_found(diagram.path_of(id), INITIAL_CONDITION))?;
                    match operand(diagram, &index, id, ic, iteration)? {
                        Operand::Unknown(j) => system.add(i, j, 1.0),
                        Operand::Known(v) => system.add_source(i, -v),
                    }
                }
                other => return Err(non_linear(diagram, id, other)),
            }
        }
        Ok(system)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Signal;
    use approx::assert_relative_eq;

    #[test]
    fn test_gauss_jordan() {
        // 2x + y - z = 8, -3x - y + 2z = -11, -2x + y + 2z = -3
        let mut system = LinearSystem::new(3);
        let rows = [[2.0, 1.0, -1.0], [-3.0, -1.0, 2.0], [-2.0, 1.0, 2.0]];
        for (r, row) in rows.iter().enumerate() {
            for (c, v) in row.iter().enumerate() {
                system.set(r, c, *v);
            }
        }
        system.z = vec![8.0, -11.0, -3.0];
        system.solve().unwrap();
        assert_relative_eq!(system.x[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(system.x[1], 3.0, epsilon = 1e-12);
        assert_relative_eq!(system.x[2], -1.0, epsilon = 1e-12);
        assert_eq!(system.get(0, 0), 2.0);
    }

    #[test]
    fn test_singular_system() {
        let mut system = LinearSystem::new(2);
        system.set(0, 0, 1.0);
        system.set(0, 1, 2.0);
        system.set(1, 0, 2.0);
        system.set(1, 1, 4.0);
        assert!(matches!(system.solve(), Err(CbdError::SingularMatrix { .. })));
    }

    /// `a1 = c1 + a3`, `a2 = c2 + a3`, `a3 = a1 + a2` with the constants
    /// already computed for iteration 0.
    fn adder_ring() -> (Diagram, Vec<BlockId>) {
        let mut d = Diagram::new("model", &[], &[]);
        let root = d.root();
        let c1 = d.add_block(root, "c1", BlockKind::constant(-5.0)).unwrap();
        let c2 = d.add_block(root, "c2", BlockKind::constant(5.5)).unwrap();
        let a1 = d.add_block(root, "a1", BlockKind::adder()).unwrap();
        let a2 = d.add_block(root, "a2", BlockKind::adder()).unwrap();
        let a3 = d.add_block(root, "a3", BlockKind::adder()).unwrap();
        d.connect(root, "c1", "a1").unwrap();
        d.connect(root, "a3", "a1").unwrap();
        d.connect(root, "c2", "a2").unwrap();
        d.connect(root, "a3", "a2").unwrap();
        d.connect(root, "a1", "a3").unwrap();
        d.connect(root, "a2", "a3").unwrap();
        d.push_signal(PortId::output(c1, 0), Signal::new(0.0, -5.0)).unwrap();
        d.push_signal(PortId::output(c2, 0), Signal::new(0.0, 5.5)).unwrap();
        (d, vec![a1, a2, a3])
    }

    #[test]
    fn test_adder_ring() {
        let (d, group) = adder_ring();
        let x = LinearSolver.solve(&d, &group, 0).unwrap();
        assert_relative_eq!(x[0], -5.5, epsilon = 1e-12);
        assert_relative_eq!(x[1], 5.0, epsilon = 1e-12);
        assert_relative_eq!(x[2], -0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_product_of_two_unknowns_is_rejected() {
        let mut d = Diagram::new("model", &[], &[]);
        let root = d.root();
        let c = d.add_block(root, "c", BlockKind::constant(2.0)).unwrap();
        let a = d.add_block(root, "a", BlockKind::adder()).unwrap();
        let p = d.add_block(root, "p", BlockKind::product()).unwrap();
        d.connect(root, "c", "a").unwrap();
        d.connect(root, "p", "a").unwrap();
        d.connect(root, "a", "p").unwrap();
        d.connect(root, "a", "p").unwrap();
        d.push_signal(PortId::output(c, 0), Signal::new(0.0, 2.0)).unwrap();

        let err = LinearSolver.solve(&d, &[a, p], 0).unwrap_err();
        match err {
            CbdError::NonLinearLoop { path, kind } => {
                assert_eq!(path, "p");
                assert_eq!(kind, "Product");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_non_linear_operator_is_rejected() {
        let mut d = Diagram::new("model", &[], &[]);
        let root = d.root();
        let inv = d.add_block(root, "inv", BlockKind::inverter()).unwrap();
        let neg = d.add_block(root, "neg", BlockKind::Negator).unwrap();
        d.connect(root, "inv", "neg").unwrap();
        d.connect(root, "neg", "inv").unwrap();
        assert!(matches!(
            LinearSolver.check_validity(&d, &[inv, neg], 0),
            Err(CbdError::NonLinearLoop { .. })
        ));
    }

    #[test]
    fn test_delay_initial_condition_in_loop() {
        // a = c + d, d = IC = n, n = -a at iteration 0, so a = c / 2.
        let mut d = Diagram::new("model", &[], &[]);
        let root = d.root();
        let c = d.add_block(root, "c", BlockKind::constant(4.0)).unwrap();
        let a = d.add_block(root, "a", BlockKind::adder()).unwrap();
        let delay = d.add_block(root, "d", BlockKind::Delay).unwrap();
        let n = d.add_block(root, "n", BlockKind::Negator).unwrap();
        d.connect(root, "c", "a").unwrap();
        d.connect(root, "d", "a").unwrap();
        d.add_connection(root, "c", "d", None, Some("IN1")).unwrap();
        d.add_connection(root, "n", "d", None, Some(INITIAL_CONDITION)).unwrap();
        d.connect(root, "a", "n").unwrap();
        d.push_signal(PortId::output(c, 0), Signal::new(0.0, 4.0)).unwrap();

        let group = [a, delay, n];
        let system = LinearSolver.construct_input(&d, &group, 0).unwrap();
        assert_eq!(system.get(1, 1), -1.0);
        assert_eq!(system.get(1, 2), 1.0);

        let x = LinearSolver.solve(&d, &group, 0).unwrap();
        assert_relative_eq!(x[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(x[1], -2.0, epsilon = 1e-12);
        assert_relative_eq!(x[2], -2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_singular_loop_names_blocks() {
        // n1 = -n2, n2 = -n1 has no unique solution.
        let mut d = Diagram::new("model", &[], &[]);
        let root = d.root();
        let n1 = d.add_block(root, "n1", BlockKind::Negator).unwrap();
        let n2 = d.add_block(root, "n2", BlockKind::Negator).unwrap();
        d.connect(root, "n1", "n2").unwrap();
        d.connect(root, "n2", "n1").unwrap();
        match LinearSolver.solve(&d, &[n1, n2], 0).unwrap_err() {
            CbdError::SingularMatrix { blocks, .. } => assert_eq!(blocks, "n1, n2"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
