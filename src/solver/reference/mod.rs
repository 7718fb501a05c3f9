//! In-crate reference back-end.
//!
//! Expressions are stored in an arena ([`program`]), domains are narrowed by
//! forward/backward interval propagation ([`propagation`]) and the search is
//! a depth-first branch and bound ([`search`]). It implements both
//! [`MipBackend`] and [`CpBackend`], so either lowering can be solved without
//! an external SDK. Nonlinear constraints are handled exactly as linear ones;
//! completeness relies on integral variables, continuous variables are fixed
//! by propagation or, failing that, heuristically.

mod interval;
mod program;
mod propagation;
mod search;

pub use interval::Interval;
pub use program::{ListId, NodeId, VarId};
pub use search::DEFAULT_NODE_LIMIT;

use log::{debug, info};

use self::program::{Program, Relation};
use self::search::{Limits, Search};
use crate::domain::{ModelError, ObjectiveSense, Result};
use crate::solver::backend::{BackendStatus, CpBackend, CpOperator, MipBackend, VariableKind};

pub const DEFAULT_TOLERANCE: f64 = 1e-6;

/// Counters of the last search
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SearchStatistics {
    pub nodes_explored: u64,
    pub incumbents: u64,
    pub solve_time_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ReferenceSolver {
    program: Program,
    tolerance: f64,
    limits: Limits,
    assignment: Option<Vec<f64>>,
    node_values: Vec<f64>,
    statistics: SearchStatistics,
}

impl Default for ReferenceSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceSolver {
    pub fn new() -> Self {
        Self {
            program: Program::default(),
            tolerance: DEFAULT_TOLERANCE,
            limits: Limits::default(),
            assignment: None,
            node_values: Vec::new(),
            statistics: SearchStatistics::default(),
        }
    }

    pub fn statistics(&self) -> SearchStatistics {
        self.statistics
    }

    /// Incumbents are logged at `info` rather than `trace`
    pub fn is_verbose(&self) -> bool {
        self.limits.verbose
    }

    pub fn num_nodes(&self) -> usize {
        self.program.nodes.len()
    }

    fn node_of(&self, var: VarId) -> Result<NodeId> {
        self.program
            .variable_node(var)
            .ok_or_else(|| ModelError::Backend(format!("unknown variable handle {}", var.0)))
    }

    fn run(&mut self) -> Result<BackendStatus> {
        info!(
            "reference search over {} variables, {} constraints",
            self.program.variables.len(),
            self.program.restrictions.len()
        );
        let started = std::time::Instant::now();
        let outcome = Search::new(&self.program, self.tolerance, self.limits).run();
        self.statistics = SearchStatistics {
            nodes_explored: outcome.nodes,
            incumbents: outcome.incumbents,
            solve_time_ms: started.elapsed().as_millis() as u64,
        };
        self.node_values = outcome
            .assignment
            .as_ref()
            .map(|assignment| self.program.evaluate(assignment))
            .unwrap_or_default();
        self.assignment = outcome.assignment;
        info!(
            "reference search status: {} ({} nodes)",
            outcome.status, outcome.nodes
        );
        Ok(outcome.status)
    }

    fn arity(operator: CpOperator, operands: &[NodeId], expected: usize) -> Result<()> {
        if operands.len() == expected {
            Ok(())
        } else {
            Err(ModelError::Backend(format!(
                "{:?} expects {} operands, got {}",
                operator,
                expected,
                operands.len()
            )))
        }
    }
}

impl MipBackend for ReferenceSolver {
    type Var = VarId;
    type Expr = NodeId;

    fn name(&self) -> &str {
        "reference"
    }

    fn feasibility_tolerance(&self) -> f64 {
        self.tolerance
    }

    fn set_feasibility_tolerance(&mut self, tolerance: f64) {
        self.tolerance = tolerance;
    }

    fn add_variable(
        &mut self,
        kind: VariableKind,
        lower: f64,
        upper: f64,
        name: &str,
    ) -> Result<VarId> {
        self.program.add_variable(kind, lower, upper, name)
    }

    fn variable(&mut self, var: VarId) -> NodeId {
        self.program.variables[var.0].node
    }

    fn constant(&mut self, value: f64) -> NodeId {
        self.program.constant(value)
    }

    fn weighted_sum(&mut self, terms: &[(f64, NodeId)], constant: f64) -> Result<NodeId> {
        self.program.weighted_sum(terms, constant)
    }

    fn product(&mut self, lhs: &NodeId, rhs: &NodeId) -> Result<NodeId> {
        self.program.product(*lhs, *rhs)
    }

    fn power(&mut self, base: &NodeId, exponent: &NodeId) -> Result<NodeId> {
        self.program.power(*base, *exponent)
    }

    fn abs(&mut self, operand: &NodeId) -> Result<NodeId> {
        self.program.abs(*operand)
    }

    fn add_constraint(&mut self, expr: &NodeId, lower: f64, upper: f64, name: &str) -> Result<()> {
        self.program.add_range(*expr, lower, upper, name)
    }

    fn set_objective(&mut self, var: VarId, sense: ObjectiveSense) -> Result<()> {
        let node = self.node_of(var)?;
        self.program.objective = Some((node, sense));
        Ok(())
    }

    fn set_time_limit(&mut self, seconds: Option<f64>) {
        self.limits.time_limit = seconds;
    }

    fn set_node_limit(&mut self, nodes: Option<u64>) {
        self.limits.node_limit = nodes;
    }

    fn set_verbose(&mut self, verbose: bool) {
        self.limits.verbose = verbose;
    }

    fn solve(&mut self) -> Result<BackendStatus> {
        self.run()
    }

    fn has_solution(&self) -> bool {
        self.assignment.is_some()
    }

    fn value(&self, var: VarId) -> Option<f64> {
        self.assignment.as_ref()?.get(var.0).copied()
    }

    fn num_variables(&self) -> usize {
        self.program.variables.len()
    }

    fn num_constraints(&self) -> usize {
        self.program.restrictions.len()
    }
}

impl CpBackend for ReferenceSolver {
    type Expr = NodeId;
    type List = ListId;

    fn name(&self) -> &str {
        "reference"
    }

    fn add_variable(
        &mut self,
        kind: VariableKind,
        lower: f64,
        upper: f64,
        name: &str,
    ) -> Result<NodeId> {
        let var = self.program.add_variable(kind, lower, upper, name)?;
        self.node_of(var)
    }

    fn add_list(&mut self, length: usize, name: &str) -> Result<ListId> {
        self.program.add_list(length, name)
    }

    fn list_at(&mut self, list: &ListId, position: usize) -> Result<NodeId> {
        let var = self
            .program
            .lists
            .get(list.0)
            .and_then(|members| members.get(position))
            .copied()
            .ok_or_else(|| {
                ModelError::Backend(format!("list {} has no position {}", list.0, position))
            })?;
        self.node_of(var)
    }

    fn constant(&mut self, value: f64) -> NodeId {
        self.program.constant(value)
    }

    fn apply(&mut self, operator: CpOperator, operands: &[NodeId]) -> Result<NodeId> {
        let program = &mut self.program;
        match operator {
            CpOperator::Sum => {
                let terms: Vec<(f64, NodeId)> = operands.iter().map(|o| (1.0, *o)).collect();
                program.weighted_sum(&terms, 0.0)
            }
            CpOperator::Subtract => {
                Self::arity(operator, operands, 2)?;
                program.weighted_sum(&[(1.0, operands[0]), (-1.0, operands[1])], 0.0)
            }
            CpOperator::Negate => {
                Self::arity(operator, operands, 1)?;
                program.weighted_sum(&[(-1.0, operands[0])], 0.0)
            }
            CpOperator::Product => match operands.split_first() {
                None => Ok(program.constant(1.0)),
                Some((first, rest)) => rest
                    .iter()
                    .try_fold(*first, |acc, operand| program.product(acc, *operand)),
            },
            CpOperator::Divide => {
                Self::arity(operator, operands, 2)?;
                program.divide(operands[0], operands[1])
            }
            CpOperator::Power => {
                Self::arity(operator, operands, 2)?;
                program.power(operands[0], operands[1])
            }
            CpOperator::Abs => {
                Self::arity(operator, operands, 1)?;
                program.abs(operands[0])
            }
            CpOperator::Min => program.extremum(false, operands),
            CpOperator::Max => program.extremum(true, operands),
            CpOperator::Not => {
                Self::arity(operator, operands, 1)?;
                program.not(operands[0])
            }
            CpOperator::And => program.connective(true, operands),
            CpOperator::Or => program.connective(false, operands),
            CpOperator::LessThan
            | CpOperator::LessOrEqual
            | CpOperator::GreaterThan
            | CpOperator::GreaterOrEqual
            | CpOperator::Equal
            | CpOperator::NotEqual => {
                Self::arity(operator, operands, 2)?;
                let relation = match operator {
                    CpOperator::LessThan => Relation::Lt,
                    CpOperator::LessOrEqual => Relation::Le,
                    CpOperator::GreaterThan => Relation::Gt,
                    CpOperator::GreaterOrEqual => Relation::Ge,
                    CpOperator::Equal => Relation::Eq,
                    _ => Relation::Ne,
                };
                program.compare(relation, operands[0], operands[1])
            }
            CpOperator::IfThenElse => {
                Self::arity(operator, operands, 3)?;
                program.if_then_else(operands[0], operands[1], operands[2])
            }
        }
    }

    fn element(&mut self, array: &[NodeId], index: &NodeId) -> Result<NodeId> {
        self.program.element(array, *index)
    }

    fn add_constraint(&mut self, expr: &NodeId, name: &str) -> Result<()> {
        let node = if self.program.is_boolean(*expr) {
            *expr
        } else {
            let zero = self.program.constant(0.0);
            self.program.compare(Relation::Ne, *expr, zero)?
        };
        self.program.add_range(node, 1.0, 1.0, name)
    }

    fn set_objective(&mut self, expr: &NodeId, sense: ObjectiveSense) -> Result<()> {
        if expr.0 >= self.program.nodes.len() {
            return Err(ModelError::Backend(format!(
                "unknown expression handle {}",
                expr.0
            )));
        }
        self.program.objective = match sense {
            ObjectiveSense::Feasible => None,
            _ => Some((*expr, sense)),
        };
        Ok(())
    }

    fn set_time_limit(&mut self, seconds: Option<f64>) {
        self.limits.time_limit = seconds;
    }

    fn set_node_limit(&mut self, nodes: Option<u64>) {
        self.limits.node_limit = nodes;
    }

    fn set_verbose(&mut self, verbose: bool) {
        self.limits.verbose = verbose;
    }

    fn solve(&mut self) -> Result<BackendStatus> {
        debug!("reference CP program has {} nodes", self.program.nodes.len());
        self.run()
    }

    fn has_solution(&self) -> bool {
        self.assignment.is_some()
    }

    fn value(&self, expr: &NodeId) -> Option<f64> {
        self.node_values.get(expr.0).copied()
    }

    fn list_value(&self, list: &ListId) -> Option<Vec<usize>> {
        let assignment = self.assignment.as_ref()?;
        self.program
            .lists
            .get(list.0)?
            .iter()
            .map(|member| {
                let value = assignment.get(member.0)?.round();
                (value >= 0.0).then_some(value as usize)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_program_reaches_the_optimum() {
        let mut solver = ReferenceSolver::new();
        let x = MipBackend::add_variable(&mut solver, VariableKind::Integer, 0.0, f64::INFINITY, "x").unwrap();
        let y = MipBackend::add_variable(&mut solver, VariableKind::Integer, 0.0, f64::INFINITY, "y").unwrap();
        let o = MipBackend::add_variable(
            &mut solver,
            VariableKind::Continuous,
            f64::NEG_INFINITY,
            f64::INFINITY,
            "objective",
        )
        .unwrap();
        let (xe, ye, oe) = (
            MipBackend::variable(&mut solver, x),
            MipBackend::variable(&mut solver, y),
            MipBackend::variable(&mut solver, o),
        );
        let cover = solver.weighted_sum(&[(1.0, xe), (1.0, ye)], 0.0).unwrap();
        MipBackend::add_constraint(&mut solver, &cover, 10.0, f64::INFINITY, "cover").unwrap();
        let link = solver
            .weighted_sum(&[(1.0, oe), (-2.0, xe), (-3.0, ye)], 0.0)
            .unwrap();
        MipBackend::add_constraint(&mut solver, &link, 0.0, 0.0, "objective").unwrap();
        MipBackend::set_objective(&mut solver, o, ObjectiveSense::Minimize).unwrap();

        assert_eq!(MipBackend::solve(&mut solver).unwrap(), BackendStatus::Optimal);
        assert_eq!(MipBackend::value(&solver, x), Some(10.0));
        assert_eq!(MipBackend::value(&solver, y), Some(0.0));
        assert!(solver.statistics().incumbents >= 1);
    }

    #[test]
    fn native_constraints_are_searched() {
        let mut solver = ReferenceSolver::new();
        let x = CpBackend::add_variable(&mut solver, VariableKind::Integer, 0.0, 9.0, "x").unwrap();
        let y = CpBackend::add_variable(&mut solver, VariableKind::Integer, 0.0, 9.0, "y").unwrap();
        let product = solver.apply(CpOperator::Product, &[x, y]).unwrap();
        let twelve = CpBackend::constant(&mut solver, 12.0);
        let covered = solver
            .apply(CpOperator::GreaterOrEqual, &[product, twelve])
            .unwrap();
        let different = solver.apply(CpOperator::NotEqual, &[x, y]).unwrap();
        let both = solver.apply(CpOperator::And, &[covered, different]).unwrap();
        CpBackend::add_constraint(&mut solver, &both, "both").unwrap();
        let total = solver.apply(CpOperator::Sum, &[x, y]).unwrap();
        CpBackend::set_objective(&mut solver, &total, ObjectiveSense::Minimize).unwrap();

        assert_eq!(CpBackend::solve(&mut solver).unwrap(), BackendStatus::Optimal);
        assert_eq!(CpBackend::value(&solver, &total), Some(7.0));
    }

    #[test]
    fn lists_are_permutations() {
        let mut solver = ReferenceSolver::new();
        let list = solver.add_list(4, "order").unwrap();
        let first = solver.list_at(&list, 0).unwrap();
        let three = CpBackend::constant(&mut solver, 3.0);
        let pinned = solver.apply(CpOperator::Equal, &[first, three]).unwrap();
        CpBackend::add_constraint(&mut solver, &pinned, "pinned").unwrap();

        assert_eq!(CpBackend::solve(&mut solver).unwrap(), BackendStatus::Optimal);
        let mut order = solver.list_value(&list).unwrap();
        assert_eq!(order[0], 3);
        order.sort_unstable();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn contradictory_bounds_report_infeasibility() {
        let mut solver = ReferenceSolver::new();
        let x = MipBackend::add_variable(&mut solver, VariableKind::Integer, 5.0, 5.0, "x").unwrap();
        let xe = MipBackend::variable(&mut solver, x);
        MipBackend::add_constraint(&mut solver, &xe, 6.0, 7.0, "away").unwrap();
        assert_eq!(MipBackend::solve(&mut solver).unwrap(), BackendStatus::Infeasible);
        assert!(!MipBackend::has_solution(&solver));
    }

    #[test]
    fn node_limit_stops_the_search() {
        // Σ 2·b = 7 has no solution but propagation alone cannot see it
        let mut solver = ReferenceSolver::new();
        let terms: Vec<(f64, NodeId)> = (0..12)
            .map(|i| {
                let b = MipBackend::add_variable(
                    &mut solver,
                    VariableKind::Binary,
                    0.0,
                    1.0,
                    &format!("b{}", i),
                )
                .unwrap();
                (2.0, MipBackend::variable(&mut solver, b))
            })
            .collect();
        let total = solver.weighted_sum(&terms, 0.0).unwrap();
        MipBackend::add_constraint(&mut solver, &total, 7.0, 7.0, "odd").unwrap();
        MipBackend::set_node_limit(&mut solver, Some(3));
        let status = MipBackend::solve(&mut solver).unwrap();
        assert_eq!(status, BackendStatus::NodeLimit);
        assert_eq!(solver.statistics().nodes_explored, 3);
    }
}
