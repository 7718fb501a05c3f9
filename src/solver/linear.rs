// Linear back-ends built on external LP/MIP engines
//
// The engines only accept `lower <= Σ a·x <= upper` rows, so the adapter
// keeps every expression in affine form and rejects products of variables,
// powers and absolute values.

use std::fmt;
use std::marker::PhantomData;

use log::{debug, info};

use crate::domain::{ModelError, ObjectiveSense, Result};
use crate::solver::backend::{BackendStatus, MipBackend, VariableKind};

/// `constant + Σ coefficient·column`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LinearExpr {
    pub terms: Vec<(usize, f64)>,
    pub constant: f64,
}

impl LinearExpr {
    pub fn constant(value: f64) -> Self {
        Self {
            terms: Vec::new(),
            constant: value,
        }
    }

    pub fn column(column: usize) -> Self {
        Self {
            terms: vec![(column, 1.0)],
            constant: 0.0,
        }
    }

    pub fn as_constant(&self) -> Option<f64> {
        self.terms.is_empty().then_some(self.constant)
    }

    fn add_scaled(&mut self, factor: f64, other: &LinearExpr) {
        self.constant += factor * other.constant;
        for (column, coefficient) in &other.terms {
            match self.terms.iter_mut().find(|(existing, _)| existing == column) {
                Some(entry) => entry.1 += factor * coefficient,
                None => self.terms.push((*column, factor * coefficient)),
            }
        }
        self.terms.retain(|(_, coefficient)| *coefficient != 0.0);
    }

    fn scaled(&self, factor: f64) -> LinearExpr {
        let mut result = LinearExpr::default();
        result.add_scaled(factor, self);
        result
    }
}

#[derive(Debug, Clone)]
pub struct LinearColumn {
    pub kind: VariableKind,
    pub lower: f64,
    pub upper: f64,
    pub name: String,
}

/// `lower <= expr <= upper`, the constant already moved to the bounds
#[derive(Debug, Clone)]
pub struct LinearRow {
    pub terms: Vec<(usize, f64)>,
    pub lower: f64,
    pub upper: f64,
    pub name: String,
}

/// Everything an engine needs to build and solve its model
#[derive(Debug, Clone, Default)]
pub struct LinearProblem {
    pub columns: Vec<LinearColumn>,
    pub rows: Vec<LinearRow>,
    pub objective: Option<(usize, ObjectiveSense)>,
    pub time_limit: Option<f64>,
    pub node_limit: Option<u64>,
    /// Let the engine print its own log
    pub verbose: bool,
}

impl LinearProblem {
    /// Whether `columns` satisfies every bound and row within `tolerance`
    pub fn accepts(&self, columns: &[f64], tolerance: f64) -> bool {
        let bounds = self.columns.iter().zip(columns).all(|(column, value)| {
            *value >= column.lower - tolerance && *value <= column.upper + tolerance
        });
        bounds
            && self.rows.iter().all(|row| {
                let value: f64 = row.terms.iter().map(|(c, a)| a * columns[*c]).sum();
                value >= row.lower - tolerance && value <= row.upper + tolerance
            })
    }
}

/// Result of an engine run
#[derive(Debug, Clone)]
pub struct LinearOutcome {
    pub status: BackendStatus,
    pub columns: Option<Vec<f64>>,
}

/// External LP/MIP engine
pub trait LinearEngine {
    const NAME: &'static str;

    /// Primal feasibility tolerance used unless overridden
    const TOLERANCE: f64;

    fn optimise(problem: &LinearProblem, tolerance: f64) -> Result<LinearOutcome>;
}

/// [`MipBackend`] over a [`LinearEngine`]
pub struct LinearBackend<E: LinearEngine> {
    problem: LinearProblem,
    tolerance: f64,
    solution: Option<Vec<f64>>,
    /// Constant row that can never hold
    contradiction: Option<String>,
    engine: PhantomData<E>,
}

impl<E: LinearEngine> fmt::Debug for LinearBackend<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinearBackend")
            .field("engine", &E::NAME)
            .field("columns", &self.problem.columns.len())
            .field("rows", &self.problem.rows.len())
            .finish()
    }
}

impl<E: LinearEngine> Default for LinearBackend<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: LinearEngine> LinearBackend<E> {
    pub fn new() -> Self {
        Self {
            problem: LinearProblem::default(),
            tolerance: E::TOLERANCE,
            solution: None,
            contradiction: None,
            engine: PhantomData,
        }
    }

    pub fn problem(&self) -> &LinearProblem {
        &self.problem
    }

    fn unsupported(what: &str) -> ModelError {
        ModelError::Lowering(format!("unsupported by {}: {}", E::NAME, what))
    }
}

impl<E: LinearEngine> MipBackend for LinearBackend<E> {
    type Var = usize;
    type Expr = LinearExpr;

    fn name(&self) -> &str {
        E::NAME
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
    ) -> Result<usize> {
        let (lower, upper) = match kind {
            VariableKind::Binary => (lower.max(0.0), upper.min(1.0)),
            _ => (lower, upper),
        };
        if lower.is_nan() || upper.is_nan() || lower > upper {
            return Err(ModelError::Backend(format!(
                "variable '{}' has an empty domain [{}, {}]",
                name, lower, upper
            )));
        }
        self.problem.columns.push(LinearColumn {
            kind,
            lower,
            upper,
            name: name.to_string(),
        });
        Ok(self.problem.columns.len() - 1)
    }

    fn variable(&mut self, var: usize) -> LinearExpr {
        LinearExpr::column(var)
    }

    fn constant(&mut self, value: f64) -> LinearExpr {
        LinearExpr::constant(value)
    }

    fn weighted_sum(&mut self, terms: &[(f64, LinearExpr)], constant: f64) -> Result<LinearExpr> {
        let mut result = LinearExpr::constant(constant);
        for (coefficient, term) in terms {
            result.add_scaled(*coefficient, term);
        }
        Ok(result)
    }

    fn product(&mut self, lhs: &LinearExpr, rhs: &LinearExpr) -> Result<LinearExpr> {
        match (lhs.as_constant(), rhs.as_constant()) {
            (Some(factor), _) => Ok(rhs.scaled(factor)),
            (_, Some(factor)) => Ok(lhs.scaled(factor)),
            _ => Err(Self::unsupported("product of two variable expressions")),
        }
    }

    fn power(&mut self, base: &LinearExpr, exponent: &LinearExpr) -> Result<LinearExpr> {
        match (base.as_constant(), exponent.as_constant()) {
            (Some(b), Some(e)) => Ok(LinearExpr::constant(b.powf(e))),
            (_, Some(e)) if e == 1.0 => Ok(base.clone()),
            (_, Some(e)) if e == 0.0 => Ok(LinearExpr::constant(1.0)),
            _ => Err(Self::unsupported("power of a variable expression")),
        }
    }

    fn abs(&mut self, operand: &LinearExpr) -> Result<LinearExpr> {
        operand
            .as_constant()
            .map(|value| LinearExpr::constant(value.abs()))
            .ok_or_else(|| Self::unsupported("absolute value of a variable expression"))
    }

    fn add_constraint(
        &mut self,
        expr: &LinearExpr,
        lower: f64,
        upper: f64,
        name: &str,
    ) -> Result<()> {
        if expr.terms.is_empty() {
            let value = expr.constant;
            if (value < lower - self.tolerance || value > upper + self.tolerance)
                && self.contradiction.is_none()
            {
                self.contradiction = Some(name.to_string());
            }
            return Ok(());
        }
        self.problem.rows.push(LinearRow {
            terms: expr.terms.clone(),
            lower: lower - expr.constant,
            upper: upper - expr.constant,
            name: name.to_string(),
        });
        Ok(())
    }

    fn set_objective(&mut self, var: usize, sense: ObjectiveSense) -> Result<()> {
        if var >= self.problem.columns.len() {
            return Err(ModelError::Backend(format!("unknown column {}", var)));
        }
        self.problem.objective = match sense {
            ObjectiveSense::Feasible => None,
            _ => Some((var, sense)),
        };
        Ok(())
    }

    fn set_time_limit(&mut self, seconds: Option<f64>) {
        self.problem.time_limit = seconds;
    }

    fn set_node_limit(&mut self, nodes: Option<u64>) {
        self.problem.node_limit = nodes;
    }

    fn set_verbose(&mut self, verbose: bool) {
        self.problem.verbose = verbose;
    }

    fn solve(&mut self) -> Result<BackendStatus> {
        info!(
            "{}: solving {} columns, {} rows",
            E::NAME,
            self.problem.columns.len(),
            self.problem.rows.len()
        );
        if let Some(name) = &self.contradiction {
            info!("{}: constant constraint '{}' cannot hold", E::NAME, name);
            self.solution = None;
            return Ok(BackendStatus::Infeasible);
        }
        let outcome = E::optimise(&self.problem, self.tolerance)?;
        debug!("{}: engine status {}", E::NAME, outcome.status);
        self.solution = outcome
            .columns
            .filter(|columns| self.problem.accepts(columns, 10.0 * self.tolerance));
        Ok(outcome.status)
    }

    fn has_solution(&self) -> bool {
        self.solution.is_some()
    }

    fn value(&self, var: usize) -> Option<f64> {
        self.solution.as_ref()?.get(var).copied()
    }

    fn num_variables(&self) -> usize {
        self.problem.columns.len()
    }

    fn num_constraints(&self) -> usize {
        self.problem.rows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Rejecting;

    impl LinearEngine for Rejecting {
        const NAME: &'static str = "rejecting";
        const TOLERANCE: f64 = 1e-7;

        fn optimise(_: &LinearProblem, _: f64) -> Result<LinearOutcome> {
            Ok(LinearOutcome {
                status: BackendStatus::Unknown,
                columns: None,
            })
        }
    }

    #[test]
    fn affine_expressions_are_kept_in_normal_form() {
        let mut backend = LinearBackend::<Rejecting>::new();
        let x = backend.add_variable(VariableKind::Integer, 0.0, 10.0, "x").unwrap();
        let y = backend.add_variable(VariableKind::Integer, 0.0, 10.0, "y").unwrap();
        let (xe, ye) = (backend.variable(x), backend.variable(y));
        let sum = backend
            .weighted_sum(&[(2.0, xe.clone()), (1.0, ye.clone()), (-2.0, xe.clone())], 3.0)
            .unwrap();
        assert_eq!(sum.terms, vec![(y, 1.0)]);
        assert_eq!(sum.constant, 3.0);

        assert!(!backend.problem().verbose);
        backend.set_verbose(true);
        assert!(backend.problem().verbose);

        backend.add_constraint(&sum, 4.0, 8.0, "row").unwrap();
        let row = &backend.problem().rows[0];
        assert_eq!((row.lower, row.upper), (1.0, 5.0));
    }

    #[test]
    fn nonlinear_primitives_are_rejected() {
        let mut backend = LinearBackend::<Rejecting>::new();
        let x = backend.add_variable(VariableKind::Continuous, 0.0, 1.0, "x").unwrap();
        let xe = backend.variable(x);
        let error = backend.product(&xe, &xe).unwrap_err();
        assert!(matches!(error, ModelError::Lowering(message) if message.contains("unsupported")));
        assert!(backend.abs(&xe).is_err());
        let two = backend.constant(2.0);
        assert_eq!(backend.product(&two, &xe).unwrap().terms, vec![(x, 2.0)]);
    }

    #[test]
    fn constant_rows_that_cannot_hold_make_the_problem_infeasible() {
        let mut backend = LinearBackend::<Rejecting>::new();
        let five = backend.constant(5.0);
        backend.add_constraint(&five, 0.0, 6.0, "ok").unwrap();
        assert_eq!(backend.solve().unwrap(), BackendStatus::Unknown);
        backend.add_constraint(&five, 6.0, 7.0, "bad").unwrap();
        assert_eq!(backend.num_constraints(), 0);
        assert_eq!(backend.solve().unwrap(), BackendStatus::Infeasible);
    }
}
