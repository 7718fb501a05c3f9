// Back-end contracts targeted by the two lowerings
//
// `MipBackend` only offers arithmetic, products, powers, absolute value and
// two-sided range constraints; everything else is rebuilt from those by the
// MIP lowering. `CpBackend` offers native logic, comparisons, element and
// permutation lists.

use std::fmt;

use crate::domain::{ModelError, ObjectiveSense, Result, SolutionStatus};

/// Domain class of a back-end decision variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    Continuous,
    Integer,
    Binary,
}

/// Outcome reported by a back-end after `solve`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    Optimal,
    /// Time limit reached
    TimeLimit,
    /// Node limit reached
    NodeLimit,
    /// Interrupted, or stopped by any other resource limit
    Interrupted,
    Infeasible,
    Unbounded,
    /// Presolve proved one of the two without telling which
    InfeasibleOrUnbounded,
    Unknown,
}

impl BackendStatus {
    /// Stopped early; an incumbent may or may not exist
    pub fn is_limit(&self) -> bool {
        matches!(
            self,
            BackendStatus::TimeLimit | BackendStatus::NodeLimit | BackendStatus::Interrupted
        )
    }

    /// Status of the solution read back from `backend`, or the error a
    /// definitive negative answer turns into
    pub fn to_solution_status(
        self,
        has_solution: bool,
        model: &str,
        backend: &str,
    ) -> Result<SolutionStatus> {
        match self {
            BackendStatus::Optimal => Ok(SolutionStatus::Optimal),
            BackendStatus::Infeasible => Err(ModelError::Infeasible(format!(
                "{} found no assignment for '{}'",
                backend, model
            ))),
            BackendStatus::Unbounded => Err(ModelError::Unbounded(format!(
                "objective of '{}' is unbounded",
                model
            ))),
            BackendStatus::InfeasibleOrUnbounded => Err(ModelError::Infeasible(format!(
                "{} proved '{}' infeasible or unbounded",
                backend, model
            ))),
            limit if limit.is_limit() && has_solution => Ok(SolutionStatus::Feasible),
            _ => Ok(SolutionStatus::Unknown),
        }
    }
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendStatus::Optimal => write!(f, "Optimal"),
            BackendStatus::TimeLimit => write!(f, "Time Limit Reached"),
            BackendStatus::NodeLimit => write!(f, "Node Limit Reached"),
            BackendStatus::Interrupted => write!(f, "Interrupted"),
            BackendStatus::Infeasible => write!(f, "Infeasible"),
            BackendStatus::Unbounded => write!(f, "Unbounded"),
            BackendStatus::InfeasibleOrUnbounded => write!(f, "Infeasible or Unbounded"),
            BackendStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Arithmetic-only back-end (MIP/NLP)
pub trait MipBackend {
    type Var: Copy + fmt::Debug + PartialEq;
    type Expr: Clone + fmt::Debug + PartialEq;

    fn name(&self) -> &str;

    /// Slack the back-end allows on every constraint
    fn feasibility_tolerance(&self) -> f64;

    fn set_feasibility_tolerance(&mut self, tolerance: f64);

    fn add_variable(
        &mut self,
        kind: VariableKind,
        lower: f64,
        upper: f64,
        name: &str,
    ) -> Result<Self::Var>;

    fn variable(&mut self, var: Self::Var) -> Self::Expr;

    fn constant(&mut self, value: f64) -> Self::Expr;

    /// `constant + Σ coefficient·term`
    fn weighted_sum(&mut self, terms: &[(f64, Self::Expr)], constant: f64) -> Result<Self::Expr>;

    fn product(&mut self, lhs: &Self::Expr, rhs: &Self::Expr) -> Result<Self::Expr>;

    fn power(&mut self, base: &Self::Expr, exponent: &Self::Expr) -> Result<Self::Expr>;

    fn abs(&mut self, operand: &Self::Expr) -> Result<Self::Expr>;

    /// `lower <= expr <= upper`
    fn add_constraint(
        &mut self,
        expr: &Self::Expr,
        lower: f64,
        upper: f64,
        name: &str,
    ) -> Result<()>;

    /// Objective is `var` with unit coefficient
    fn set_objective(&mut self, var: Self::Var, sense: ObjectiveSense) -> Result<()>;

    fn set_time_limit(&mut self, seconds: Option<f64>);

    fn set_node_limit(&mut self, nodes: Option<u64>);

    /// Report solver progress (engine output, incumbents)
    fn set_verbose(&mut self, verbose: bool);

    fn solve(&mut self) -> Result<BackendStatus>;

    /// An assignment is available after the last `solve`
    fn has_solution(&self) -> bool;

    fn value(&self, var: Self::Var) -> Option<f64>;

    fn num_variables(&self) -> usize;

    fn num_constraints(&self) -> usize;
}

/// Native operators of a CP back-end; comparisons and connectives yield 0/1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpOperator {
    Sum,
    Subtract,
    Product,
    Divide,
    Negate,
    Power,
    Abs,
    Min,
    Max,
    Not,
    And,
    Or,
    LessThan,
    LessOrEqual,
    GreaterThan,
    GreaterOrEqual,
    Equal,
    NotEqual,
    /// `(condition, then, otherwise)`
    IfThenElse,
}

/// Constraint-programming back-end with native high-level primitives
pub trait CpBackend {
    type Expr: Clone + fmt::Debug + PartialEq;
    type List: Clone + fmt::Debug;

    fn name(&self) -> &str;

    fn add_variable(
        &mut self,
        kind: VariableKind,
        lower: f64,
        upper: f64,
        name: &str,
    ) -> Result<Self::Expr>;

    /// List variable holding a permutation of `0..length` (full use)
    fn add_list(&mut self, length: usize, name: &str) -> Result<Self::List>;

    /// Value stored at `position` of the list, 0-based
    fn list_at(&mut self, list: &Self::List, position: usize) -> Result<Self::Expr>;

    fn constant(&mut self, value: f64) -> Self::Expr;

    fn apply(&mut self, operator: CpOperator, operands: &[Self::Expr]) -> Result<Self::Expr>;

    /// `array[index]`, 0-based
    fn element(&mut self, array: &[Self::Expr], index: &Self::Expr) -> Result<Self::Expr>;

    /// `expr` must hold (be non-zero)
    fn add_constraint(&mut self, expr: &Self::Expr, name: &str) -> Result<()>;

    fn set_objective(&mut self, expr: &Self::Expr, sense: ObjectiveSense) -> Result<()>;

    fn set_time_limit(&mut self, seconds: Option<f64>);

    fn set_node_limit(&mut self, nodes: Option<u64>);

    fn set_verbose(&mut self, verbose: bool);

    fn solve(&mut self) -> Result<BackendStatus>;

    fn has_solution(&self) -> bool;

    fn value(&self, expr: &Self::Expr) -> Option<f64>;

    fn list_value(&self, list: &Self::List) -> Option<Vec<usize>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_onto_solutions_and_errors() {
        let map = |status: BackendStatus, has_solution| {
            status.to_solution_status(has_solution, "m", "engine")
        };
        assert_eq!(map(BackendStatus::Optimal, true).unwrap(), SolutionStatus::Optimal);
        assert_eq!(map(BackendStatus::NodeLimit, true).unwrap(), SolutionStatus::Feasible);
        assert_eq!(map(BackendStatus::TimeLimit, false).unwrap(), SolutionStatus::Unknown);
        assert_eq!(map(BackendStatus::Unknown, true).unwrap(), SolutionStatus::Unknown);
        assert!(matches!(
            map(BackendStatus::Infeasible, false),
            Err(ModelError::Infeasible(_))
        ));
        assert!(matches!(
            map(BackendStatus::Unbounded, false),
            Err(ModelError::Unbounded(_))
        ));
        match map(BackendStatus::InfeasibleOrUnbounded, false) {
            Err(ModelError::Infeasible(message)) => {
                assert!(message.contains("infeasible or unbounded"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
