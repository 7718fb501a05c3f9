// Domain service interface for solving models
// Defines the contract that every lowering adapter follows and the errors they share

use super::evaluator::EvaluationError;
use super::solution::Solution;

/// Error types of the modelling layer
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// Rejected at the builder call: duplicate names, arity, bad bounds
    #[error("Invalid model: {0}")]
    Construction(String),

    /// Model cannot be translated for the chosen back-end
    #[error("Lowering failed: {0}")]
    Lowering(String),

    #[error("Collection {key}: {message}")]
    Collection { key: usize, message: String },

    #[error("Evaluation failed: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Problem is infeasible: {0}")]
    Infeasible(String),

    #[error("Problem is unbounded: {0}")]
    Unbounded(String),

    #[error("Solver execution failed: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;

/// Lowered model ready to be solved.
///
/// Implementations borrow the model they were built from; the solutions they
/// return borrow the same model and outlive the adapter itself.
pub trait SolverService<'m> {
    /// Run the back-end and read the assignment back
    fn solve(&mut self) -> Result<Solution<'m>>;

    /// Get the name of this solver backend
    fn name(&self) -> &str;
}
