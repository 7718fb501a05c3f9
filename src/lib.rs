// Domain layer: expression model, evaluation and solutions
pub mod domain;

// Application layer: MIP/NLP and CP lowerings
pub mod application;

// Solver back-ends: contracts, reference solver and SDK adapters
pub mod solver;

// Re-export commonly used types
pub use domain::{
    Expression, Family, Model, ModelError, ObjectiveSense, Sequence, Solution, SolutionStatus,
    SolverBackend, SolverConfig, SolverService, Var, VariableType,
};

pub use application::{CpAdapter, MipAdapter};

pub use solver::{ReferenceSolver, SolverFactory};
