// Domain value objects representing core modelling concepts

use std::fmt;

use super::registry::CustomOperator;

/// Type of a model variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableType {
    /// Boolean variable (x ∈ {0, 1})
    Boolean,
    /// Integer number (x ∈ ℤ)
    Integer,
    /// Real number (x ∈ ℝ)
    Real,
}

impl VariableType {
    pub fn is_integral(&self) -> bool {
        matches!(self, VariableType::Boolean | VariableType::Integer)
    }
}

impl fmt::Display for VariableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableType::Boolean => write!(f, "boolean"),
            VariableType::Integer => write!(f, "integer"),
            VariableType::Real => write!(f, "real"),
        }
    }
}

/// Direction of optimization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObjectiveSense {
    /// Any feasible assignment will do
    #[default]
    Feasible,
    /// Minimize the objective expression
    Minimize,
    /// Maximize the objective expression
    Maximize,
}

impl fmt::Display for ObjectiveSense {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectiveSense::Feasible => write!(f, "feasible"),
            ObjectiveSense::Minimize => write!(f, "minimize"),
            ObjectiveSense::Maximize => write!(f, "maximize"),
        }
    }
}

/// Status of a solution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SolutionStatus {
    /// Nothing is known about the assignment
    #[default]
    Unknown,
    /// Found feasible solution (may not be optimal)
    Feasible,
    /// Found optimal solution
    Optimal,
    /// Problem has no feasible solution
    Infeasible,
    /// Objective can be improved infinitely
    Unbounded,
}

impl fmt::Display for SolutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolutionStatus::Unknown => write!(f, "Unknown"),
            SolutionStatus::Feasible => write!(f, "Feasible"),
            SolutionStatus::Optimal => write!(f, "Optimal"),
            SolutionStatus::Infeasible => write!(f, "Infeasible"),
            SolutionStatus::Unbounded => write!(f, "Unbounded"),
        }
    }
}

/// Operator tag of an expression node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    /// Identity wrapper
    None,
    Negate,
    Add,
    Subtract,
    Multiply,
    Divide,
    LogicalNot,
    LogicalAnd,
    LogicalOr,
    LessThan,
    LessOrEqual,
    GreaterThan,
    GreaterOrEqual,
    Equal,
    NotEqual,
    /// Unary wrapper around a collection key
    Collection,
    /// `collection(k)[i]`, 1-based
    At,
    /// Named builtin looked up in the operator registry
    Custom(CustomOperator),
}

impl Operator {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            Operator::LessThan
                | Operator::LessOrEqual
                | Operator::GreaterThan
                | Operator::GreaterOrEqual
                | Operator::Equal
                | Operator::NotEqual
        )
    }

    pub fn is_logical(&self) -> bool {
        matches!(
            self,
            Operator::LogicalNot | Operator::LogicalAnd | Operator::LogicalOr
        )
    }

    /// Infix symbol used by the canonical string form
    pub fn symbol(&self) -> Option<&'static str> {
        let symbol = match self {
            Operator::Add => "+",
            Operator::Subtract => "-",
            Operator::Multiply => "*",
            Operator::Divide => "/",
            Operator::LogicalAnd => "&&",
            Operator::LogicalOr => "||",
            Operator::LessThan => "<",
            Operator::LessOrEqual => "<=",
            Operator::GreaterThan => ">",
            Operator::GreaterOrEqual => ">=",
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
            _ => return None,
        };
        Some(symbol)
    }
}

/// Solver backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SolverBackend {
    /// Automatically select best solver
    #[default]
    Auto,
    /// MIP/NLP lowering onto the reference solver
    Mip,
    /// CP lowering onto the reference solver
    Cp,
    /// MIP lowering onto HiGHS (linear models only)
    Highs,
    /// MIP lowering onto COIN-OR CBC (linear models only)
    CoinCbc,
}

impl fmt::Display for SolverBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolverBackend::Auto => write!(f, "Auto"),
            SolverBackend::Mip => write!(f, "Reference MIP"),
            SolverBackend::Cp => write!(f, "Reference CP"),
            SolverBackend::Highs => write!(f, "HiGHS"),
            SolverBackend::CoinCbc => write!(f, "COIN-OR CBC"),
        }
    }
}
