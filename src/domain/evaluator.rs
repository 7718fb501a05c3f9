//! Exact semantics of the expression model over an assignment.
//!
//! Comparisons are exact here; tolerances only enter at lowering time.

use super::expression::Expression;
use super::models::{Model, Var};
use super::registry::Builtin;
use super::solution::Solution;
use super::solver_service::ModelError;
use super::value_objects::Operator;

/// Why an expression has no value under an assignment
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvaluationError {
    #[error("no value for '{0}'")]
    Missing(String),

    #[error("division by zero in '{0}'")]
    DivisionByZero(String),

    #[error("index {index} is out of range in '{expression}'")]
    InvalidIndex { index: f64, expression: String },

    #[error("{0} of an empty list")]
    EmptyAggregate(String),

    #[error("collection {key}: {message}")]
    Collection { key: usize, message: String },

    #[error("unsupported operator '{0}'")]
    Unsupported(String),
}

/// Aggregates that accept a `collection(k)` operand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Aggregate {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl Aggregate {
    pub fn from_builtin(builtin: Builtin) -> Option<Self> {
        match builtin {
            Builtin::Count => Some(Aggregate::Count),
            Builtin::Sum => Some(Aggregate::Sum),
            Builtin::Avg => Some(Aggregate::Avg),
            Builtin::Min => Some(Aggregate::Min),
            Builtin::Max => Some(Aggregate::Max),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Aggregate::Count => "count",
            Aggregate::Sum => "sum",
            Aggregate::Avg => "avg",
            Aggregate::Min => "min",
            Aggregate::Max => "max",
        }
    }

    /// `count` and `sum` of nothing are 0; the others fail
    pub fn apply(&self, values: &[f64]) -> Result<f64, EvaluationError> {
        if values.is_empty() && !matches!(self, Aggregate::Count | Aggregate::Sum) {
            return Err(EvaluationError::EmptyAggregate(self.name().to_string()));
        }
        let value = match self {
            Aggregate::Count => values.len() as f64,
            Aggregate::Sum => values.iter().sum(),
            Aggregate::Avg => values.iter().sum::<f64>() / values.len() as f64,
            Aggregate::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Aggregate::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        };
        Ok(value)
    }
}

/// Integral value check used for keys and indices
pub(crate) fn as_integer(value: f64) -> Option<i64> {
    let rounded = value.round();
    if value.is_finite() && (value - rounded).abs() <= 1e-9 {
        Some(rounded as i64)
    } else {
        None
    }
}

fn truth(value: f64) -> bool {
    value != 0.0
}

fn indicator(condition: bool) -> f64 {
    if condition {
        1.0
    } else {
        0.0
    }
}

/// Evaluates expressions of `model` over the values of a solution
pub struct Evaluator<'a> {
    model: &'a Model,
    values: &'a [Option<f64>],
}

impl<'a> Evaluator<'a> {
    pub fn new(model: &'a Model, solution: &'a Solution<'_>) -> Self {
        Self {
            model,
            values: solution.values(),
        }
    }

    pub(crate) fn over(model: &'a Model, values: &'a [Option<f64>]) -> Self {
        Self { model, values }
    }

    /// Stored value if present, otherwise the deduced definition
    pub fn value_of(&self, var: &Var) -> Result<f64, EvaluationError> {
        if let Some(Some(value)) = self.values.get(var.index()) {
            return Ok(*value);
        }
        match &self.model.variable(var).deduced_from {
            Some(definition) => self.evaluate(definition),
            None => Err(EvaluationError::Missing(var.name().to_string())),
        }
    }

    pub fn is_true(&self, expression: &Expression) -> Result<bool, EvaluationError> {
        self.evaluate(expression).map(truth)
    }

    pub fn evaluate(&self, expression: &Expression) -> Result<f64, EvaluationError> {
        match expression {
            Expression::Constant(value) => Ok(*value),
            Expression::Variable(var) => self.value_of(var),
            Expression::Indexed(indexed) => {
                let members = self.model.family_members(indexed.family());
                let index = self.value_of(indexed.index())?;
                let position = self.position(index, 0, members.len(), expression)?;
                self.value_of(&members[position])
            }
            Expression::Operation(_) => self.evaluate_operation(expression),
        }
    }

    fn evaluate_operation(&self, expression: &Expression) -> Result<f64, EvaluationError> {
        let operands = expression.operands();
        let operator = match expression.operator() {
            Some(operator) => operator,
            None => {
                return Err(EvaluationError::Unsupported(expression.stringify()));
            }
        };
        match operator {
            Operator::None => self.evaluate(&operands[0]),
            Operator::Negate => Ok(-self.evaluate(&operands[0])?),
            Operator::Add => self.values_of(operands).map(|values| values.iter().sum()),
            Operator::Subtract => {
                Ok(self.evaluate(&operands[0])? - self.evaluate(&operands[1])?)
            }
            Operator::Multiply => self
                .values_of(operands)
                .map(|values| values.iter().product()),
            Operator::Divide => {
                let numerator = self.evaluate(&operands[0])?;
                let denominator = self.evaluate(&operands[1])?;
                if denominator == 0.0 {
                    return Err(EvaluationError::DivisionByZero(expression.stringify()));
                }
                Ok(numerator / denominator)
            }
            Operator::LogicalNot => Ok(indicator(!self.is_true(&operands[0])?)),
            Operator::LogicalAnd => {
                let values = self.values_of(operands)?;
                Ok(indicator(values.into_iter().all(truth)))
            }
            Operator::LogicalOr => {
                let values = self.values_of(operands)?;
                Ok(indicator(values.into_iter().any(truth)))
            }
            comparison if comparison.is_comparison() => {
                let lhs = self.evaluate(&operands[0])?;
                let rhs = self.evaluate(&operands[1])?;
                let holds = match comparison {
                    Operator::LessThan => lhs < rhs,
                    Operator::LessOrEqual => lhs <= rhs,
                    Operator::GreaterThan => lhs > rhs,
                    Operator::GreaterOrEqual => lhs >= rhs,
                    Operator::Equal => lhs == rhs,
                    _ => lhs != rhs,
                };
                Ok(indicator(holds))
            }
            Operator::Collection => Err(EvaluationError::Unsupported(format!(
                "{} outside an aggregate",
                expression
            ))),
            Operator::At => {
                let values = self.collection_of(&operands[0])?;
                let index = self.evaluate(&operands[1])?;
                let position = self.position(index, 1, values.len(), expression)?;
                Ok(values[position])
            }
            Operator::Custom(custom) => match custom.as_builtin() {
                Some(builtin) => self.evaluate_builtin(builtin, expression),
                None => Err(EvaluationError::Unsupported(custom.name())),
            },
            _ => Err(EvaluationError::Unsupported(format!("{:?}", operator))),
        }
    }

    fn evaluate_builtin(
        &self,
        builtin: Builtin,
        expression: &Expression,
    ) -> Result<f64, EvaluationError> {
        let operands = expression.operands();
        if let Some(aggregate) = Aggregate::from_builtin(builtin) {
            if operands.len() == 1 && operands[0].collection_key().is_some() {
                return aggregate.apply(&self.collection_of(&operands[0])?);
            }
            if aggregate == Aggregate::Count {
                // arity, fixed when the node was built
                return Ok(operands.len() as f64);
            }
            return aggregate.apply(&self.values_of(operands)?);
        }
        match builtin {
            Builtin::Abs => Ok(self.evaluate(&operands[0])?.abs()),
            Builtin::Pow => {
                let base = self.evaluate(&operands[0])?;
                let exponent = self.evaluate(&operands[1])?;
                Ok(base.powf(exponent))
            }
            Builtin::IfThenElse => {
                if self.is_true(&operands[0])? {
                    self.evaluate(&operands[1])
                } else {
                    self.evaluate(&operands[2])
                }
            }
            Builtin::NAryIf => {
                for branch in operands[..operands.len() - 1].chunks(2) {
                    if self.is_true(&branch[0])? {
                        return self.evaluate(&branch[1]);
                    }
                }
                self.evaluate(&operands[operands.len() - 1])
            }
            Builtin::ElementOf | Builtin::NotElementOf => {
                let value = self.evaluate(&operands[0])?;
                let members = self.collection_of(&operands[1])?;
                let contained = members.contains(&value);
                Ok(indicator(contained == (builtin == Builtin::ElementOf)))
            }
            Builtin::At => {
                let index = self.evaluate(&operands[0])?;
                if operands.len() == 2 && operands[1].collection_key().is_some() {
                    let values = self.collection_of(&operands[1])?;
                    let position = self.position(index, 1, values.len(), expression)?;
                    return Ok(values[position]);
                }
                let values = &operands[1..];
                let position = self.position(index, 1, values.len(), expression)?;
                self.evaluate(&values[position])
            }
            other => Err(EvaluationError::Unsupported(other.name().to_string())),
        }
    }

    fn values_of(&self, operands: &[Expression]) -> Result<Vec<f64>, EvaluationError> {
        operands.iter().map(|operand| self.evaluate(operand)).collect()
    }

    fn collection_of(&self, collection: &Expression) -> Result<Vec<f64>, EvaluationError> {
        let key_expression = collection.collection_key().ok_or_else(|| {
            EvaluationError::Unsupported(format!("'{}' is not a collection", collection))
        })?;
        let key = self.evaluate(key_expression)?;
        let key = match as_integer(key) {
            Some(key) if key >= 0 => key as usize,
            _ => {
                return Err(EvaluationError::InvalidIndex {
                    index: key,
                    expression: collection.stringify(),
                })
            }
        };
        self.model.get_collection(key).map_err(|error| match error {
            ModelError::Collection { key, message } => EvaluationError::Collection { key, message },
            other => EvaluationError::Collection {
                key,
                message: other.to_string(),
            },
        })
    }

    /// Convert an index with the given base into a slice position
    fn position(
        &self,
        index: f64,
        base: i64,
        len: usize,
        expression: &Expression,
    ) -> Result<usize, EvaluationError> {
        match as_integer(index) {
            Some(value) if value >= base && ((value - base) as usize) < len => {
                Ok((value - base) as usize)
            }
            _ => Err(EvaluationError::InvalidIndex {
                index,
                expression: expression.stringify(),
            }),
        }
    }
}
