use super::evaluator::{EvaluationError, Evaluator};
use super::expression::Expression;
use super::models::{Model, Sequence, Var};
use super::solver_service::{ModelError, Result};
use super::value_objects::{ObjectiveSense, SolutionStatus};

/// Slack used for bound, integrality and deduced-value diagnostics
const DIAGNOSTIC_TOLERANCE: f64 = 1e-6;

/// Assignment of values to the variables of a model
#[derive(Debug, Clone)]
pub struct Solution<'m> {
    model: &'m Model,
    values: Vec<Option<f64>>,
    status: SolutionStatus,
}

impl<'m> Solution<'m> {
    pub fn new(model: &'m Model) -> Self {
        Self {
            model,
            values: vec![None; model.variables().len()],
            status: SolutionStatus::Unknown,
        }
    }

    pub fn with_status(mut self, status: SolutionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn model(&self) -> &'m Model {
        self.model
    }

    pub fn status(&self) -> SolutionStatus {
        self.status
    }

    pub fn set_status(&mut self, status: SolutionStatus) {
        self.status = status;
    }

    pub fn is_optimal(&self) -> bool {
        self.status == SolutionStatus::Optimal
    }

    pub fn is_feasible(&self) -> bool {
        matches!(
            self.status,
            SolutionStatus::Optimal | SolutionStatus::Feasible
        )
    }

    pub(crate) fn values(&self) -> &[Option<f64>] {
        &self.values
    }

    pub fn set(&mut self, var: &Var, value: f64) -> Result<()> {
        if !self.model.owns(var) {
            return Err(ModelError::Construction(format!(
                "variable '{}' belongs to another model",
                var.name()
            )));
        }
        self.values[var.index()] = Some(value);
        Ok(())
    }

    pub fn set_sequence(&mut self, sequence: &Sequence, values: &[f64]) -> Result<()> {
        if values.len() != sequence.len() {
            return Err(ModelError::Construction(format!(
                "sequence '{}' has {} members but {} values were given",
                sequence.name(),
                sequence.len(),
                values.len()
            )));
        }
        for (member, value) in sequence.members().iter().zip(values) {
            self.set(member, *value)?;
        }
        Ok(())
    }

    /// Stored value, or the value of the variable's definition
    pub fn get(&self, var: &Var) -> Option<f64> {
        if !self.model.owns(var) {
            return None;
        }
        self.evaluator().value_of(var).ok()
    }

    pub fn get_sequence(&self, sequence: &Sequence) -> Option<Vec<f64>> {
        sequence
            .members()
            .iter()
            .map(|member| self.get(member))
            .collect()
    }

    /// `None` for feasibility problems or when the objective cannot be evaluated
    pub fn objective_value(&self) -> Option<f64> {
        let objective = self.model.objective();
        if objective.sense == ObjectiveSense::Feasible {
            return None;
        }
        objective
            .expression
            .as_ref()
            .and_then(|expression| self.evaluate(expression))
    }

    pub fn evaluate(&self, expression: &Expression) -> Option<f64> {
        self.evaluator().evaluate(expression).ok()
    }

    pub fn try_evaluate(&self, expression: &Expression) -> Result<f64> {
        Ok(self.evaluator().evaluate(expression)?)
    }

    /// Every non-deduced variable, family and sequence members included, has a value
    pub fn complete(&self) -> bool {
        self.model
            .variables()
            .iter()
            .zip(&self.values)
            .all(|(variable, value)| variable.is_deduced() || value.is_some())
    }

    /// Human-readable description of everything wrong with the assignment
    pub fn errors(&self) -> Vec<String> {
        let evaluator = self.evaluator();
        let mut errors = Vec::new();

        for var in self.model.handles() {
            let variable = self.model.variable(&var);
            let Some(value) = self.values[var.index()] else {
                continue;
            };
            if value < variable.lower_bound - DIAGNOSTIC_TOLERANCE
                || value > variable.upper_bound + DIAGNOSTIC_TOLERANCE
            {
                errors.push(format!(
                    "'{}' = {} is outside its bounds [{}, {}]",
                    var.name(),
                    value,
                    variable.lower_bound,
                    variable.upper_bound
                ));
            }
            if variable.is_integral() && (value - value.round()).abs() > DIAGNOSTIC_TOLERANCE {
                errors.push(format!(
                    "'{}' = {} is not integral ({})",
                    var.name(),
                    value,
                    variable.variable_type
                ));
            }
            if let Some(definition) = &variable.deduced_from {
                if let Ok(deduced) = evaluator.evaluate(definition) {
                    if (deduced - value).abs() > DIAGNOSTIC_TOLERANCE {
                        errors.push(format!(
                            "'{}' = {} but its definition '{}' evaluates to {}",
                            var.name(),
                            value,
                            definition,
                            deduced
                        ));
                    }
                }
            }
        }

        for sequence in self.model.sequences() {
            if let Some(mut values) = self.get_sequence(sequence) {
                values.sort_by(f64::total_cmp);
                let permutation = values
                    .iter()
                    .enumerate()
                    .all(|(position, value)| *value == (position + 1) as f64);
                if !permutation {
                    errors.push(format!(
                        "sequence '{}' is not a permutation of 1..{}",
                        sequence.name(),
                        sequence.len()
                    ));
                }
            }
        }

        for constraint in self.model.constraints() {
            match evaluator.is_true(&constraint.expression) {
                Ok(true) => {}
                Ok(false) => errors.push(format!("constraint '{}' is violated", constraint.label())),
                Err(EvaluationError::Missing(name)) => errors.push(format!(
                    "constraint '{}' cannot be evaluated: no value for '{}'",
                    constraint.label(),
                    name
                )),
                Err(error) => errors.push(format!(
                    "constraint '{}' is violated: {}",
                    constraint.label(),
                    error
                )),
            }
        }

        errors
    }

    fn evaluator(&self) -> Evaluator<'_> {
        Evaluator::over(self.model, &self.values)
    }
}
