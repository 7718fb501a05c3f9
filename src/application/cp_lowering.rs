// CP lowering of a model
//
// Comparisons, connectives, min/max, conditionals and element are native, so
// the IR maps onto the back-end almost node for node. Truth of a numeric
// operand is `x != 0`; sequences are permutation lists shifted to start at 1.

use std::collections::HashMap;

use log::{debug, info, warn};

use super::collections::{integer_domain, key_domain, Collections, IntegerDomain};
use crate::domain::evaluator::Aggregate;
use crate::domain::{
    Builtin, Expression, IndexedVar, Model, ModelError, ObjectiveSense, Operator, Result,
    Solution, SolverConfig, SolverService, Var, VariableOrigin, VariableType,
};
use crate::solver::backend::{CpBackend, CpOperator, VariableKind};

fn variable_kind(variable_type: VariableType) -> VariableKind {
    match variable_type {
        VariableType::Boolean => VariableKind::Binary,
        VariableType::Integer => VariableKind::Integer,
        VariableType::Real => VariableKind::Continuous,
    }
}

fn native(operator: Operator) -> Option<CpOperator> {
    let native = match operator {
        Operator::Negate => CpOperator::Negate,
        Operator::Add => CpOperator::Sum,
        Operator::Subtract => CpOperator::Subtract,
        Operator::Multiply => CpOperator::Product,
        Operator::Divide => CpOperator::Divide,
        Operator::LessThan => CpOperator::LessThan,
        Operator::LessOrEqual => CpOperator::LessOrEqual,
        Operator::GreaterThan => CpOperator::GreaterThan,
        Operator::GreaterOrEqual => CpOperator::GreaterOrEqual,
        Operator::Equal => CpOperator::Equal,
        Operator::NotEqual => CpOperator::NotEqual,
        _ => return None,
    };
    Some(native)
}

/// Model lowered into a [`CpBackend`]
pub struct CpAdapter<'m, B: CpBackend> {
    model: &'m Model,
    backend: B,
    config: SolverConfig,
    variables: Vec<B::Expr>,
    lists: Vec<B::List>,
    memo: HashMap<usize, B::Expr>,
    lookups: HashMap<(usize, usize), B::Expr>,
    collections: Collections<'m>,
    /// Memoized operation nodes, kept alive so their addresses stay unique
    pinned: Vec<Expression>,
}

impl<'m, B: CpBackend> CpAdapter<'m, B> {
    pub fn new(model: &'m Model, mut backend: B, config: SolverConfig) -> Result<Self> {
        if config.feasibility_tolerance.is_some() {
            warn!("{} ignores the feasibility tolerance override", backend.name());
        }
        backend.set_time_limit(config.time_limit);
        backend.set_node_limit(config.node_limit);
        backend.set_verbose(config.verbose);

        let mut adapter = Self {
            model,
            backend,
            config,
            variables: Vec::with_capacity(model.variables().len()),
            lists: Vec::with_capacity(model.sequences().len()),
            memo: HashMap::new(),
            lookups: HashMap::new(),
            collections: Collections::new(model),
            pinned: Vec::new(),
        };
        adapter.lower_model()?;
        Ok(adapter)
    }

    pub fn model(&self) -> &'m Model {
        self.model
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn lower_model(&mut self) -> Result<()> {
        let model = self.model;
        let mut members = HashMap::new();
        for sequence in model.sequences() {
            let list = self.backend.add_list(sequence.len(), sequence.name())?;
            let one = self.backend.constant(1.0);
            for (position, member) in sequence.members().iter().enumerate() {
                let slot = self.backend.list_at(&list, position)?;
                let value = self.backend.apply(CpOperator::Sum, &[slot, one.clone()])?;
                members.insert(member.index(), value);
            }
            self.lists.push(list);
        }

        for var in model.handles() {
            let value = match members.remove(&var.index()) {
                Some(value) => value,
                None => {
                    let variable = model.variable(&var);
                    self.backend.add_variable(
                        variable_kind(variable.variable_type),
                        variable.lower_bound,
                        variable.upper_bound,
                        var.name(),
                    )?
                }
            };
            self.variables.push(value);
        }

        for var in model.handles() {
            if let Some(definition) = &model.variable(&var).deduced_from {
                let value = self.lower(definition)?;
                let deduced = self.variables[var.index()].clone();
                let defined = self.backend.apply(CpOperator::Equal, &[deduced, value])?;
                self.backend
                    .add_constraint(&defined, &format!("{}.definition", var.name()))?;
            }
        }
        for constraint in model.constraints() {
            let holds = self.truth(&constraint.expression)?;
            self.backend.add_constraint(&holds, &constraint.label())?;
        }

        let objective = model.objective();
        if let (Some(expression), ObjectiveSense::Minimize | ObjectiveSense::Maximize) =
            (&objective.expression, objective.sense)
        {
            let value = self.lower(expression)?;
            self.backend.set_objective(&value, objective.sense)?;
        }

        debug!(
            "lowered '{}' into {}: {} variables, {} lists, {} memoized nodes",
            model.name(),
            self.backend.name(),
            self.variables.len(),
            self.lists.len(),
            self.memo.len()
        );
        Ok(())
    }

    /// Back-end expression for `expression`, built once per node
    pub fn lower(&mut self, expression: &Expression) -> Result<B::Expr> {
        let Some(id) = expression.node_id() else {
            return self.lower_leaf(expression);
        };
        if let Some(lowered) = self.memo.get(&id) {
            return Ok(lowered.clone());
        }
        let lowered = self.lower_operation(expression)?;
        self.pinned.push(expression.clone());
        self.memo.insert(id, lowered.clone());
        Ok(lowered)
    }

    fn lower_leaf(&mut self, expression: &Expression) -> Result<B::Expr> {
        match expression {
            Expression::Constant(value) => Ok(self.backend.constant(*value)),
            Expression::Variable(var) => self.lower_variable(var),
            Expression::Indexed(indexed) => self.lower_indexed(indexed),
            Expression::Operation(_) => self.lower_operation(expression),
        }
    }

    fn lower_variable(&self, var: &Var) -> Result<B::Expr> {
        if !self.model.owns(var) {
            return Err(ModelError::Lowering(format!(
                "variable '{}' belongs to another model",
                var.name()
            )));
        }
        Ok(self.variables[var.index()].clone())
    }

    fn lower_all(&mut self, operands: &[Expression]) -> Result<Vec<B::Expr>> {
        operands.iter().map(|operand| self.lower(operand)).collect()
    }

    /// Native 0/1 truth of `expression`
    fn truth(&mut self, expression: &Expression) -> Result<B::Expr> {
        let value = self.lower(expression)?;
        if expression.is_boolean_valued() {
            return Ok(value);
        }
        let zero = self.backend.constant(0.0);
        self.backend.apply(CpOperator::NotEqual, &[value, zero])
    }

    fn truths(&mut self, operands: &[Expression]) -> Result<Vec<B::Expr>> {
        operands.iter().map(|operand| self.truth(operand)).collect()
    }

    /// `index - offset`, the 0-based position native element expects
    fn shifted(&mut self, index: B::Expr, offset: i64) -> Result<B::Expr> {
        if offset == 0 {
            return Ok(index);
        }
        let offset = self.backend.constant(offset as f64);
        self.backend.apply(CpOperator::Subtract, &[index, offset])
    }

    fn constants(&mut self, values: &[f64]) -> Vec<B::Expr> {
        values.iter().map(|value| self.backend.constant(*value)).collect()
    }

    fn lower_operation(&mut self, expression: &Expression) -> Result<B::Expr> {
        let operands = expression.operands();
        let Some(operator) = expression.operator() else {
            return Err(ModelError::Lowering(format!(
                "'{}' is not an operation",
                expression
            )));
        };
        match operator {
            Operator::None => self.lower(&operands[0]),
            Operator::LogicalNot => {
                let value = self.truth(&operands[0])?;
                self.backend.apply(CpOperator::Not, &[value])
            }
            Operator::LogicalAnd => {
                let truths = self.truths(operands)?;
                self.backend.apply(CpOperator::And, &truths)
            }
            Operator::LogicalOr => {
                let truths = self.truths(operands)?;
                self.backend.apply(CpOperator::Or, &truths)
            }
            Operator::Collection => Err(ModelError::Lowering(format!(
                "'{}' outside a collection-aware operator",
                expression
            ))),
            Operator::At => {
                let key = operands[0].collection_key().ok_or_else(|| {
                    ModelError::Lowering(format!("left side of '{}' is not a collection", expression))
                })?;
                self.lower_lookup(key, &operands[1])
            }
            Operator::Custom(custom) => match custom.as_builtin() {
                Some(builtin) => self.lower_builtin(builtin, expression),
                None => Err(ModelError::Lowering(format!(
                    "custom operator '{}' is not supported",
                    custom.name()
                ))),
            },
            other => match native(other) {
                Some(native) => {
                    let values = self.lower_all(operands)?;
                    self.backend.apply(native, &values)
                }
                None => Err(ModelError::Lowering(format!(
                    "operator {:?} is not supported",
                    other
                ))),
            },
        }
    }

    /// `family[index]`, 0-based
    fn lower_indexed(&mut self, indexed: &IndexedVar) -> Result<B::Expr> {
        let key = (indexed.family().index(), indexed.index().index());
        if let Some(lowered) = self.lookups.get(&key) {
            return Ok(lowered.clone());
        }
        if indexed.family().index() >= self.model.families().len() {
            return Err(ModelError::Lowering(format!(
                "family '{}' belongs to another model",
                indexed.family().name()
            )));
        }
        let index = self.lower_variable(indexed.index())?;
        let model = self.model;
        let members = model
            .family_members(indexed.family())
            .iter()
            .map(|member| self.lower_variable(member))
            .collect::<Result<Vec<_>>>()?;
        if members.is_empty() {
            return Err(ModelError::Lowering(format!(
                "lookup into the empty family '{}'",
                indexed.family().name()
            )));
        }
        let lowered = self.backend.element(&members, &index)?;
        self.lookups.insert(key, lowered.clone());
        Ok(lowered)
    }

    fn lower_builtin(&mut self, builtin: Builtin, expression: &Expression) -> Result<B::Expr> {
        let operands = expression.operands();
        if let Some(aggregate) = Aggregate::from_builtin(builtin) {
            if let [single] = operands {
                if let Some(key) = single.collection_key() {
                    return self.lower_collection_aggregate(aggregate, key);
                }
            }
            return self.lower_aggregate(aggregate, operands);
        }
        match builtin {
            Builtin::Abs => {
                let value = self.lower(&operands[0])?;
                self.backend.apply(CpOperator::Abs, &[value])
            }
            Builtin::Pow => {
                let values = self.lower_all(operands)?;
                self.backend.apply(CpOperator::Power, &values)
            }
            Builtin::IfThenElse | Builtin::NAryIf => self.lower_conditional(operands),
            Builtin::ElementOf => self.lower_membership(&operands[0], &operands[1]),
            Builtin::NotElementOf => {
                let contained = self.lower_membership(&operands[0], &operands[1])?;
                self.backend.apply(CpOperator::Not, &[contained])
            }
            Builtin::At => {
                if let [index, values] = operands {
                    if let Some(key) = values.collection_key() {
                        return self.lower_lookup(key, index);
                    }
                }
                let index = self.lower(&operands[0])?;
                let position = self.shifted(index, 1)?;
                let values = self.lower_all(&operands[1..])?;
                self.backend.element(&values, &position)
            }
            other => Err(ModelError::Lowering(format!(
                "'{}' is not supported",
                other.name()
            ))),
        }
    }

    fn lower_aggregate(&mut self, aggregate: Aggregate, operands: &[Expression]) -> Result<B::Expr> {
        if operands.is_empty() {
            return match aggregate {
                Aggregate::Count | Aggregate::Sum => Ok(self.backend.constant(0.0)),
                _ => Err(ModelError::Lowering(format!(
                    "{} of no operands",
                    aggregate.name()
                ))),
            };
        }
        let values = match aggregate {
            Aggregate::Count => return Ok(self.backend.constant(operands.len() as f64)),
            _ => self.lower_all(operands)?,
        };
        match aggregate {
            Aggregate::Min => self.backend.apply(CpOperator::Min, &values),
            Aggregate::Max => self.backend.apply(CpOperator::Max, &values),
            Aggregate::Avg => {
                let total = self.backend.apply(CpOperator::Sum, &values)?;
                let count = self.backend.constant(operands.len() as f64);
                self.backend.apply(CpOperator::Divide, &[total, count])
            }
            _ => self.backend.apply(CpOperator::Sum, &values),
        }
    }

    /// Position of a variable key within its clipped key range
    fn key_position(&mut self, key: &Expression, keys: IntegerDomain) -> Result<B::Expr> {
        let value = match key {
            Expression::Variable(_) | Expression::Indexed(_) => self.lower(key)?,
            _ => {
                return Err(ModelError::Lowering(format!(
                    "collection key '{}' is not reducible to a variable",
                    key
                )))
            }
        };
        self.shifted(value, keys.lower)
    }

    fn lower_collection_aggregate(&mut self, aggregate: Aggregate, key: &Expression) -> Result<B::Expr> {
        if let Some(constant) = key.as_constant() {
            let key = self.collections.constant_key(constant)?;
            let value = self.collections.aggregate(aggregate, key)?;
            return Ok(self.backend.constant(value));
        }
        let keys = key_domain(self.model, key)?;
        let table = self.collections.aggregate_table(aggregate, keys)?;
        let table = self.constants(&table);
        let position = self.key_position(key, keys)?;
        self.backend.element(&table, &position)
    }

    /// Native disjunction of `value == element`
    fn any_equal(&mut self, value: &B::Expr, elements: &[f64]) -> Result<B::Expr> {
        let mut equalities = Vec::with_capacity(elements.len());
        let mut seen: Vec<f64> = Vec::with_capacity(elements.len());
        for element in elements {
            if seen.contains(element) {
                continue;
            }
            seen.push(*element);
            let element = self.backend.constant(*element);
            equalities.push(self.backend.apply(CpOperator::Equal, &[value.clone(), element])?);
        }
        if equalities.is_empty() {
            return Ok(self.backend.constant(0.0));
        }
        self.backend.apply(CpOperator::Or, &equalities)
    }

    fn lower_membership(&mut self, value: &Expression, collection: &Expression) -> Result<B::Expr> {
        let key = collection.collection_key().ok_or_else(|| {
            ModelError::Lowering(format!("'{}' is not a collection", collection))
        })?;
        match (key.as_constant(), value.as_constant()) {
            (Some(key), Some(value)) => {
                let key = self.collections.constant_key(key)?;
                let contained = self.collections.contains(key, value)?;
                Ok(self.backend.constant(if contained { 1.0 } else { 0.0 }))
            }
            (Some(key), None) => {
                let key = self.collections.constant_key(key)?;
                let elements = self.collections.fetch(key)?;
                let member = self.lower(value)?;
                self.any_equal(&member, &elements)
            }
            (None, Some(constant)) => {
                let keys = key_domain(self.model, key)?;
                let vector = self.collections.membership_vector(keys, constant)?;
                let vector = self.constants(&vector);
                let position = self.key_position(key, keys)?;
                self.backend.element(&vector, &position)
            }
            (None, None) => {
                let keys = key_domain(self.model, key)?;
                let member = self.lower(value)?;
                let key_position = self.key_position(key, keys)?;
                match integer_domain(self.model, value) {
                    Some(values) => {
                        let matrix = self.collections.membership_matrix(keys, values)?;
                        let matrix = self.constants(&matrix);
                        // (k - κlo)·|V| + (v - νlo)
                        let width = self.backend.constant(values.len() as f64);
                        let row = self.backend.apply(CpOperator::Product, &[key_position, width])?;
                        let column = self.shifted(member, values.lower)?;
                        let position = self.backend.apply(CpOperator::Sum, &[row, column])?;
                        self.backend.element(&matrix, &position)
                    }
                    None => {
                        let mut rows = Vec::with_capacity(keys.len());
                        for candidate in keys.values() {
                            let elements = self.collections.fetch(candidate as usize)?;
                            rows.push(self.any_equal(&member, &elements)?);
                        }
                        self.backend.element(&rows, &key_position)
                    }
                }
            }
        }
    }

    /// `collection(key)[index]`, 1-based
    fn lower_lookup(&mut self, key: &Expression, index: &Expression) -> Result<B::Expr> {
        let index = self.lower(index)?;
        if let Some(constant) = key.as_constant() {
            let key = self.collections.constant_key(constant)?;
            let values = self.collections.fetch(key)?;
            if values.is_empty() {
                return Err(ModelError::Lowering(format!(
                    "lookup into the empty collection {}",
                    key
                )));
            }
            let values = self.constants(&values);
            let position = self.shifted(index, 1)?;
            return self.backend.element(&values, &position);
        }

        let keys = key_domain(self.model, key)?;
        let (width, matrix) = self.collections.value_matrix(keys)?;
        let key_position = self.key_position(key, keys)?;

        let one = self.backend.constant(1.0);
        let last = self.backend.constant(width as f64);
        let above = self
            .backend
            .apply(CpOperator::GreaterOrEqual, &[index.clone(), one])?;
        let below = self
            .backend
            .apply(CpOperator::LessOrEqual, &[index.clone(), last])?;
        let in_range = self.backend.apply(CpOperator::And, &[above, below])?;
        self.backend
            .add_constraint(&in_range, &format!("{}.range", key))?;

        // (k - κlo)·width + (index - 1)
        let width = self.backend.constant(width as f64);
        let row = self.backend.apply(CpOperator::Product, &[key_position, width])?;
        let column = self.shifted(index, 1)?;
        let position = self.backend.apply(CpOperator::Sum, &[row, column])?;

        let values: Vec<f64> = matrix.iter().map(|cell| cell.unwrap_or(0.0)).collect();
        let mask: Vec<f64> = matrix
            .iter()
            .map(|cell| if cell.is_some() { 1.0 } else { 0.0 })
            .collect();
        if mask.contains(&0.0) {
            let mask = self.constants(&mask);
            let defined = self.backend.element(&mask, &position)?;
            self.backend
                .add_constraint(&defined, &format!("{}.defined", key))?;
        }
        let values = self.constants(&values);
        self.backend.element(&values, &position)
    }

    /// Nested if-then-else, built from the last branch backwards
    fn lower_conditional(&mut self, operands: &[Expression]) -> Result<B::Expr> {
        let Some((otherwise, branches)) = operands.split_last() else {
            return Err(ModelError::Lowering("conditional without branches".to_string()));
        };
        let mut result = self.lower(otherwise)?;
        for branch in branches.chunks(2).rev() {
            let condition = self.truth(&branch[0])?;
            let value = self.lower(&branch[1])?;
            result = self
                .backend
                .apply(CpOperator::IfThenElse, &[condition, value, result])?;
        }
        Ok(result)
    }

    fn read_back(&self, solution: &mut Solution<'m>) -> Result<()> {
        let model = self.model;
        for (sequence, list) in model.sequences().iter().zip(&self.lists) {
            if let Some(permutation) = self.backend.list_value(list) {
                let values: Vec<f64> = permutation.iter().map(|slot| *slot as f64 + 1.0).collect();
                solution.set_sequence(sequence, &values)?;
            }
        }
        for var in model.handles() {
            if matches!(model.variable(&var).origin, VariableOrigin::Sequence { .. }) {
                continue;
            }
            if let Some(value) = self.backend.value(&self.variables[var.index()]) {
                solution.set(&var, self.config.round(value))?;
            }
        }
        Ok(())
    }
}

impl<'m, B: CpBackend> SolverService<'m> for CpAdapter<'m, B> {
    fn solve(&mut self) -> Result<Solution<'m>> {
        info!(
            "solving '{}' with {} ({} variables, {} lists)",
            self.model.name(),
            self.backend.name(),
            self.variables.len(),
            self.lists.len()
        );
        let status = self.backend.solve()?;
        info!("{} finished: {}", self.backend.name(), status);

        let status = status.to_solution_status(
            self.backend.has_solution(),
            self.model.name(),
            self.backend.name(),
        )?;

        let mut solution = Solution::new(self.model).with_status(status);
        if self.backend.has_solution() {
            self.read_back(&mut solution)?;
        } else {
            warn!("{} stopped without an assignment", self.backend.name());
        }
        Ok(solution)
    }

    fn name(&self) -> &str {
        self.backend.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{at_collection, collection, element_of, max, not_element_of};
    use crate::solver::reference::ReferenceSolver;

    fn solve(model: &Model) -> Result<Solution<'_>> {
        CpAdapter::new(model, ReferenceSolver::new(), SolverConfig::default())?.solve()
    }

    fn lookup_model() -> Model {
        let mut model = Model::new("lookup");
        model.set_collection_lookup(
            |key| match key {
                0 => Ok(vec![10.0, 20.0, 30.0]),
                1 => Ok(vec![40.0, 50.0]),
                _ => Err(format!("key {} is unknown", key)),
            },
            2,
        );
        model
    }

    #[test]
    fn configuration_reaches_the_backend() {
        let model = Model::new("quiet");
        let adapter = CpAdapter::new(&model, ReferenceSolver::new(), SolverConfig::default()).unwrap();
        assert!(!adapter.backend().is_verbose());

        let config = SolverConfig::default().verbose(true);
        let adapter = CpAdapter::new(&model, ReferenceSolver::new(), config).unwrap();
        assert!(adapter.backend().is_verbose());
    }

    #[test]
    fn sequences_are_shifted_lists() {
        let mut model = Model::new("lists");
        let order = model.add_sequence("order", 4).unwrap();
        let last = order.member(3).unwrap().clone();
        model.add_constraint(Expression::from(&last).equals(1)).unwrap();
        let solution = solve(&model).unwrap();
        let mut values = solution.get_sequence(&order).unwrap();
        assert_eq!(values[3], 1.0);
        values.sort_by(f64::total_cmp);
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0]);
        assert!(solution.errors().is_empty());
    }

    #[test]
    fn undefined_cells_are_forbidden() {
        let mut model = lookup_model();
        let key = model.add_integer("key", 0.0, 1.0).unwrap();
        let index = model.add_integer("index", 1.0, 3.0).unwrap();
        model.add_constraint(Expression::from(&index).equals(3)).unwrap();
        let value = model
            .add_deduced_variable("value", VariableType::Integer, at_collection(&key, &index))
            .unwrap();
        let solution = solve(&model).unwrap();
        // collection 1 has no third element
        assert_eq!(solution.get(&key), Some(0.0));
        assert_eq!(solution.get(&value), Some(30.0));
    }

    #[test]
    fn membership_over_variable_keys_and_values() {
        let mut model = lookup_model();
        let key = model.add_integer("key", 0.0, 1.0).unwrap();
        let value = model.add_integer("value", 15.0, 45.0).unwrap();
        model
            .add_constraint(element_of(&value, collection(&key)))
            .unwrap();
        model
            .add_constraint(not_element_of(40.0, collection(&key)))
            .unwrap();
        let solution = solve(&model).unwrap();
        assert_eq!(solution.get(&key), Some(0.0));
        let value = solution.get(&value).unwrap();
        assert!(value == 20.0 || value == 30.0);
    }

    #[test]
    fn objectives_are_native_expressions() {
        let mut model = Model::new("objective");
        let x = model.add_integer("x", 0.0, 4.0).unwrap();
        let y = model.add_integer("y", 0.0, 4.0).unwrap();
        model
            .add_constraint((Expression::from(&x) + &y).leq(5))
            .unwrap();
        model
            .maximize(max([Expression::from(&x) * 2.0, Expression::from(&y) * 3.0]).unwrap())
            .unwrap();
        let solution = solve(&model).unwrap();
        assert_eq!(solution.objective_value(), Some(12.0));
        assert!(solution.is_optimal());
    }

    #[test]
    fn failing_lookups_surface_as_collection_errors() {
        let mut model = lookup_model();
        let x = model.add_integer("x", 0.0, 100.0).unwrap();
        model
            .add_constraint(element_of(&x, collection(5.0)))
            .unwrap();
        assert!(matches!(
            solve(&model),
            Err(ModelError::Collection { key: 5, .. })
        ));
    }
}
