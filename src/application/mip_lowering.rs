// MIP/NLP lowering of a model
//
// The back-end only knows arithmetic, products, powers, absolute values and
// range constraints. Every relation, connective and lookup is rebuilt from
// binaries under one tolerance ε read from the back-end: a relation holds
// within ε and fails only beyond 1.1ε.

use std::collections::HashMap;
use std::rc::Rc;

use log::{debug, info, warn};

use super::collections::{integer_domain, key_domain, Collections, IntegerDomain};
use crate::domain::evaluator::Aggregate;
use crate::domain::{
    Builtin, Expression, IndexedVar, Model, ModelError, ObjectiveSense, Operator, Result,
    Sequence, Solution, SolverConfig, SolverService, Var, VariableType,
};
use crate::solver::backend::{MipBackend, VariableKind};

/// Distance past ε, as a multiple of ε, at which a relation counts as false
const STRICT_FACTOR: f64 = 1.1;

/// Identity of an IR node for the memo tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum NodeKey {
    Constant(u64),
    Variable(usize),
    Indexed(usize, usize),
    Operation(usize),
}

fn node_key(expression: &Expression) -> NodeKey {
    match expression {
        Expression::Constant(value) => NodeKey::Constant(value.to_bits()),
        Expression::Variable(var) => NodeKey::Variable(var.index()),
        Expression::Indexed(indexed) => {
            NodeKey::Indexed(indexed.family().index(), indexed.index().index())
        }
        Expression::Operation(operation) => NodeKey::Operation(Rc::as_ptr(operation) as usize),
    }
}

/// Entry of a lookup table
#[derive(Debug, Clone)]
enum Cell<E> {
    Constant(f64),
    Expr(E),
    /// Past the end of a shorter collection; its selector is fixed to 0
    Undefined,
}

fn variable_kind(variable_type: VariableType) -> VariableKind {
    match variable_type {
        VariableType::Boolean => VariableKind::Binary,
        VariableType::Integer => VariableKind::Integer,
        VariableType::Real => VariableKind::Continuous,
    }
}

/// Model lowered into a [`MipBackend`].
///
/// Lowering happens eagerly in [`MipAdapter::new`]; every IR node is lowered
/// at most once, so [`MipAdapter::lower`] on an already lowered node returns
/// the same back-end expression without creating variables or constraints.
pub struct MipAdapter<'m, B: MipBackend> {
    model: &'m Model,
    backend: B,
    config: SolverConfig,
    epsilon: f64,
    variables: Vec<B::Var>,
    memo: HashMap<usize, B::Expr>,
    truths: HashMap<NodeKey, B::Expr>,
    lookups: HashMap<NodeKey, B::Expr>,
    key_copies: HashMap<NodeKey, B::Expr>,
    key_selectors: HashMap<NodeKey, Vec<B::Expr>>,
    collections: Collections<'m>,
    /// Memoized operation nodes, kept alive so their addresses stay unique
    pinned: Vec<Expression>,
    auxiliaries: usize,
}

impl<'m, B: MipBackend> MipAdapter<'m, B> {
    pub fn new(model: &'m Model, mut backend: B, config: SolverConfig) -> Result<Self> {
        if let Some(tolerance) = config.feasibility_tolerance {
            backend.set_feasibility_tolerance(tolerance);
        }
        backend.set_time_limit(config.time_limit);
        backend.set_node_limit(config.node_limit);
        backend.set_verbose(config.verbose);
        let epsilon = backend.feasibility_tolerance();

        let mut adapter = Self {
            model,
            backend,
            config,
            epsilon,
            variables: Vec::with_capacity(model.variables().len()),
            memo: HashMap::new(),
            truths: HashMap::new(),
            lookups: HashMap::new(),
            key_copies: HashMap::new(),
            key_selectors: HashMap::new(),
            collections: Collections::new(model),
            pinned: Vec::new(),
            auxiliaries: 0,
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

    /// Tolerance ε the relations were lowered with
    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Back-end variable of a model variable
    pub fn handle(&self, var: &Var) -> Result<B::Var> {
        if !self.model.owns(var) {
            return Err(ModelError::Lowering(format!(
                "variable '{}' belongs to another model",
                var.name()
            )));
        }
        Ok(self.variables[var.index()])
    }

    fn lower_model(&mut self) -> Result<()> {
        let model = self.model;
        for var in model.handles() {
            self.declare(&var)?;
        }
        for sequence in model.sequences() {
            self.assign(sequence)?;
        }
        for var in model.handles() {
            if let Some(definition) = &model.variable(&var).deduced_from {
                let value = self.lower(definition)?;
                let deduced = self.backend.variable(self.variables[var.index()]);
                let difference = self
                    .backend
                    .weighted_sum(&[(1.0, deduced), (-1.0, value)], 0.0)?;
                self.backend.add_constraint(
                    &difference,
                    0.0,
                    0.0,
                    &format!("{}.definition", var.name()),
                )?;
            }
        }
        for constraint in model.constraints() {
            self.enforce(&constraint.expression, &constraint.label())?;
        }
        self.lower_objective()?;

        debug!(
            "lowered '{}' into {}: {} variables, {} constraints, {} auxiliaries",
            model.name(),
            self.backend.name(),
            self.backend.num_variables(),
            self.backend.num_constraints(),
            self.auxiliaries
        );
        Ok(())
    }

    fn declare(&mut self, var: &Var) -> Result<()> {
        let model = self.model;
        let variable = model.variable(var);
        let kind = variable_kind(variable.variable_type);
        let handle = if variable.is_deduced() {
            // bounds of a deduced variable clamp through their own constraint
            let (lower, upper) = match kind {
                VariableKind::Binary => (0.0, 1.0),
                _ => (f64::NEG_INFINITY, f64::INFINITY),
            };
            let handle = self.backend.add_variable(kind, lower, upper, var.name())?;
            if variable.lower_bound > lower || variable.upper_bound < upper {
                let value = self.backend.variable(handle);
                self.backend.add_constraint(
                    &value,
                    variable.lower_bound,
                    variable.upper_bound,
                    &format!("{}.bounds", var.name()),
                )?;
            }
            handle
        } else {
            self.backend.add_variable(
                kind,
                variable.lower_bound,
                variable.upper_bound,
                var.name(),
            )?
        };
        self.variables.push(handle);
        Ok(())
    }

    /// `n x n` assignment matrix behind the members of a sequence
    fn assign(&mut self, sequence: &Sequence) -> Result<()> {
        let n = sequence.len();
        let mut matrix = Vec::with_capacity(n);
        for position in 0..n {
            let mut row = Vec::with_capacity(n);
            for value in 0..n {
                let name = format!("{}.assign[{}][{}]", sequence.name(), position, value);
                let cell = self.backend.add_variable(VariableKind::Binary, 0.0, 1.0, &name)?;
                row.push(self.backend.variable(cell));
            }
            matrix.push(row);
        }

        for (position, row) in matrix.iter().enumerate() {
            let ones: Vec<_> = row.iter().map(|cell| (1.0, cell.clone())).collect();
            let total = self.backend.weighted_sum(&ones, 0.0)?;
            let name = format!("{}.row[{}]", sequence.name(), position);
            self.backend.add_constraint(&total, 1.0, 1.0, &name)?;

            let member = self.lower_variable(&sequence.members()[position])?;
            let mut terms = vec![(1.0, member)];
            terms.extend(
                row.iter()
                    .enumerate()
                    .map(|(value, cell)| (-(value as f64 + 1.0), cell.clone())),
            );
            let link = self.backend.weighted_sum(&terms, 0.0)?;
            let name = format!("{}.value[{}]", sequence.name(), position);
            self.backend.add_constraint(&link, 0.0, 0.0, &name)?;
        }
        for value in 0..n {
            let ones: Vec<_> = matrix.iter().map(|row| (1.0, row[value].clone())).collect();
            let total = self.backend.weighted_sum(&ones, 0.0)?;
            let name = format!("{}.column[{}]", sequence.name(), value);
            self.backend.add_constraint(&total, 1.0, 1.0, &name)?;
        }
        Ok(())
    }

    fn lower_objective(&mut self) -> Result<()> {
        let model = self.model;
        let objective = model.objective();
        let expression = match (&objective.expression, objective.sense) {
            (_, ObjectiveSense::Feasible) | (None, _) => return Ok(()),
            (Some(expression), _) => expression,
        };
        let value = self.lower(expression)?;
        let objective_var = self.backend.add_variable(
            VariableKind::Continuous,
            f64::NEG_INFINITY,
            f64::INFINITY,
            "objective",
        )?;
        let objective_value = self.backend.variable(objective_var);
        let link = self
            .backend
            .weighted_sum(&[(1.0, objective_value), (-1.0, value)], 0.0)?;
        self.backend.add_constraint(&link, 0.0, 0.0, "objective")?;
        self.backend.set_objective(objective_var, objective.sense)
    }

    fn next_name(&mut self, prefix: &str) -> String {
        self.auxiliaries += 1;
        format!("{}#{}", prefix, self.auxiliaries)
    }

    fn fresh(&mut self, kind: VariableKind, lower: f64, upper: f64, prefix: &str) -> Result<B::Expr> {
        let name = self.next_name(prefix);
        let var = self.backend.add_variable(kind, lower, upper, &name)?;
        Ok(self.backend.variable(var))
    }

    fn require(&mut self, expr: &B::Expr, lower: f64, upper: f64, prefix: &str) -> Result<()> {
        let name = self.next_name(prefix);
        self.backend.add_constraint(expr, lower, upper, &name)
    }

    /// Top-level constraint, enforced without a reification binary
    fn enforce(&mut self, expression: &Expression, label: &str) -> Result<()> {
        let operands = expression.operands();
        let epsilon = self.epsilon;
        let strict = STRICT_FACTOR * epsilon;
        let (lower, upper) = match expression.operator() {
            Some(Operator::LogicalAnd) => {
                for operand in operands {
                    self.enforce(operand, label)?;
                }
                return Ok(());
            }
            Some(Operator::LessOrEqual) => (f64::NEG_INFINITY, epsilon),
            Some(Operator::LessThan) => (f64::NEG_INFINITY, -strict),
            Some(Operator::GreaterOrEqual) => (-epsilon, f64::INFINITY),
            Some(Operator::GreaterThan) => (strict, f64::INFINITY),
            Some(Operator::Equal) => (-epsilon, epsilon),
            Some(Operator::NotEqual) => {
                let delta = self.difference(&operands[0], &operands[1])?;
                let magnitude = self.backend.abs(&delta)?;
                return self
                    .backend
                    .add_constraint(&magnitude, strict, f64::INFINITY, label);
            }
            _ => {
                let holds = self.truth(expression)?;
                return self
                    .backend
                    .add_constraint(&holds, 1.0 - epsilon, f64::INFINITY, label);
            }
        };
        let delta = self.difference(&operands[0], &operands[1])?;
        self.backend.add_constraint(&delta, lower, upper, label)
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

    fn lower_variable(&mut self, var: &Var) -> Result<B::Expr> {
        let handle = self.handle(var)?;
        Ok(self.backend.variable(handle))
    }

    fn lower_all(&mut self, operands: &[Expression]) -> Result<Vec<B::Expr>> {
        operands.iter().map(|operand| self.lower(operand)).collect()
    }

    fn difference(&mut self, lhs: &Expression, rhs: &Expression) -> Result<B::Expr> {
        let lhs = self.lower(lhs)?;
        let rhs = self.lower(rhs)?;
        self.backend.weighted_sum(&[(1.0, lhs), (-1.0, rhs)], 0.0)
    }

    fn complement(&mut self, value: B::Expr) -> Result<B::Expr> {
        self.backend.weighted_sum(&[(-1.0, value)], 1.0)
    }

    fn product_of(&mut self, factors: Vec<B::Expr>) -> Result<B::Expr> {
        let mut factors = factors.into_iter();
        let Some(mut product) = factors.next() else {
            return Ok(self.backend.constant(1.0));
        };
        for factor in factors {
            product = self.backend.product(&product, &factor)?;
        }
        Ok(product)
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
            Operator::Negate => {
                let value = self.lower(&operands[0])?;
                self.backend.weighted_sum(&[(-1.0, value)], 0.0)
            }
            Operator::Add => {
                let terms: Vec<_> = self
                    .lower_all(operands)?
                    .into_iter()
                    .map(|term| (1.0, term))
                    .collect();
                self.backend.weighted_sum(&terms, 0.0)
            }
            Operator::Subtract => self.difference(&operands[0], &operands[1]),
            Operator::Multiply => {
                let factors = self.lower_all(operands)?;
                self.product_of(factors)
            }
            Operator::Divide => self.lower_division(expression),
            Operator::LogicalNot => {
                let value = self.truth(&operands[0])?;
                self.complement(value)
            }
            Operator::LogicalAnd => {
                let truths = operands
                    .iter()
                    .map(|operand| self.truth(operand))
                    .collect::<Result<Vec<_>>>()?;
                self.product_of(truths)
            }
            Operator::LogicalOr => {
                if let [single] = operands {
                    return self.truth(single);
                }
                let terms = operands
                    .iter()
                    .map(|operand| Ok((1.0, self.truth(operand)?)))
                    .collect::<Result<Vec<_>>>()?;
                let total = self.backend.weighted_sum(&terms, 0.0)?;
                self.coerce(&total)
            }
            relation if relation.is_comparison() => self.reify(relation, &operands[0], &operands[1]),
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
            other => Err(ModelError::Lowering(format!(
                "operator {:?} is not supported",
                other
            ))),
        }
    }

    fn lower_division(&mut self, expression: &Expression) -> Result<B::Expr> {
        let operands = expression.operands();
        let numerator = self.lower(&operands[0])?;
        match operands[1].as_constant() {
            Some(divisor) if divisor == 0.0 => Err(ModelError::Lowering(format!(
                "division by zero in '{}'",
                expression
            ))),
            Some(divisor) => self.backend.weighted_sum(&[(1.0 / divisor, numerator)], 0.0),
            None => {
                let divisor = self.lower(&operands[1])?;
                let minus_one = self.backend.constant(-1.0);
                let inverse = self.backend.power(&divisor, &minus_one)?;
                self.backend.product(&numerator, &inverse)
            }
        }
    }

    /// 0/1 expression that is 1 exactly when `expression` is non-zero
    fn truth(&mut self, expression: &Expression) -> Result<B::Expr> {
        if let Some(value) = expression.as_constant() {
            let truth = if value != 0.0 { 1.0 } else { 0.0 };
            return Ok(self.backend.constant(truth));
        }
        if expression.is_boolean_valued() {
            return self.lower(expression);
        }
        let key = node_key(expression);
        if let Some(truth) = self.truths.get(&key) {
            return Ok(truth.clone());
        }
        let value = self.lower(expression)?;
        let truth = self.coerce(&value)?;
        self.truths.insert(key, truth.clone());
        Ok(truth)
    }

    /// Binary `b` with `|x| - 1.1ε·b >= 0` and `(1 - b)(|x| - ε) <= 0`
    fn coerce(&mut self, value: &B::Expr) -> Result<B::Expr> {
        let truth = self.fresh(VariableKind::Binary, 0.0, 1.0, "bool")?;
        let magnitude = self.backend.abs(value)?;
        let strict = STRICT_FACTOR * self.epsilon;
        let lower = self
            .backend
            .weighted_sum(&[(1.0, magnitude.clone()), (-strict, truth.clone())], 0.0)?;
        self.require(&lower, 0.0, f64::INFINITY, "bool")?;

        let falsity = self.complement(truth.clone())?;
        let excess = self
            .backend
            .weighted_sum(&[(1.0, magnitude)], -self.epsilon)?;
        let upper = self.backend.product(&falsity, &excess)?;
        self.require(&upper, f64::NEG_INFINITY, 0.0, "bool")?;
        Ok(truth)
    }

    fn affine(&mut self, value: &B::Expr, factor: f64, constant: f64) -> Result<B::Expr> {
        self.backend.weighted_sum(&[(factor, value.clone())], constant)
    }

    /// Binary that is 1 exactly when the relation holds within the tolerance
    fn reify(&mut self, relation: Operator, lhs: &Expression, rhs: &Expression) -> Result<B::Expr> {
        let delta = self.difference(lhs, rhs)?;
        let epsilon = self.epsilon;
        let strict = STRICT_FACTOR * epsilon;
        let (holds, fails) = match relation {
            Operator::GreaterOrEqual => (
                vec![self.affine(&delta, 1.0, epsilon)?],
                self.affine(&delta, -1.0, -strict)?,
            ),
            Operator::LessOrEqual => (
                vec![self.affine(&delta, -1.0, epsilon)?],
                self.affine(&delta, 1.0, -strict)?,
            ),
            Operator::GreaterThan => (
                vec![self.affine(&delta, 1.0, -strict)?],
                self.affine(&delta, -1.0, epsilon)?,
            ),
            Operator::LessThan => (
                vec![self.affine(&delta, -1.0, -strict)?],
                self.affine(&delta, 1.0, epsilon)?,
            ),
            Operator::Equal => {
                let magnitude = self.backend.abs(&delta)?;
                (
                    vec![
                        self.affine(&delta, -1.0, epsilon)?,
                        self.affine(&delta, 1.0, epsilon)?,
                    ],
                    self.affine(&magnitude, 1.0, -strict)?,
                )
            }
            Operator::NotEqual => {
                let magnitude = self.backend.abs(&delta)?;
                (
                    vec![self.affine(&magnitude, 1.0, -strict)?],
                    self.affine(&magnitude, -1.0, epsilon)?,
                )
            }
            other => {
                return Err(ModelError::Lowering(format!(
                    "{:?} is not a comparison",
                    other
                )))
            }
        };

        let truth = self.fresh(VariableKind::Binary, 0.0, 1.0, "reify")?;
        let falsity = self.complement(truth.clone())?;
        for condition in &holds {
            let guarded = self.backend.product(&truth, condition)?;
            self.require(&guarded, 0.0, f64::INFINITY, "reify")?;
        }
        let guarded = self.backend.product(&falsity, &fails)?;
        self.require(&guarded, 0.0, f64::INFINITY, "reify")?;
        Ok(truth)
    }

    fn cell(&mut self, expression: &Expression) -> Result<Cell<B::Expr>> {
        match expression.as_constant() {
            Some(value) => Ok(Cell::Constant(value)),
            None => Ok(Cell::Expr(self.lower(expression)?)),
        }
    }

    /// Selectors with `Σ s = 1` and `index - offset = Σ i·s_i`
    fn one_hot(&mut self, index: &B::Expr, offset: f64, selectors: &[B::Expr]) -> Result<()> {
        let ones: Vec<_> = selectors.iter().map(|s| (1.0, s.clone())).collect();
        let total = self.backend.weighted_sum(&ones, 0.0)?;
        self.require(&total, 1.0, 1.0, "select")?;

        let mut terms = vec![(1.0, index.clone())];
        terms.extend(
            selectors
                .iter()
                .enumerate()
                .map(|(position, s)| (-(position as f64), s.clone())),
        );
        let link = self.backend.weighted_sum(&terms, -offset)?;
        self.require(&link, 0.0, 0.0, "select")
    }

    /// `Σ s_i·cell_i` over one-hot selectors on `index - offset`
    fn select(&mut self, index: &B::Expr, offset: f64, cells: &[Cell<B::Expr>]) -> Result<B::Expr> {
        if cells.iter().all(|cell| matches!(cell, Cell::Undefined)) {
            return Err(ModelError::Lowering("lookup into an empty list".to_string()));
        }
        let mut selectors = Vec::with_capacity(cells.len());
        for cell in cells {
            let upper = if matches!(cell, Cell::Undefined) { 0.0 } else { 1.0 };
            selectors.push(self.fresh(VariableKind::Binary, 0.0, upper, "select")?);
        }
        self.one_hot(index, offset, &selectors)?;

        let mut terms = Vec::with_capacity(cells.len());
        for (selector, cell) in selectors.into_iter().zip(cells) {
            match cell {
                Cell::Constant(value) => terms.push((*value, selector)),
                Cell::Expr(value) => terms.push((1.0, self.backend.product(&selector, value)?)),
                Cell::Undefined => {}
            }
        }
        self.backend.weighted_sum(&terms, 0.0)
    }

    /// `family[index]`, 0-based
    fn lower_indexed(&mut self, indexed: &IndexedVar) -> Result<B::Expr> {
        let key = NodeKey::Indexed(indexed.family().index(), indexed.index().index());
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
        let cells = model
            .family_members(indexed.family())
            .iter()
            .map(|member| Ok(Cell::Expr(self.lower_variable(member)?)))
            .collect::<Result<Vec<_>>>()?;
        let lowered = self.select(&index, 0.0, &cells)?;
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
                self.backend.abs(&value)
            }
            Builtin::Pow => {
                let base = self.lower(&operands[0])?;
                let exponent = self.lower(&operands[1])?;
                self.backend.power(&base, &exponent)
            }
            Builtin::IfThenElse | Builtin::NAryIf => self.lower_conditional(operands),
            Builtin::ElementOf => self.lower_membership(&operands[0], &operands[1]),
            Builtin::NotElementOf => {
                let contained = self.lower_membership(&operands[0], &operands[1])?;
                self.complement(contained)
            }
            Builtin::At => {
                if let [index, values] = operands {
                    if let Some(key) = values.collection_key() {
                        return self.lower_lookup(key, index);
                    }
                }
                let index = self.lower(&operands[0])?;
                let cells = operands[1..]
                    .iter()
                    .map(|value| self.cell(value))
                    .collect::<Result<Vec<_>>>()?;
                self.select(&index, 1.0, &cells)
            }
            other => Err(ModelError::Lowering(format!(
                "'{}' is not supported",
                other.name()
            ))),
        }
    }

    fn lower_aggregate(&mut self, aggregate: Aggregate, operands: &[Expression]) -> Result<B::Expr> {
        if operands.is_empty() && !matches!(aggregate, Aggregate::Count | Aggregate::Sum) {
            return Err(ModelError::Lowering(format!(
                "{} of no operands",
                aggregate.name()
            )));
        }
        match aggregate {
            Aggregate::Count => Ok(self.backend.constant(operands.len() as f64)),
            Aggregate::Sum | Aggregate::Avg => {
                let weight = match aggregate {
                    Aggregate::Avg => 1.0 / operands.len() as f64,
                    _ => 1.0,
                };
                let terms: Vec<_> = self
                    .lower_all(operands)?
                    .into_iter()
                    .map(|term| (weight, term))
                    .collect();
                self.backend.weighted_sum(&terms, 0.0)
            }
            Aggregate::Min | Aggregate::Max => {
                let mut values = self.lower_all(operands)?.into_iter();
                let Some(mut extremum) = values.next() else {
                    return Err(ModelError::Lowering(format!("{} of no operands", aggregate.name())));
                };
                let sign = if aggregate == Aggregate::Max { 0.5 } else { -0.5 };
                for value in values {
                    // (a + b ± |a - b|) / 2
                    let gap = self
                        .backend
                        .weighted_sum(&[(1.0, extremum.clone()), (-1.0, value.clone())], 0.0)?;
                    let magnitude = self.backend.abs(&gap)?;
                    extremum = self.backend.weighted_sum(
                        &[(0.5, extremum), (0.5, value), (sign, magnitude)],
                        0.0,
                    )?;
                }
                Ok(extremum)
            }
        }
    }

    /// Key as a back-end expression; family lookups go through an integer copy
    fn key_value(&mut self, key: &Expression) -> Result<B::Expr> {
        match key {
            Expression::Variable(var) => self.lower_variable(var),
            Expression::Indexed(indexed) => {
                let memo = node_key(key);
                if let Some(copy) = self.key_copies.get(&memo) {
                    return Ok(copy.clone());
                }
                let value = self.lower_indexed(indexed)?;
                let (lower, upper) = self.model.family_bounds(indexed.family());
                let copy = self.fresh(VariableKind::Integer, lower, upper, "key")?;
                let link = self
                    .backend
                    .weighted_sum(&[(1.0, copy.clone()), (-1.0, value)], 0.0)?;
                self.require(&link, 0.0, 0.0, "key")?;
                self.key_copies.insert(memo, copy.clone());
                Ok(copy)
            }
            _ => Err(ModelError::Lowering(format!(
                "collection key '{}' is not reducible to a variable",
                key
            ))),
        }
    }

    /// One-hot selectors over `keys`, shared by every lookup on the same key
    fn key_selectors(&mut self, key: &Expression, keys: IntegerDomain) -> Result<Vec<B::Expr>> {
        let memo = node_key(key);
        if let Some(selectors) = self.key_selectors.get(&memo) {
            return Ok(selectors.clone());
        }
        let value = self.key_value(key)?;
        let mut selectors = Vec::with_capacity(keys.len());
        for _ in keys.values() {
            selectors.push(self.fresh(VariableKind::Binary, 0.0, 1.0, "key")?);
        }
        self.one_hot(&value, keys.lower as f64, &selectors)?;
        self.key_selectors.insert(memo, selectors.clone());
        Ok(selectors)
    }

    fn lower_collection_aggregate(&mut self, aggregate: Aggregate, key: &Expression) -> Result<B::Expr> {
        if let Some(constant) = key.as_constant() {
            let key = self.collections.constant_key(constant)?;
            let value = self.collections.aggregate(aggregate, key)?;
            return Ok(self.backend.constant(value));
        }
        let keys = key_domain(self.model, key)?;
        let table = self.collections.aggregate_table(aggregate, keys)?;
        let selectors = self.key_selectors(key, keys)?;
        let terms: Vec<_> = table.into_iter().zip(selectors).collect();
        self.backend.weighted_sum(&terms, 0.0)
    }

    /// `value` equals one of `elements`
    fn lower_any_equal(&mut self, value: &Expression, elements: &[f64]) -> Result<B::Expr> {
        let mut distinct: Vec<f64> = Vec::with_capacity(elements.len());
        for element in elements {
            if !distinct.contains(element) {
                distinct.push(*element);
            }
        }
        if distinct.is_empty() {
            return Ok(self.backend.constant(0.0));
        }
        let equalities = distinct
            .into_iter()
            .map(|element| value.clone().equals(element))
            .collect();
        let disjunction = Expression::operation(Operator::LogicalOr, equalities)?;
        self.lower(&disjunction)
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
                self.lower_any_equal(value, &elements)
            }
            (None, Some(constant)) => {
                let keys = key_domain(self.model, key)?;
                let vector = self.collections.membership_vector(keys, constant)?;
                let selectors = self.key_selectors(key, keys)?;
                let terms: Vec<_> = vector.into_iter().zip(selectors).collect();
                self.backend.weighted_sum(&terms, 0.0)
            }
            (None, None) => {
                let keys = key_domain(self.model, key)?;
                match integer_domain(self.model, value) {
                    Some(values) => {
                        let matrix = self.collections.membership_matrix(keys, values)?;
                        let key_value = self.key_value(key)?;
                        let member = self.lower(value)?;
                        let width = values.len() as f64;
                        let position = self.fresh(
                            VariableKind::Integer,
                            0.0,
                            (matrix.len() - 1) as f64,
                            "membership",
                        )?;
                        // position = (k - κlo)·|V| + (v - νlo)
                        let link = self.backend.weighted_sum(
                            &[(1.0, position.clone()), (-width, key_value), (-1.0, member)],
                            width * keys.lower as f64 + values.lower as f64,
                        )?;
                        self.require(&link, 0.0, 0.0, "membership")?;
                        let cells: Vec<_> = matrix.into_iter().map(Cell::Constant).collect();
                        self.select(&position, 0.0, &cells)
                    }
                    None => {
                        let selectors = self.key_selectors(key, keys)?;
                        let mut terms = Vec::with_capacity(selectors.len());
                        for (candidate, selector) in keys.values().zip(selectors) {
                            let elements = self.collections.fetch(candidate as usize)?;
                            let contained = self.lower_any_equal(value, &elements)?;
                            terms.push((1.0, self.backend.product(&selector, &contained)?));
                        }
                        self.backend.weighted_sum(&terms, 0.0)
                    }
                }
            }
        }
    }

    /// `collection(key)[index]`, 1-based
    fn lower_lookup(&mut self, key: &Expression, index: &Expression) -> Result<B::Expr> {
        let position = self.lower(index)?;
        if let Some(constant) = key.as_constant() {
            let key = self.collections.constant_key(constant)?;
            let cells: Vec<_> = self
                .collections
                .fetch(key)?
                .iter()
                .map(|value| Cell::Constant(*value))
                .collect();
            return self.select(&position, 1.0, &cells);
        }

        let keys = key_domain(self.model, key)?;
        let (width, matrix) = self.collections.value_matrix(keys)?;
        let key_value = self.key_value(key)?;
        self.require(&position, 1.0, width as f64, "lookup")?;
        let flat = self.fresh(
            VariableKind::Integer,
            0.0,
            (matrix.len() - 1) as f64,
            "lookup",
        )?;
        // flat = (k - κlo)·width + (index - 1)
        let width = width as f64;
        let link = self.backend.weighted_sum(
            &[(1.0, flat.clone()), (-width, key_value), (-1.0, position)],
            width * keys.lower as f64 + 1.0,
        )?;
        self.require(&link, 0.0, 0.0, "lookup")?;
        let cells: Vec<_> = matrix
            .into_iter()
            .map(|cell| cell.map_or(Cell::Undefined, Cell::Constant))
            .collect();
        self.select(&flat, 0.0, &cells)
    }

    /// First-match sum: `Σ_i Π_{j<i}(1 - c_j)·c_i·v_i + Π_j(1 - c_j)·v_else`
    fn lower_conditional(&mut self, operands: &[Expression]) -> Result<B::Expr> {
        let Some((otherwise, branches)) = operands.split_last() else {
            return Err(ModelError::Lowering("conditional without branches".to_string()));
        };
        let mut terms = Vec::with_capacity(branches.len() / 2 + 1);
        let mut unmatched: Option<B::Expr> = None;
        for branch in branches.chunks(2) {
            let condition = self.truth(&branch[0])?;
            let value = self.lower(&branch[1])?;
            let taken = match &unmatched {
                Some(rest) => self.backend.product(rest, &condition)?,
                None => condition.clone(),
            };
            terms.push((1.0, self.backend.product(&taken, &value)?));
            let skipped = self.complement(condition)?;
            unmatched = Some(match unmatched {
                Some(rest) => self.backend.product(&rest, &skipped)?,
                None => skipped,
            });
        }
        let value = self.lower(otherwise)?;
        let tail = match unmatched {
            Some(rest) => self.backend.product(&rest, &value)?,
            None => value,
        };
        terms.push((1.0, tail));
        self.backend.weighted_sum(&terms, 0.0)
    }

    fn read_back(&self, solution: &mut Solution<'m>) -> Result<()> {
        for var in self.model.handles() {
            if let Some(value) = self.backend.value(self.variables[var.index()]) {
                solution.set(&var, self.config.round(value))?;
            }
        }
        Ok(())
    }
}

impl<'m, B: MipBackend> SolverService<'m> for MipAdapter<'m, B> {
    fn solve(&mut self) -> Result<Solution<'m>> {
        info!(
            "solving '{}' with {} ({} variables, {} constraints)",
            self.model.name(),
            self.backend.name(),
            self.backend.num_variables(),
            self.backend.num_constraints()
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
    use crate::domain::{at, collection, count, element_of, if_then_else, n_ary_if, sum};
    use crate::solver::reference::ReferenceSolver;

    fn adapter(model: &Model) -> MipAdapter<'_, ReferenceSolver> {
        MipAdapter::new(model, ReferenceSolver::new(), SolverConfig::default()).unwrap()
    }

    fn solve(model: &Model) -> Solution<'_> {
        adapter(model).solve().unwrap()
    }

    #[test]
    fn reified_comparisons_follow_the_evaluator() {
        for (value, expected) in [(2.0, 0.0), (3.0, 1.0), (4.0, 1.0)] {
            let mut model = Model::new("reify");
            let x = model.add_integer("x", value, value).unwrap();
            let flag = model
                .add_deduced_variable("flag", VariableType::Boolean, Expression::from(&x).geq(3))
                .unwrap();
            let strict = model
                .add_deduced_variable("strict", VariableType::Boolean, Expression::from(&x).gt(3))
                .unwrap();
            let solution = solve(&model);
            assert_eq!(solution.get(&flag), Some(expected));
            assert_eq!(solution.get(&strict), Some(if value > 3.0 { 1.0 } else { 0.0 }));
            assert!(solution.errors().is_empty());
        }
    }

    #[test]
    fn verbose_configuration_reaches_the_backend() {
        let mut model = Model::new("verbose");
        let x = model.add_integer("x", 0.0, 3.0).unwrap();
        model.maximize(&x).unwrap();
        assert!(!adapter(&model).backend().is_verbose());

        let config = SolverConfig::default().verbose(true);
        let mut verbose = MipAdapter::new(&model, ReferenceSolver::new(), config).unwrap();
        assert!(verbose.backend().is_verbose());
        assert_eq!(verbose.solve().unwrap().get(&x), Some(3.0));
    }

    #[test]
    fn lowering_a_node_twice_creates_nothing() {
        let mut model = Model::new("memo");
        let x = model.add_integer("x", 0.0, 5.0).unwrap();
        let y = model.add_integer("y", 0.0, 5.0).unwrap();
        let expression = (Expression::from(&x) * &y).leq(4);
        let mut adapter = adapter(&model);

        let first = adapter.lower(&expression).unwrap();
        let variables = adapter.backend().num_variables();
        let constraints = adapter.backend().num_constraints();
        let second = adapter.lower(&expression).unwrap();
        assert_eq!(first, second);
        assert_eq!(adapter.backend().num_variables(), variables);
        assert_eq!(adapter.backend().num_constraints(), constraints);
    }

    #[test]
    fn sequences_become_permutations() {
        let mut model = Model::new("sequence");
        let order = model.add_sequence("order", 3).unwrap();
        let first = order.member(0).unwrap().clone();
        model.add_constraint(Expression::from(&first).equals(3)).unwrap();
        let solution = solve(&model);
        let mut values = solution.get_sequence(&order).unwrap();
        assert_eq!(values[0], 3.0);
        values.sort_by(f64::total_cmp);
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn at_selects_one_based() {
        let mut model = Model::new("at");
        let index = model.add_integer("index", 1.0, 3.0).unwrap();
        let picked = model
            .add_deduced_variable(
                "picked",
                VariableType::Integer,
                at(&index, [7.0, 9.0, 11.0]).unwrap(),
            )
            .unwrap();
        model.add_constraint(Expression::from(&picked).geq(10)).unwrap();
        let solution = solve(&model);
        assert_eq!(solution.get(&index), Some(3.0));
        assert_eq!(solution.get(&picked), Some(11.0));
    }

    #[test]
    fn family_lookups_are_zero_based() {
        let mut model = Model::new("family");
        let family = model.add_indexed_family("w", VariableType::Integer).unwrap();
        for value in [4.0, 8.0] {
            model.emplace(&family, value, value).unwrap();
        }
        let index = model.add_integer("j", 0.0, 1.0).unwrap();
        model.add_constraint(family.at(&index).equals(8)).unwrap();
        let solution = solve(&model);
        assert_eq!(solution.get(&index), Some(1.0));
    }

    #[test]
    fn conditionals_take_the_first_match() {
        let mut model = Model::new("conditional");
        let a = model.add_boolean("a").unwrap();
        let b = model.add_boolean("b").unwrap();
        model.add_constraint(Expression::from(&a)).unwrap();
        model.add_constraint(Expression::from(&b)).unwrap();
        let chosen = model
            .add_deduced_variable(
                "chosen",
                VariableType::Integer,
                n_ary_if(vec![
                    Expression::from(&a),
                    Expression::constant(1.0),
                    Expression::from(&b),
                    Expression::constant(2.0),
                    Expression::constant(3.0),
                ])
                .unwrap(),
            )
            .unwrap();
        let otherwise = model
            .add_deduced_variable(
                "otherwise",
                VariableType::Integer,
                if_then_else(!Expression::from(&a), 5.0, 6.0),
            )
            .unwrap();
        let solution = solve(&model);
        assert_eq!(solution.get(&chosen), Some(1.0));
        assert_eq!(solution.get(&otherwise), Some(6.0));
    }

    #[test]
    fn variable_keys_share_selectors() {
        let mut model = Model::new("keys");
        model.set_collection_lookup(
            |key| Ok(if key == 0 { vec![1.0, 2.0, 3.0] } else { vec![5.0] }),
            2,
        );
        let key = model.add_integer("key", 0.0, 1.0).unwrap();
        let total = sum([collection(&key)]);
        let size = count([collection(&key)]);
        model.add_constraint(total.geq(5)).unwrap();
        model.add_constraint(size.leq(1)).unwrap();

        let mut adapter = adapter(&model);
        let variables = adapter.backend().num_variables();
        adapter.lower(&element_of(4.0, collection(&key))).unwrap();
        // a membership vector reuses the key selectors
        assert_eq!(adapter.backend().num_variables(), variables);

        let solution = adapter.solve().unwrap();
        assert_eq!(solution.get(&key), Some(1.0));
    }

    #[test]
    fn unreducible_keys_fail_to_lower() {
        let mut model = Model::new("keys");
        model.set_collection_lookup(|_| Ok(vec![1.0]), 2);
        let key = model.add_integer("key", 0.0, 1.0).unwrap();
        model
            .add_constraint(sum([collection(Expression::from(&key) + 1.0)]).geq(1))
            .unwrap();
        let result = MipAdapter::new(&model, ReferenceSolver::new(), SolverConfig::default());
        assert!(matches!(result, Err(ModelError::Lowering(_))));
    }

    #[test]
    fn infeasible_models_are_errors() {
        let mut model = Model::new("infeasible");
        let x = model.add_integer("x", 0.0, 3.0).unwrap();
        model.add_constraint(Expression::from(&x).gt(3)).unwrap();
        let mut adapter = adapter(&model);
        assert!(matches!(adapter.solve(), Err(ModelError::Infeasible(_))));
    }
}
