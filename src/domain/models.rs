use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

use super::expression::{Expression, IndexedVar};
use super::registry::Builtin;
use super::solver_service::{ModelError, Result};
use super::value_objects::{ObjectiveSense, Operator, SolverBackend, VariableType};

static NEXT_MODEL_ID: AtomicU32 = AtomicU32::new(0);

/// Handle to a variable owned by a [`Model`]
#[derive(Debug, Clone)]
pub struct Var {
    model: u32,
    index: usize,
    name: Rc<str>,
    variable_type: VariableType,
}

impl Var {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Position in the owning model's variable arena
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn variable_type(&self) -> VariableType {
        self.variable_type
    }

    pub fn model_id(&self) -> u32 {
        self.model
    }
}

impl PartialEq for Var {
    fn eq(&self, other: &Self) -> bool {
        self.model == other.model && self.index == other.index
    }
}

impl Eq for Var {}

impl Hash for Var {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.model.hash(state);
        self.index.hash(state);
    }
}

/// Handle to an indexed variable family owned by a [`Model`]
#[derive(Debug, Clone)]
pub struct Family {
    model: u32,
    index: usize,
    name: Rc<str>,
    variable_type: VariableType,
}

impl Family {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn variable_type(&self) -> VariableType {
        self.variable_type
    }

    /// `family[index]` with a decision-variable index.
    ///
    /// Positions are 0-based, matching the member names `base[0]`, `base[1]`, ...
    /// (unlike `at`, which is 1-based).
    pub fn at(&self, index: &Var) -> Expression {
        Expression::Indexed(IndexedVar::new(self.clone(), index.clone()))
    }
}

impl PartialEq for Family {
    fn eq(&self, other: &Self) -> bool {
        self.model == other.model && self.index == other.index
    }
}

impl Eq for Family {}

impl Hash for Family {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.model.hash(state);
        self.index.hash(state);
    }
}

/// Fixed-length permutation of `{1, ..., n}`
#[derive(Debug, Clone)]
pub struct Sequence {
    model: u32,
    index: usize,
    name: Rc<str>,
    members: Rc<[Var]>,
}

impl Sequence {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn member(&self, position: usize) -> Option<&Var> {
        self.members.get(position)
    }

    pub fn members(&self) -> &[Var] {
        &self.members
    }
}

/// Where a variable comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableOrigin {
    Free,
    Family { family: usize, position: usize },
    Sequence { sequence: usize, position: usize },
}

/// Decision variable stored in the model arena
#[derive(Debug, Clone)]
pub struct Variable {
    pub name: Rc<str>,
    pub variable_type: VariableType,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub deduced_from: Option<Expression>,
    pub origin: VariableOrigin,
}

impl Variable {
    pub fn is_deduced(&self) -> bool {
        self.deduced_from.is_some()
    }

    pub fn is_integral(&self) -> bool {
        self.variable_type.is_integral()
    }

    pub fn has_finite_bounds(&self) -> bool {
        self.lower_bound.is_finite() && self.upper_bound.is_finite()
    }
}

/// Family of variables sharing a type and a base name
#[derive(Debug, Clone)]
pub struct IndexedVariables {
    pub name: Rc<str>,
    pub variable_type: VariableType,
    pub members: Vec<Var>,
}

/// Top-level constraint; the expression is boolean valued
#[derive(Debug, Clone)]
pub struct Constraint {
    pub name: Option<String>,
    pub expression: Expression,
}

impl Constraint {
    /// Name if given, canonical form otherwise
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.expression.stringify(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Objective {
    pub sense: ObjectiveSense,
    pub expression: Option<Expression>,
}

/// Source of external collections, addressed by key in `[0, number_of_keys)`
pub type CollectionLookup = Box<dyn Fn(usize) -> std::result::Result<Vec<f64>, String>>;

struct CollectionSource {
    lookup: CollectionLookup,
    number_of_keys: usize,
}

impl fmt::Debug for CollectionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionSource")
            .field("number_of_keys", &self.number_of_keys)
            .finish()
    }
}

/// Configuration for the solver
#[derive(Debug, Clone)]
pub struct SolverConfig {
    pub backend: SolverBackend,
    /// Seconds; `None` runs to completion
    pub time_limit: Option<f64>,
    pub node_limit: Option<u64>,
    /// Decimal places kept when reading values back
    pub precision: u32,
    /// Overrides the back-end's own feasibility tolerance
    pub feasibility_tolerance: Option<f64>,
    pub verbose: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            backend: SolverBackend::Auto,
            time_limit: None,
            node_limit: None,
            precision: 6,
            feasibility_tolerance: None,
            verbose: false,
        }
    }
}

impl SolverConfig {
    pub fn with_backend(mut self, backend: SolverBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_time_limit(mut self, seconds: f64) -> Self {
        self.time_limit = Some(seconds);
        self
    }

    pub fn with_node_limit(mut self, nodes: u64) -> Self {
        self.node_limit = Some(nodes);
        self
    }

    pub fn with_precision(mut self, decimals: u32) -> Self {
        self.precision = decimals;
        self
    }

    pub fn with_feasibility_tolerance(mut self, tolerance: f64) -> Self {
        self.feasibility_tolerance = Some(tolerance);
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Round a value read from a back-end to the configured precision
    pub fn round(&self, value: f64) -> f64 {
        let scale = 10f64.powi(self.precision.min(15) as i32);
        let rounded = (value * scale).round() / scale;
        if rounded == 0.0 {
            0.0
        } else {
            rounded
        }
    }
}

/// Owner of every variable, family, sequence and constraint of a problem.
///
/// All containers are append-only, so the handles given out stay valid for
/// the model's lifetime.
#[derive(Debug)]
pub struct Model {
    id: u32,
    name: String,
    variables: Vec<Variable>,
    families: Vec<IndexedVariables>,
    sequences: Vec<Sequence>,
    constraints: Vec<Constraint>,
    objective: Objective,
    collections: Option<CollectionSource>,
    variable_names: HashSet<String>,
    family_names: HashSet<String>,
    sequence_names: HashSet<String>,
    constraint_names: HashSet<String>,
}

impl Model {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: NEXT_MODEL_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            variables: Vec::new(),
            families: Vec::new(),
            sequences: Vec::new(),
            constraints: Vec::new(),
            objective: Objective::default(),
            collections: None,
            variable_names: HashSet::new(),
            family_names: HashSet::new(),
            sequence_names: HashSet::new(),
            constraint_names: HashSet::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_variable(
        &mut self,
        name: impl Into<String>,
        variable_type: VariableType,
        lower: f64,
        upper: f64,
    ) -> Result<Var> {
        self.push_variable(name.into(), variable_type, lower, upper, None, VariableOrigin::Free)
    }

    pub fn add_boolean(&mut self, name: impl Into<String>) -> Result<Var> {
        self.add_variable(name, VariableType::Boolean, 0.0, 1.0)
    }

    pub fn add_integer(&mut self, name: impl Into<String>, lower: f64, upper: f64) -> Result<Var> {
        self.add_variable(name, VariableType::Integer, lower, upper)
    }

    pub fn add_real(&mut self, name: impl Into<String>, lower: f64, upper: f64) -> Result<Var> {
        self.add_variable(name, VariableType::Real, lower, upper)
    }

    /// Variable defined by `expression`, with the widest bounds of its type
    pub fn add_deduced_variable(
        &mut self,
        name: impl Into<String>,
        variable_type: VariableType,
        expression: Expression,
    ) -> Result<Var> {
        let (lower, upper) = default_bounds(variable_type);
        self.add_deduced_variable_with_bounds(name, variable_type, lower, upper, expression)
    }

    /// Variable defined by `expression`; the bounds clamp it further
    pub fn add_deduced_variable_with_bounds(
        &mut self,
        name: impl Into<String>,
        variable_type: VariableType,
        lower: f64,
        upper: f64,
        expression: Expression,
    ) -> Result<Var> {
        // Only existing handles can be referenced, so the definition graph
        // cannot contain the new variable and stays acyclic.
        self.check_expression(&expression, false)?;
        self.push_variable(
            name.into(),
            variable_type,
            lower,
            upper,
            Some(expression),
            VariableOrigin::Free,
        )
    }

    pub fn add_indexed_family(
        &mut self,
        name: impl Into<String>,
        variable_type: VariableType,
    ) -> Result<Family> {
        let name = name.into();
        if !self.family_names.insert(name.clone()) {
            return Err(ModelError::Construction(format!(
                "duplicate family name '{}'",
                name
            )));
        }
        let name: Rc<str> = Rc::from(name);
        self.families.push(IndexedVariables {
            name: Rc::clone(&name),
            variable_type,
            members: Vec::new(),
        });
        Ok(Family {
            model: self.id,
            index: self.families.len() - 1,
            name,
            variable_type,
        })
    }

    /// Append a bounded member to `family`
    pub fn emplace(&mut self, family: &Family, lower: f64, upper: f64) -> Result<Var> {
        self.emplace_member(family, lower, upper, None)
    }

    /// Append a member defined by `expression`
    pub fn emplace_deduced(&mut self, family: &Family, expression: Expression) -> Result<Var> {
        self.check_expression(&expression, false)?;
        let (lower, upper) = default_bounds(family.variable_type);
        self.emplace_member(family, lower, upper, Some(expression))
    }

    fn emplace_member(
        &mut self,
        family: &Family,
        lower: f64,
        upper: f64,
        deduced_from: Option<Expression>,
    ) -> Result<Var> {
        self.check_family(family)?;
        let position = self.families[family.index].members.len();
        let name = format!("{}[{}]", family.name, position);
        let var = self.push_variable(
            name,
            family.variable_type,
            lower,
            upper,
            deduced_from,
            VariableOrigin::Family {
                family: family.index,
                position,
            },
        )?;
        self.families[family.index].members.push(var.clone());
        Ok(var)
    }

    /// Member of `family` at a constant, 0-based position
    pub fn member(&self, family: &Family, position: usize) -> Result<Var> {
        self.check_family(family)?;
        self.families[family.index]
            .members
            .get(position)
            .cloned()
            .ok_or_else(|| {
                ModelError::Construction(format!(
                    "family '{}' has no member at position {}",
                    family.name, position
                ))
            })
    }

    pub fn family_members(&self, family: &Family) -> &[Var] {
        self.families
            .get(family.index)
            .map(|definition| definition.members.as_slice())
            .unwrap_or(&[])
    }

    /// Union of the bounds of every member of `family`
    pub fn family_bounds(&self, family: &Family) -> (f64, f64) {
        self.family_members(family)
            .iter()
            .map(|member| self.variable(member))
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lower, upper), variable| {
                (
                    lower.min(variable.lower_bound),
                    upper.max(variable.upper_bound),
                )
            })
    }

    /// Permutation of `{1, ..., length}`
    pub fn add_sequence(&mut self, name: impl Into<String>, length: usize) -> Result<Sequence> {
        let name = name.into();
        if length == 0 {
            return Err(ModelError::Construction(format!(
                "sequence '{}' must have at least one member",
                name
            )));
        }
        if self.sequence_names.contains(&name) {
            return Err(ModelError::Construction(format!(
                "duplicate sequence name '{}'",
                name
            )));
        }
        // every member name is checked before any member is created
        if let Some(taken) = (0..length)
            .map(|position| format!("{}[{}]", name, position))
            .find(|member| self.variable_names.contains(member))
        {
            return Err(ModelError::Construction(format!(
                "sequence '{}' would redefine variable '{}'",
                name, taken
            )));
        }
        let index = self.sequences.len();
        let members = (0..length)
            .map(|position| {
                self.push_variable(
                    format!("{}[{}]", name, position),
                    VariableType::Integer,
                    1.0,
                    length as f64,
                    None,
                    VariableOrigin::Sequence {
                        sequence: index,
                        position,
                    },
                )
            })
            .collect::<Result<Vec<_>>>()?;
        self.sequence_names.insert(name.clone());
        let sequence = Sequence {
            model: self.id,
            index,
            name: Rc::from(name),
            members: Rc::from(members),
        };
        self.sequences.push(sequence.clone());
        Ok(sequence)
    }

    pub fn set_objective(&mut self, sense: ObjectiveSense, expression: Expression) -> Result<()> {
        if sense == ObjectiveSense::Feasible {
            self.objective = Objective::default();
            return Ok(());
        }
        self.check_expression(&expression, false)?;
        self.objective = Objective {
            sense,
            expression: Some(expression),
        };
        Ok(())
    }

    pub fn minimize(&mut self, expression: impl Into<Expression>) -> Result<()> {
        self.set_objective(ObjectiveSense::Minimize, expression.into())
    }

    pub fn maximize(&mut self, expression: impl Into<Expression>) -> Result<()> {
        self.set_objective(ObjectiveSense::Maximize, expression.into())
    }

    pub fn add_constraint(&mut self, expression: Expression) -> Result<()> {
        self.push_constraint(None, expression)
    }

    pub fn add_named_constraint(
        &mut self,
        name: impl Into<String>,
        expression: Expression,
    ) -> Result<()> {
        let name = name.into();
        if self.constraint_names.contains(&name) {
            return Err(ModelError::Construction(format!(
                "duplicate constraint name '{}'",
                name
            )));
        }
        self.push_constraint(Some(name.clone()), expression)?;
        self.constraint_names.insert(name);
        Ok(())
    }

    fn push_constraint(&mut self, name: Option<String>, expression: Expression) -> Result<()> {
        if !expression.is_boolean_valued() {
            return Err(ModelError::Construction(format!(
                "constraint '{}' is not boolean valued",
                expression
            )));
        }
        self.check_expression(&expression, false)?;
        self.constraints.push(Constraint { name, expression });
        Ok(())
    }

    /// Register the external collection source
    pub fn set_collection_lookup<F>(&mut self, lookup: F, number_of_keys: usize)
    where
        F: Fn(usize) -> std::result::Result<Vec<f64>, String> + 'static,
    {
        self.collections = Some(CollectionSource {
            lookup: Box::new(lookup),
            number_of_keys,
        });
    }

    pub fn number_of_keys(&self) -> Option<usize> {
        self.collections.as_ref().map(|source| source.number_of_keys)
    }

    pub fn get_collection(&self, key: usize) -> Result<Vec<f64>> {
        let source = self.collections.as_ref().ok_or_else(|| ModelError::Collection {
            key,
            message: "no collection lookup registered".to_string(),
        })?;
        if key >= source.number_of_keys {
            return Err(ModelError::Collection {
                key,
                message: format!("key out of range [0, {})", source.number_of_keys),
            });
        }
        (source.lookup)(key).map_err(|message| ModelError::Collection { key, message })
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// Arena entry behind a handle
    pub fn variable(&self, var: &Var) -> &Variable {
        &self.variables[var.index]
    }

    /// Handle for the variable at arena position `index`
    pub fn handle(&self, index: usize) -> Option<Var> {
        self.variables.get(index).map(|variable| Var {
            model: self.id,
            index,
            name: Rc::clone(&variable.name),
            variable_type: variable.variable_type,
        })
    }

    pub fn handles(&self) -> impl Iterator<Item = Var> + '_ {
        (0..self.variables.len()).filter_map(move |index| self.handle(index))
    }

    pub fn families(&self) -> &[IndexedVariables] {
        &self.families
    }

    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn objective(&self) -> &Objective {
        &self.objective
    }

    pub fn owns(&self, var: &Var) -> bool {
        var.model == self.id && var.index < self.variables.len()
    }

    fn check_family(&self, family: &Family) -> Result<()> {
        if family.model != self.id || family.index >= self.families.len() {
            return Err(ModelError::Construction(format!(
                "family '{}' belongs to another model",
                family.name
            )));
        }
        Ok(())
    }

    fn check_var(&self, var: &Var) -> Result<()> {
        if !self.owns(var) {
            return Err(ModelError::Construction(format!(
                "variable '{}' belongs to another model",
                var.name
            )));
        }
        Ok(())
    }

    /// Ownership of every handle and placement of `collection(k)` nodes
    fn check_expression(&self, expression: &Expression, collection_allowed: bool) -> Result<()> {
        match expression {
            Expression::Constant(_) => Ok(()),
            Expression::Variable(var) => self.check_var(var),
            Expression::Indexed(indexed) => {
                self.check_family(indexed.family())?;
                self.check_var(indexed.index())
            }
            Expression::Operation(_) => {
                let operands = expression.operands();
                match expression.operator() {
                    Some(Operator::Collection) => {
                        if !collection_allowed {
                            return Err(ModelError::Construction(format!(
                                "'{}' may only appear inside a collection-aware operator",
                                expression
                            )));
                        }
                        self.check_expression(&operands[0], false)
                    }
                    Some(Operator::At) => {
                        if operands[0].collection_key().is_none() {
                            return Err(ModelError::Construction(format!(
                                "left side of '{}' is not a collection",
                                expression
                            )));
                        }
                        self.check_expression(&operands[0], true)?;
                        self.check_expression(&operands[1], false)
                    }
                    _ => {
                        let builtin = expression.builtin();
                        for (position, operand) in operands.iter().enumerate() {
                            let allowed = match builtin {
                                Some(
                                    Builtin::Count
                                    | Builtin::Sum
                                    | Builtin::Avg
                                    | Builtin::Min
                                    | Builtin::Max,
                                ) => operands.len() == 1,
                                Some(Builtin::ElementOf | Builtin::NotElementOf) => position == 1,
                                Some(Builtin::At) => position == 1 && operands.len() == 2,
                                _ => false,
                            };
                            self.check_expression(operand, allowed)?;
                        }
                        Ok(())
                    }
                }
            }
        }
    }

    fn push_variable(
        &mut self,
        name: String,
        variable_type: VariableType,
        lower: f64,
        upper: f64,
        deduced_from: Option<Expression>,
        origin: VariableOrigin,
    ) -> Result<Var> {
        if lower.is_nan() || upper.is_nan() || lower > upper {
            return Err(ModelError::Construction(format!(
                "variable '{}' has invalid bounds [{}, {}]",
                name, lower, upper
            )));
        }
        let (lower, upper) = match variable_type {
            VariableType::Boolean => (lower.max(0.0).ceil(), upper.min(1.0).floor()),
            VariableType::Integer => (lower.ceil(), upper.floor()),
            VariableType::Real => (lower, upper),
        };
        if lower > upper {
            return Err(ModelError::Construction(format!(
                "variable '{}' has an empty {} domain",
                name, variable_type
            )));
        }
        if self.variable_names.contains(&name) {
            return Err(ModelError::Construction(format!(
                "duplicate variable name '{}'",
                name
            )));
        }
        self.variable_names.insert(name.clone());
        let name: Rc<str> = Rc::from(name);
        self.variables.push(Variable {
            name: Rc::clone(&name),
            variable_type,
            lower_bound: lower,
            upper_bound: upper,
            deduced_from,
            origin,
        });
        Ok(Var {
            model: self.id,
            index: self.variables.len() - 1,
            name,
            variable_type,
        })
    }
}

fn default_bounds(variable_type: VariableType) -> (f64, f64) {
    match variable_type {
        VariableType::Boolean => (0.0, 1.0),
        _ => (f64::NEG_INFINITY, f64::INFINITY),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::expression::{collection, count, sum};

    #[test]
    fn names_are_unique_per_namespace() {
        let mut model = Model::new("names");
        model.add_integer("x", 0.0, 3.0).unwrap();
        assert!(model.add_real("x", 0.0, 1.0).is_err());

        let family = model.add_indexed_family("x", VariableType::Integer).unwrap();
        assert!(model.add_indexed_family("x", VariableType::Real).is_err());
        let member = model.emplace(&family, 0.0, 4.0).unwrap();
        assert_eq!(member.name(), "x[0]");
        assert!(model.add_integer("x[1]", 0.0, 1.0).is_ok());
        assert!(model.emplace(&family, 0.0, 4.0).is_err());
    }

    #[test]
    fn bounds_are_validated_and_rounded() {
        let mut model = Model::new("bounds");
        assert!(model.add_real("bad", 2.0, 1.0).is_err());
        assert!(model.add_integer("empty", 0.2, 0.8).is_err());
        let z = model.add_integer("z", -0.5, 3.7).unwrap();
        let variable = model.variable(&z);
        assert_eq!((variable.lower_bound, variable.upper_bound), (0.0, 3.0));
    }

    #[test]
    fn sequences_create_bounded_members() {
        let mut model = Model::new("sequence");
        let order = model.add_sequence("order", 4).unwrap();
        assert_eq!(order.len(), 4);
        let first = model.variable(order.member(0).unwrap());
        assert_eq!((first.lower_bound, first.upper_bound), (1.0, 4.0));
        assert_eq!(order.member(3).unwrap().name(), "order[3]");
        assert!(model.add_sequence("order", 2).is_err());
        assert!(model.add_sequence("empty", 0).is_err());
    }

    #[test]
    fn rejected_sequences_leave_no_members_behind() {
        let mut model = Model::new("sequence");
        model.add_integer("s[1]", 0.0, 5.0).unwrap();
        assert!(matches!(
            model.add_sequence("s", 3),
            Err(ModelError::Construction(_))
        ));
        assert_eq!(model.variables().len(), 1);
        assert!(model.sequences().is_empty());
        assert!(model.add_integer("s[0]", 0.0, 5.0).is_ok());

        let order = model.add_sequence("order", 2).unwrap();
        assert_eq!(order.index(), 0);
    }

    #[test]
    fn constraints_must_be_boolean() {
        let mut model = Model::new("constraints");
        let x = model.add_integer("x", 0.0, 5.0).unwrap();
        assert!(model.add_constraint(&x + 1.0).is_err());
        assert!(model.add_constraint(Expression::from(&x).geq(2)).is_ok());
        assert!(model
            .add_named_constraint("cap", Expression::from(&x).leq(4))
            .is_ok());
        assert!(model
            .add_named_constraint("cap", Expression::from(&x).leq(3))
            .is_err());
    }

    #[test]
    fn foreign_handles_are_rejected() {
        let mut first = Model::new("first");
        let mut second = Model::new("second");
        let x = first.add_integer("x", 0.0, 5.0).unwrap();
        second.add_integer("x", 0.0, 5.0).unwrap();
        assert!(second.add_constraint(Expression::from(&x).geq(1)).is_err());
    }

    #[test]
    fn collections_only_inside_aware_operators() {
        let mut model = Model::new("collections");
        let key = model.add_integer("key", 0.0, 1.0).unwrap();
        assert!(model
            .add_constraint(count([collection(&key)]).geq(1))
            .is_ok());
        assert!(model
            .add_constraint((collection(&key) + 1.0).geq(1))
            .is_err());
        assert!(model
            .add_constraint(sum([collection(&key), collection(&key)]).geq(1))
            .is_err());
    }

    #[test]
    fn collection_lookup_reports_keys() {
        let mut model = Model::new("lookup");
        assert!(matches!(
            model.get_collection(0),
            Err(ModelError::Collection { key: 0, .. })
        ));
        model.set_collection_lookup(
            |key| match key {
                0 => Ok(vec![1.0, 2.0]),
                _ => Err("no data".to_string()),
            },
            3,
        );
        assert_eq!(model.get_collection(0).unwrap(), vec![1.0, 2.0]);
        assert!(matches!(
            model.get_collection(1),
            Err(ModelError::Collection { key: 1, .. })
        ));
        assert!(model.get_collection(3).is_err());
    }

    #[test]
    fn family_bounds_are_the_union() {
        let mut model = Model::new("family");
        let family = model.add_indexed_family("k", VariableType::Integer).unwrap();
        model.emplace(&family, 2.0, 4.0).unwrap();
        model.emplace(&family, 0.0, 3.0).unwrap();
        assert_eq!(model.family_bounds(&family), (0.0, 4.0));
        assert_eq!(model.member(&family, 1).unwrap().name(), "k[1]");
        assert!(model.member(&family, 2).is_err());
    }

    #[test]
    fn rounding_follows_precision() {
        let config = SolverConfig::default().with_precision(2);
        assert_eq!(config.round(3.14159), 3.14);
        assert_eq!(config.round(-0.0001), 0.0);
    }
}
