// Collection data shared by both lowerings
//
// Keys range over `[0, number_of_keys)`. A key that is not a constant must be
// an integer variable (or family lookup) with finite bounds; its range is
// clipped to the valid keys and every per-key table is laid out over the
// clipped range, lowest key first.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::rc::Rc;

use crate::domain::evaluator::{as_integer, Aggregate};
use crate::domain::{Expression, Model, ModelError, Result};

/// Tables larger than this are refused rather than built
const MAX_TABLE_CELLS: usize = 1 << 20;

/// Inclusive integer range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegerDomain {
    pub lower: i64,
    pub upper: i64,
}

impl IntegerDomain {
    pub fn new(lower: i64, upper: i64) -> Self {
        Self { lower, upper }
    }

    pub fn point(value: i64) -> Self {
        Self::new(value, value)
    }

    pub fn len(&self) -> usize {
        if self.upper < self.lower {
            0
        } else {
            (self.upper - self.lower) as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.upper < self.lower
    }

    pub fn values(&self) -> RangeInclusive<i64> {
        self.lower..=self.upper
    }
}

/// Integer range a leaf can take, `None` unless it is a bounded integer
pub fn integer_domain(model: &Model, expression: &Expression) -> Option<IntegerDomain> {
    let (lower, upper) = match expression {
        Expression::Constant(value) => return as_integer(*value).map(IntegerDomain::point),
        Expression::Variable(var) => {
            if !model.owns(var) || !var.variable_type().is_integral() {
                return None;
            }
            let variable = model.variable(var);
            (variable.lower_bound, variable.upper_bound)
        }
        Expression::Indexed(indexed) => {
            let family = indexed.family();
            if family.index() >= model.families().len() || !family.variable_type().is_integral() {
                return None;
            }
            model.family_bounds(family)
        }
        Expression::Operation(_) => return None,
    };
    if !lower.is_finite() || !upper.is_finite() {
        return None;
    }
    let domain = IntegerDomain::new(lower.ceil() as i64, upper.floor() as i64);
    (!domain.is_empty()).then_some(domain)
}

/// Keys a non-constant key expression can select
pub fn key_domain(model: &Model, key: &Expression) -> Result<IntegerDomain> {
    let number_of_keys = model
        .number_of_keys()
        .ok_or_else(|| ModelError::Lowering("no collection lookup registered".to_string()))?;
    let domain = integer_domain(model, key).ok_or_else(|| {
        ModelError::Lowering(format!(
            "collection key '{}' is not an integer variable with finite bounds",
            key
        ))
    })?;
    let clipped = IntegerDomain::new(
        domain.lower.max(0),
        domain.upper.min(number_of_keys as i64 - 1),
    );
    if clipped.is_empty() {
        return Err(ModelError::Lowering(format!(
            "collection key '{}' has no value in [0, {})",
            key, number_of_keys
        )));
    }
    Ok(clipped)
}

fn check_table(rows: usize, columns: usize) -> Result<()> {
    match rows.checked_mul(columns) {
        Some(cells) if cells <= MAX_TABLE_CELLS => Ok(()),
        _ => Err(ModelError::Lowering(format!(
            "lookup table of {} x {} cells is too large",
            rows, columns
        ))),
    }
}

fn indicator(condition: bool) -> f64 {
    if condition {
        1.0
    } else {
        0.0
    }
}

/// Collections fetched during one lowering; each key is looked up once
pub struct Collections<'m> {
    model: &'m Model,
    fetched: HashMap<usize, Rc<[f64]>>,
}

impl<'m> Collections<'m> {
    pub fn new(model: &'m Model) -> Self {
        Self {
            model,
            fetched: HashMap::new(),
        }
    }

    pub fn fetch(&mut self, key: usize) -> Result<Rc<[f64]>> {
        if let Some(values) = self.fetched.get(&key) {
            return Ok(Rc::clone(values));
        }
        let values: Rc<[f64]> = self.model.get_collection(key)?.into();
        self.fetched.insert(key, Rc::clone(&values));
        Ok(values)
    }

    /// Key named by a constant key expression
    pub fn constant_key(&self, value: f64) -> Result<usize> {
        match as_integer(value) {
            Some(key) if key >= 0 => Ok(key as usize),
            _ => Err(ModelError::Lowering(format!(
                "{} is not a valid collection key",
                value
            ))),
        }
    }

    pub fn aggregate(&mut self, aggregate: Aggregate, key: usize) -> Result<f64> {
        let values = self.fetch(key)?;
        aggregate
            .apply(&values)
            .map_err(|error| ModelError::Lowering(format!("collection {}: {}", key, error)))
    }

    /// Aggregate of every key in `keys`
    pub fn aggregate_table(&mut self, aggregate: Aggregate, keys: IntegerDomain) -> Result<Vec<f64>> {
        keys.values()
            .map(|key| self.aggregate(aggregate, key as usize))
            .collect()
    }

    pub fn contains(&mut self, key: usize, value: f64) -> Result<bool> {
        Ok(self.fetch(key)?.contains(&value))
    }

    /// 1 for every key whose collection holds `value`, 0 otherwise
    pub fn membership_vector(&mut self, keys: IntegerDomain, value: f64) -> Result<Vec<f64>> {
        keys.values()
            .map(|key| self.contains(key as usize, value).map(indicator))
            .collect()
    }

    /// Row-major `keys x values` membership matrix
    pub fn membership_matrix(
        &mut self,
        keys: IntegerDomain,
        values: IntegerDomain,
    ) -> Result<Vec<f64>> {
        check_table(keys.len(), values.len())?;
        let mut matrix = Vec::with_capacity(keys.len() * values.len());
        for key in keys.values() {
            let collection = self.fetch(key as usize)?;
            matrix.extend(
                values
                    .values()
                    .map(|value| indicator(collection.contains(&(value as f64)))),
            );
        }
        Ok(matrix)
    }

    /// Row-major `keys x width` matrix of elements, `width` being the longest
    /// collection; cells past the end of a shorter collection are `None`
    pub fn value_matrix(&mut self, keys: IntegerDomain) -> Result<(usize, Vec<Option<f64>>)> {
        let rows = keys
            .values()
            .map(|key| self.fetch(key as usize))
            .collect::<Result<Vec<_>>>()?;
        let width = rows.iter().map(|row| row.len()).max().unwrap_or(0);
        if width == 0 {
            return Err(ModelError::Lowering(format!(
                "every collection with a key in [{}, {}] is empty",
                keys.lower, keys.upper
            )));
        }
        check_table(rows.len(), width)?;
        let cells = rows
            .iter()
            .flat_map(|row| (0..width).map(move |position| row.get(position).copied()))
            .collect();
        Ok((width, cells))
    }
}
