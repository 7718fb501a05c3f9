// Expression DAG and constraint store of the reference back-end
//
// Nodes are appended after their operands, so index order is a topological
// order: a forward pass walks the arena front to back and a backward pass
// walks it back to front.

use super::interval::Interval;
use crate::domain::{ModelError, ObjectiveSense, Result};
use crate::solver::backend::VariableKind;

/// Handle of a node in the expression arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

/// Handle of a decision variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarId(pub(crate) usize);

/// Handle of a permutation list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Relation {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Relation {
    pub(crate) fn holds(self, a: f64, b: f64) -> bool {
        match self {
            Relation::Lt => a < b,
            Relation::Le => a <= b,
            Relation::Gt => a > b,
            Relation::Ge => a >= b,
            Relation::Eq => a == b,
            Relation::Ne => a != b,
        }
    }

    pub(crate) fn negated(self) -> Relation {
        match self {
            Relation::Lt => Relation::Ge,
            Relation::Le => Relation::Gt,
            Relation::Gt => Relation::Le,
            Relation::Ge => Relation::Lt,
            Relation::Eq => Relation::Ne,
            Relation::Ne => Relation::Eq,
        }
    }

    /// Truth of the relation over every pair drawn from the two intervals
    pub(crate) fn decide(self, a: &Interval, b: &Interval) -> Option<bool> {
        match self {
            Relation::Le if a.hi <= b.lo => Some(true),
            Relation::Le if a.lo > b.hi => Some(false),
            Relation::Lt if a.hi < b.lo => Some(true),
            Relation::Lt if a.lo >= b.hi => Some(false),
            Relation::Ge => Relation::Le.decide(b, a),
            Relation::Gt => Relation::Lt.decide(b, a),
            Relation::Eq if a.is_point() && b.is_point() && a.lo == b.lo => Some(true),
            Relation::Eq if a.hi < b.lo || b.hi < a.lo => Some(false),
            Relation::Ne => Relation::Eq.decide(a, b).map(|holds| !holds),
            _ => None,
        }
    }

    /// Narrow both sides so that the relation can hold
    pub(crate) fn restrict(self, a: &Interval, b: &Interval) -> (Interval, Interval) {
        match self {
            Relation::Lt | Relation::Le => (
                Interval::new(a.lo, a.hi.min(b.hi)),
                Interval::new(b.lo.max(a.lo), b.hi),
            ),
            Relation::Gt | Relation::Ge => (
                Interval::new(a.lo.max(b.lo), a.hi),
                Interval::new(b.lo, b.hi.min(a.hi)),
            ),
            Relation::Eq => {
                let common = a.intersect(b);
                (common, common)
            }
            Relation::Ne if a.is_point() && b.is_point() && a.lo == b.lo => {
                (Interval::EMPTY, Interval::EMPTY)
            }
            Relation::Ne => (*a, *b),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Node {
    Constant(f64),
    Variable(VarId),
    Sum { terms: Vec<(f64, NodeId)>, constant: f64 },
    Product(NodeId, NodeId),
    Divide(NodeId, NodeId),
    Power(NodeId, NodeId),
    Abs(NodeId),
    Min(Vec<NodeId>),
    Max(Vec<NodeId>),
    Compare(Relation, NodeId, NodeId),
    Not(NodeId),
    And(Vec<NodeId>),
    Or(Vec<NodeId>),
    IfThenElse(NodeId, NodeId, NodeId),
    /// `array[index]`, 0-based
    Element { array: Vec<NodeId>, index: NodeId },
}

#[derive(Debug, Clone)]
pub(crate) struct VariableInfo {
    pub kind: VariableKind,
    pub lower: f64,
    pub upper: f64,
    pub name: String,
    pub node: NodeId,
}

#[derive(Debug, Clone)]
pub(crate) enum Restriction {
    Range {
        node: NodeId,
        lower: f64,
        upper: f64,
        name: String,
    },
    AllDifferent {
        members: Vec<VarId>,
        name: String,
    },
}

impl Restriction {
    pub(crate) fn name(&self) -> &str {
        match self {
            Restriction::Range { name, .. } | Restriction::AllDifferent { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Program {
    pub nodes: Vec<Node>,
    /// Node values are always 0 or 1
    pub boolean: Vec<bool>,
    pub variables: Vec<VariableInfo>,
    pub restrictions: Vec<Restriction>,
    pub lists: Vec<Vec<VarId>>,
    pub objective: Option<(NodeId, ObjectiveSense)>,
}

impl Program {
    fn push(&mut self, node: Node, boolean: bool) -> NodeId {
        self.nodes.push(node);
        self.boolean.push(boolean);
        NodeId(self.nodes.len() - 1)
    }

    fn check(&self, node: NodeId) -> Result<()> {
        if node.0 < self.nodes.len() {
            Ok(())
        } else {
            Err(ModelError::Backend(format!("unknown expression handle {}", node.0)))
        }
    }

    pub(crate) fn add_variable(
        &mut self,
        kind: VariableKind,
        lower: f64,
        upper: f64,
        name: &str,
    ) -> Result<VarId> {
        let (lower, upper) = match kind {
            VariableKind::Continuous => (lower, upper),
            VariableKind::Integer => ((lower - 1e-9).ceil(), (upper + 1e-9).floor()),
            VariableKind::Binary => (lower.max(0.0).ceil(), upper.min(1.0).floor()),
        };
        if lower.is_nan() || upper.is_nan() || lower > upper {
            return Err(ModelError::Backend(format!(
                "variable '{}' has an empty domain [{}, {}]",
                name, lower, upper
            )));
        }
        let var = VarId(self.variables.len());
        let boolean = kind != VariableKind::Continuous && lower >= 0.0 && upper <= 1.0;
        let node = self.push(Node::Variable(var), boolean);
        self.variables.push(VariableInfo {
            kind,
            lower,
            upper,
            name: name.to_string(),
            node,
        });
        Ok(var)
    }

    pub(crate) fn variable_node(&self, var: VarId) -> Option<NodeId> {
        self.variables.get(var.0).map(|info| info.node)
    }

    pub(crate) fn constant(&mut self, value: f64) -> NodeId {
        self.push(Node::Constant(value), value == 0.0 || value == 1.0)
    }

    pub(crate) fn constant_value(&self, node: NodeId) -> Option<f64> {
        match self.nodes.get(node.0) {
            Some(Node::Constant(value)) => Some(*value),
            _ => None,
        }
    }

    pub(crate) fn is_boolean(&self, node: NodeId) -> bool {
        self.boolean.get(node.0).copied().unwrap_or(false)
    }

    /// `constant + Σ coefficient·term`, with nested sums and constants folded in
    pub(crate) fn weighted_sum(&mut self, terms: &[(f64, NodeId)], constant: f64) -> Result<NodeId> {
        let mut flat: Vec<(f64, NodeId)> = Vec::with_capacity(terms.len());
        let mut constant = constant;
        for (coefficient, term) in terms {
            self.check(*term)?;
            match &self.nodes[term.0] {
                Node::Constant(value) => constant += coefficient * value,
                Node::Sum {
                    terms: inner,
                    constant: offset,
                } => {
                    constant += coefficient * offset;
                    flat.extend(inner.iter().map(|(c, t)| (coefficient * c, *t)));
                }
                _ => flat.push((*coefficient, *term)),
            }
        }
        let mut merged: Vec<(f64, NodeId)> = Vec::with_capacity(flat.len());
        for (coefficient, term) in flat {
            match merged.iter_mut().find(|(_, existing)| *existing == term) {
                Some(entry) => entry.0 += coefficient,
                None => merged.push((coefficient, term)),
            }
        }
        merged.retain(|(coefficient, _)| *coefficient != 0.0);
        match merged.as_slice() {
            [] => Ok(self.constant(constant)),
            [(coefficient, term)] if *coefficient == 1.0 && constant == 0.0 => Ok(*term),
            _ => Ok(self.push(
                Node::Sum {
                    terms: merged,
                    constant,
                },
                false,
            )),
        }
    }

    pub(crate) fn product(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        self.check(lhs)?;
        self.check(rhs)?;
        if let Some(value) = self.constant_value(lhs) {
            return self.weighted_sum(&[(value, rhs)], 0.0);
        }
        if let Some(value) = self.constant_value(rhs) {
            return self.weighted_sum(&[(value, lhs)], 0.0);
        }
        let boolean = self.is_boolean(lhs) && self.is_boolean(rhs);
        Ok(self.push(Node::Product(lhs, rhs), boolean))
    }

    pub(crate) fn divide(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        self.check(lhs)?;
        self.check(rhs)?;
        match self.constant_value(rhs) {
            Some(value) if value != 0.0 => self.weighted_sum(&[(1.0 / value, lhs)], 0.0),
            _ => Ok(self.push(Node::Divide(lhs, rhs), false)),
        }
    }

    pub(crate) fn power(&mut self, base: NodeId, exponent: NodeId) -> Result<NodeId> {
        self.check(base)?;
        self.check(exponent)?;
        match (self.constant_value(base), self.constant_value(exponent)) {
            (Some(b), Some(e)) => Ok(self.constant(b.powf(e))),
            (_, Some(e)) if e == 1.0 => Ok(base),
            _ => Ok(self.push(Node::Power(base, exponent), false)),
        }
    }

    pub(crate) fn abs(&mut self, operand: NodeId) -> Result<NodeId> {
        self.check(operand)?;
        if let Some(value) = self.constant_value(operand) {
            return Ok(self.constant(value.abs()));
        }
        let boolean = self.is_boolean(operand);
        Ok(self.push(Node::Abs(operand), boolean))
    }

    pub(crate) fn extremum(&mut self, maximum: bool, operands: &[NodeId]) -> Result<NodeId> {
        if operands.is_empty() {
            return Err(ModelError::Backend("min/max needs at least one operand".into()));
        }
        for operand in operands {
            self.check(*operand)?;
        }
        if operands.len() == 1 {
            return Ok(operands[0]);
        }
        let boolean = operands.iter().all(|operand| self.is_boolean(*operand));
        let node = if maximum {
            Node::Max(operands.to_vec())
        } else {
            Node::Min(operands.to_vec())
        };
        Ok(self.push(node, boolean))
    }

    pub(crate) fn compare(&mut self, relation: Relation, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        self.check(lhs)?;
        self.check(rhs)?;
        Ok(self.push(Node::Compare(relation, lhs, rhs), true))
    }

    pub(crate) fn not(&mut self, operand: NodeId) -> Result<NodeId> {
        self.check(operand)?;
        Ok(self.push(Node::Not(operand), true))
    }

    pub(crate) fn connective(&mut self, conjunction: bool, operands: &[NodeId]) -> Result<NodeId> {
        if operands.is_empty() {
            return Ok(self.constant(if conjunction { 1.0 } else { 0.0 }));
        }
        for operand in operands {
            self.check(*operand)?;
        }
        let node = if conjunction {
            Node::And(operands.to_vec())
        } else {
            Node::Or(operands.to_vec())
        };
        Ok(self.push(node, true))
    }

    pub(crate) fn if_then_else(
        &mut self,
        condition: NodeId,
        then: NodeId,
        otherwise: NodeId,
    ) -> Result<NodeId> {
        for node in [condition, then, otherwise] {
            self.check(node)?;
        }
        let boolean = self.is_boolean(then) && self.is_boolean(otherwise);
        Ok(self.push(Node::IfThenElse(condition, then, otherwise), boolean))
    }

    pub(crate) fn element(&mut self, array: &[NodeId], index: NodeId) -> Result<NodeId> {
        if array.is_empty() {
            return Err(ModelError::Backend("element over an empty array".into()));
        }
        for node in array {
            self.check(*node)?;
        }
        self.check(index)?;
        if let Some(position) = self.constant_value(index) {
            let position = position.round();
            if position >= 0.0 && (position as usize) < array.len() {
                return Ok(array[position as usize]);
            }
            return Err(ModelError::Backend(format!(
                "element index {} outside [0, {})",
                position,
                array.len()
            )));
        }
        let boolean = array.iter().all(|node| self.is_boolean(*node));
        Ok(self.push(
            Node::Element {
                array: array.to_vec(),
                index,
            },
            boolean,
        ))
    }

    pub(crate) fn add_range(&mut self, node: NodeId, lower: f64, upper: f64, name: &str) -> Result<()> {
        self.check(node)?;
        if lower.is_nan() || upper.is_nan() || lower > upper {
            return Err(ModelError::Backend(format!(
                "constraint '{}' has an empty range [{}, {}]",
                name, lower, upper
            )));
        }
        self.restrictions.push(Restriction::Range {
            node,
            lower,
            upper,
            name: name.to_string(),
        });
        Ok(())
    }

    pub(crate) fn add_list(&mut self, length: usize, name: &str) -> Result<ListId> {
        let members = (0..length)
            .map(|position| {
                self.add_variable(
                    VariableKind::Integer,
                    0.0,
                    length.saturating_sub(1) as f64,
                    &format!("{}[{}]", name, position),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        self.restrictions.push(Restriction::AllDifferent {
            members: members.clone(),
            name: name.to_string(),
        });
        self.lists.push(members);
        Ok(ListId(self.lists.len() - 1))
    }

    pub(crate) fn root_domains(&self) -> Vec<Interval> {
        self.variables
            .iter()
            .map(|info| Interval::new(info.lower, info.upper))
            .collect()
    }

    /// Value of every node at a point
    pub(crate) fn evaluate(&self, assignment: &[f64]) -> Vec<f64> {
        let mut values: Vec<f64> = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let value = match node {
                Node::Constant(value) => *value,
                Node::Variable(var) => assignment[var.0],
                Node::Sum { terms, constant } => terms
                    .iter()
                    .fold(*constant, |acc, (c, t)| acc + c * values[t.0]),
                Node::Product(a, b) => values[a.0] * values[b.0],
                Node::Divide(a, b) => {
                    if values[b.0] == 0.0 {
                        f64::NAN
                    } else {
                        values[a.0] / values[b.0]
                    }
                }
                Node::Power(a, b) => values[a.0].powf(values[b.0]),
                Node::Abs(a) => values[a.0].abs(),
                Node::Min(operands) => operands
                    .iter()
                    .map(|o| values[o.0])
                    .fold(f64::INFINITY, f64::min),
                Node::Max(operands) => operands
                    .iter()
                    .map(|o| values[o.0])
                    .fold(f64::NEG_INFINITY, f64::max),
                Node::Compare(relation, a, b) => indicator(relation.holds(values[a.0], values[b.0])),
                Node::Not(a) => indicator(values[a.0] == 0.0),
                Node::And(operands) => indicator(operands.iter().all(|o| values[o.0] != 0.0)),
                Node::Or(operands) => indicator(operands.iter().any(|o| values[o.0] != 0.0)),
                Node::IfThenElse(c, a, b) => {
                    if values[c.0] != 0.0 {
                        values[a.0]
                    } else {
                        values[b.0]
                    }
                }
                Node::Element { array, index } => {
                    let position = values[index.0].round();
                    if position >= 0.0 && (position as usize) < array.len() {
                        values[array[position as usize].0]
                    } else {
                        f64::NAN
                    }
                }
            };
            values.push(value);
        }
        values
    }

    /// First restriction violated by a point, beyond `tolerance`
    pub(crate) fn violation(&self, values: &[f64], assignment: &[f64], tolerance: f64) -> Option<&str> {
        self.restrictions
            .iter()
            .find(|restriction| match restriction {
                Restriction::Range {
                    node, lower, upper, ..
                } => {
                    let value = values[node.0];
                    !(value >= lower - tolerance && value <= upper + tolerance)
                }
                Restriction::AllDifferent { members, .. } => {
                    let mut taken: Vec<f64> = members.iter().map(|m| assignment[m.0].round()).collect();
                    taken.sort_by(f64::total_cmp);
                    taken.windows(2).any(|pair| pair[0] == pair[1])
                }
            })
            .map(Restriction::name)
    }
}

fn indicator(condition: bool) -> f64 {
    if condition {
        1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighted_sums_fold_constants_and_nested_sums() {
        let mut program = Program::default();
        let x = program.add_variable(VariableKind::Integer, 0.0, 5.0, "x").unwrap();
        let x = program.variable_node(x).unwrap();
        let two = program.constant(2.0);
        let inner = program.weighted_sum(&[(1.0, x), (1.0, two)], 1.0).unwrap();
        let outer = program.weighted_sum(&[(2.0, inner), (-2.0, x)], 0.0).unwrap();
        assert_eq!(program.constant_value(outer), Some(6.0));
        let same = program.weighted_sum(&[(1.0, x)], 0.0).unwrap();
        assert_eq!(same, x);
    }

    #[test]
    fn relations_decide_on_disjoint_intervals() {
        let low = Interval::new(0.0, 4.0);
        let high = Interval::new(5.0, 6.0);
        assert_eq!(Relation::Lt.decide(&low, &high), Some(true));
        assert_eq!(Relation::Ge.decide(&low, &high), Some(false));
        assert_eq!(Relation::Eq.decide(&low, &Interval::new(3.0, 8.0)), None);
        assert_eq!(
            Relation::Ne.decide(&Interval::point(5.0), &Interval::point(5.0)),
            Some(false)
        );
    }

    #[test]
    fn point_evaluation_follows_the_arena() {
        let mut program = Program::default();
        let x = program.add_variable(VariableKind::Integer, 0.0, 5.0, "x").unwrap();
        let y = program.add_variable(VariableKind::Integer, 0.0, 5.0, "y").unwrap();
        let (x, y) = (
            program.variable_node(x).unwrap(),
            program.variable_node(y).unwrap(),
        );
        let product = program.product(x, y).unwrap();
        let less = program.compare(Relation::Lt, x, y).unwrap();
        let pick = program.element(&[x, y, product], y).unwrap();
        let values = program.evaluate(&[3.0, 2.0]);
        assert_eq!(values[product.0], 6.0);
        assert_eq!(values[less.0], 0.0);
        assert_eq!(values[pick.0], 6.0);
    }
}
