// Intermediate expression model shared by the evaluator and the lowerings

use std::fmt;
use std::ops;
use std::rc::Rc;

use super::models::{Family, Var};
use super::registry::{Builtin, CustomOperator};
use super::solver_service::{ModelError, Result};
use super::value_objects::{Operator, VariableType};

/// `family[index]` where `index` is a decision variable (0-based)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexedVar {
    family: Family,
    index: Var,
}

impl IndexedVar {
    pub(crate) fn new(family: Family, index: Var) -> Self {
        Self { family, index }
    }

    pub fn family(&self) -> &Family {
        &self.family
    }

    pub fn index(&self) -> &Var {
        &self.index
    }
}

/// Operator node; shared between clones of the expression that owns it
#[derive(Debug)]
pub struct Operation {
    operator: Operator,
    operands: Vec<Expression>,
}

impl Operation {
    pub fn operator(&self) -> Operator {
        self.operator
    }

    pub fn operands(&self) -> &[Expression] {
        &self.operands
    }
}

/// A node of the expression tree.
///
/// Cloning is cheap: operation nodes are reference counted, and the pointer
/// of an operation node is its identity for memoisation during lowering.
#[derive(Debug, Clone)]
pub enum Expression {
    Constant(f64),
    Variable(Var),
    Indexed(IndexedVar),
    Operation(Rc<Operation>),
}

impl Expression {
    pub fn constant(value: f64) -> Self {
        Expression::Constant(value)
    }

    /// Build an operator node after checking its arity
    pub fn operation(operator: Operator, operands: Vec<Expression>) -> Result<Self> {
        check_arity(operator, operands.len())?;
        Ok(Self::node(operator, operands))
    }

    fn node(operator: Operator, operands: Vec<Expression>) -> Self {
        Expression::Operation(Rc::new(Operation { operator, operands }))
    }

    fn custom_node(builtin: Builtin, operands: Vec<Expression>) -> Self {
        Self::node(Operator::Custom(builtin.into()), operands)
    }

    /// `constant + Σ coefficient·variable`
    pub fn linear(constant: f64, terms: &[(f64, &Var)]) -> Self {
        let mut operands: Vec<Expression> = terms
            .iter()
            .map(|(coefficient, var)| Self::from(*var).times(*coefficient))
            .collect();
        if constant != 0.0 || operands.is_empty() {
            operands.insert(0, Expression::Constant(constant));
        }
        if operands.len() == 1 {
            return operands.remove(0);
        }
        Self::node(Operator::Add, operands)
    }

    pub fn operator(&self) -> Option<Operator> {
        match self {
            Expression::Operation(operation) => Some(operation.operator),
            _ => None,
        }
    }

    pub fn operands(&self) -> &[Expression] {
        match self {
            Expression::Operation(operation) => &operation.operands,
            _ => &[],
        }
    }

    pub fn as_constant(&self) -> Option<f64> {
        match self {
            Expression::Constant(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_variable(&self) -> Option<&Var> {
        match self {
            Expression::Variable(var) => Some(var),
            _ => None,
        }
    }

    /// Identity of an operation node, `None` for leaves
    pub fn node_id(&self) -> Option<usize> {
        match self {
            Expression::Operation(operation) => Some(Rc::as_ptr(operation) as usize),
            _ => None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        !matches!(self, Expression::Operation(_))
    }

    /// The custom builtin at the root, if any
    pub fn builtin(&self) -> Option<Builtin> {
        match self.operator() {
            Some(Operator::Custom(custom)) => custom.as_builtin(),
            _ => None,
        }
    }

    /// Key expression of a `collection(k)` node
    pub fn collection_key(&self) -> Option<&Expression> {
        match self.operator() {
            Some(Operator::Collection) => self.operands().first(),
            _ => None,
        }
    }

    /// Whether every value this node can take is 0 or 1
    pub fn is_boolean_valued(&self) -> bool {
        match self {
            Expression::Constant(value) => *value == 0.0 || *value == 1.0,
            Expression::Variable(var) => var.variable_type() == VariableType::Boolean,
            Expression::Indexed(indexed) => {
                indexed.family().variable_type() == VariableType::Boolean
            }
            Expression::Operation(operation) => {
                let operands = &operation.operands;
                match operation.operator {
                    op if op.is_comparison() || op.is_logical() => true,
                    Operator::None => operands.iter().all(Expression::is_boolean_valued),
                    Operator::Custom(custom) => match custom.as_builtin() {
                        Some(Builtin::ElementOf | Builtin::NotElementOf) => true,
                        Some(Builtin::Min | Builtin::Max) => {
                            operands.iter().all(Expression::is_boolean_valued)
                        }
                        Some(Builtin::IfThenElse) => {
                            operands.len() == 3
                                && operands[1].is_boolean_valued()
                                && operands[2].is_boolean_valued()
                        }
                        Some(Builtin::NAryIf) => operands
                            .iter()
                            .enumerate()
                            .filter(|(position, _)| {
                                position % 2 == 1 || *position == operands.len() - 1
                            })
                            .all(|(_, operand)| operand.is_boolean_valued()),
                        _ => false,
                    },
                    _ => false,
                }
            }
        }
    }

    /// Pre-order walk over every node
    pub fn visit<'a>(&'a self, visitor: &mut dyn FnMut(&'a Expression)) {
        visitor(self);
        for operand in self.operands() {
            operand.visit(visitor);
        }
    }

    /// Canonical string form
    pub fn stringify(&self) -> String {
        self.to_string()
    }

    pub fn plus(self, rhs: impl Into<Expression>) -> Expression {
        Self::node(Operator::Add, vec![self, rhs.into()])
    }

    pub fn minus(self, rhs: impl Into<Expression>) -> Expression {
        Self::node(Operator::Subtract, vec![self, rhs.into()])
    }

    pub fn times(self, rhs: impl Into<Expression>) -> Expression {
        Self::node(Operator::Multiply, vec![self, rhs.into()])
    }

    pub fn divided_by(self, rhs: impl Into<Expression>) -> Expression {
        Self::node(Operator::Divide, vec![self, rhs.into()])
    }

    pub fn negate(self) -> Expression {
        Self::node(Operator::Negate, vec![self])
    }

    pub fn not(self) -> Expression {
        Self::node(Operator::LogicalNot, vec![self])
    }

    /// Conjunction; nested conjunctions are merged into one node
    pub fn and(self, rhs: impl Into<Expression>) -> Expression {
        Self::associative(Operator::LogicalAnd, self, rhs.into())
    }

    /// Disjunction; nested disjunctions are merged into one node
    pub fn or(self, rhs: impl Into<Expression>) -> Expression {
        Self::associative(Operator::LogicalOr, self, rhs.into())
    }

    /// `self ⇒ rhs`, written as `(!self) || rhs`
    pub fn implies(self, rhs: impl Into<Expression>) -> Expression {
        self.not().or(rhs)
    }

    pub fn lt(self, rhs: impl Into<Expression>) -> Expression {
        Self::node(Operator::LessThan, vec![self, rhs.into()])
    }

    pub fn leq(self, rhs: impl Into<Expression>) -> Expression {
        Self::node(Operator::LessOrEqual, vec![self, rhs.into()])
    }

    pub fn gt(self, rhs: impl Into<Expression>) -> Expression {
        Self::node(Operator::GreaterThan, vec![self, rhs.into()])
    }

    pub fn geq(self, rhs: impl Into<Expression>) -> Expression {
        Self::node(Operator::GreaterOrEqual, vec![self, rhs.into()])
    }

    pub fn equals(self, rhs: impl Into<Expression>) -> Expression {
        Self::node(Operator::Equal, vec![self, rhs.into()])
    }

    pub fn not_equals(self, rhs: impl Into<Expression>) -> Expression {
        Self::node(Operator::NotEqual, vec![self, rhs.into()])
    }

    fn associative(operator: Operator, lhs: Expression, rhs: Expression) -> Expression {
        let mut operands = Vec::new();
        for side in [lhs, rhs] {
            if side.operator() == Some(operator) {
                operands.extend(side.operands().iter().cloned());
            } else {
                operands.push(side);
            }
        }
        Self::node(operator, operands)
    }
}

fn check_arity(operator: Operator, arity: usize) -> Result<()> {
    let valid = match operator {
        Operator::None | Operator::Negate | Operator::LogicalNot | Operator::Collection => {
            arity == 1
        }
        Operator::Add | Operator::Multiply | Operator::LogicalAnd | Operator::LogicalOr => {
            arity >= 1
        }
        Operator::Custom(custom) => match custom.as_builtin() {
            Some(Builtin::Sum | Builtin::Count) => true,
            Some(Builtin::Avg | Builtin::Min | Builtin::Max) => arity >= 1,
            Some(Builtin::Abs) => arity == 1,
            Some(Builtin::Pow | Builtin::ElementOf | Builtin::NotElementOf) => arity == 2,
            Some(Builtin::IfThenElse) => arity == 3,
            Some(Builtin::NAryIf) => arity >= 3 && arity % 2 == 1,
            Some(Builtin::At) => arity >= 2,
            None => true,
        },
        _ => arity == 2,
    };
    if valid {
        Ok(())
    } else {
        let name = match operator {
            Operator::Custom(custom) => custom.to_string(),
            other => format!("{:?}", other),
        };
        Err(ModelError::Construction(format!(
            "operator '{}' does not accept {} operand(s)",
            name, arity
        )))
    }
}

fn collect<I, E>(operands: I) -> Vec<Expression>
where
    I: IntoIterator<Item = E>,
    E: Into<Expression>,
{
    operands.into_iter().map(Into::into).collect()
}

/// `collection(key)`; only valid inside a collection-aware operator or `at`
pub fn collection(key: impl Into<Expression>) -> Expression {
    Expression::node(Operator::Collection, vec![key.into()])
}

/// `collection(key)[index]`, 1-based
pub fn at_collection(key: impl Into<Expression>, index: impl Into<Expression>) -> Expression {
    Expression::node(Operator::At, vec![collection(key), index.into()])
}

pub fn sum<I, E>(operands: I) -> Expression
where
    I: IntoIterator<Item = E>,
    E: Into<Expression>,
{
    Expression::custom_node(Builtin::Sum, collect(operands))
}

pub fn avg<I, E>(operands: I) -> Result<Expression>
where
    I: IntoIterator<Item = E>,
    E: Into<Expression>,
{
    custom(Builtin::Avg, collect(operands))
}

/// Number of operands, or the length of a single `collection(k)` operand
pub fn count<I, E>(operands: I) -> Expression
where
    I: IntoIterator<Item = E>,
    E: Into<Expression>,
{
    Expression::custom_node(Builtin::Count, collect(operands))
}

pub fn min<I, E>(operands: I) -> Result<Expression>
where
    I: IntoIterator<Item = E>,
    E: Into<Expression>,
{
    custom(Builtin::Min, collect(operands))
}

pub fn max<I, E>(operands: I) -> Result<Expression>
where
    I: IntoIterator<Item = E>,
    E: Into<Expression>,
{
    custom(Builtin::Max, collect(operands))
}

pub fn abs(operand: impl Into<Expression>) -> Expression {
    Expression::custom_node(Builtin::Abs, vec![operand.into()])
}

pub fn pow(base: impl Into<Expression>, exponent: impl Into<Expression>) -> Expression {
    Expression::custom_node(Builtin::Pow, vec![base.into(), exponent.into()])
}

pub fn if_then_else(
    condition: impl Into<Expression>,
    then: impl Into<Expression>,
    otherwise: impl Into<Expression>,
) -> Expression {
    Expression::custom_node(
        Builtin::IfThenElse,
        vec![condition.into(), then.into(), otherwise.into()],
    )
}

/// `n_ary_if(c1, v1, ..., cn, vn, else)`: the first truthy condition wins
pub fn n_ary_if<I, E>(operands: I) -> Result<Expression>
where
    I: IntoIterator<Item = E>,
    E: Into<Expression>,
{
    custom(Builtin::NAryIf, collect(operands))
}

pub fn element_of(value: impl Into<Expression>, collection: Expression) -> Expression {
    Expression::custom_node(Builtin::ElementOf, vec![value.into(), collection])
}

pub fn not_element_of(value: impl Into<Expression>, collection: Expression) -> Expression {
    Expression::custom_node(Builtin::NotElementOf, vec![value.into(), collection])
}

/// `at(index, v1, ..., vm)` or `at(index, collection(k))`, both 1-based
pub fn at<I, E>(index: impl Into<Expression>, values: I) -> Result<Expression>
where
    I: IntoIterator<Item = E>,
    E: Into<Expression>,
{
    let mut operands = vec![index.into()];
    operands.extend(values.into_iter().map(Into::into));
    custom(Builtin::At, operands)
}

/// Custom operator by registry handle; builtins have their arity checked
pub fn custom(operator: impl Into<CustomOperator>, operands: Vec<Expression>) -> Result<Expression> {
    Expression::operation(Operator::Custom(operator.into()), operands)
}

fn write_operand(f: &mut fmt::Formatter<'_>, operand: &Expression) -> fmt::Result {
    if operand.is_leaf() {
        write!(f, "{}", operand)
    } else {
        write!(f, "( {} )", operand)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let operation = match self {
            Expression::Constant(value) => return write!(f, "{:.2}", value),
            Expression::Variable(var) => return write!(f, "{}", var.name()),
            Expression::Indexed(indexed) => {
                return write!(f, "{}[{}]", indexed.family().name(), indexed.index().name())
            }
            Expression::Operation(operation) => operation,
        };
        let operands = &operation.operands;
        match operation.operator {
            Operator::None => write!(f, "{}", operands[0]),
            Operator::Negate => {
                write!(f, "-")?;
                write_operand(f, &operands[0])
            }
            Operator::LogicalNot => {
                write!(f, "!")?;
                write_operand(f, &operands[0])
            }
            Operator::Collection => write!(f, "collection( {} )", operands[0]),
            Operator::At => write!(f, "{}[ {} ]", operands[0], operands[1]),
            Operator::Custom(custom) => {
                write!(f, "{}( ", custom)?;
                for (position, operand) in operands.iter().enumerate() {
                    if position > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", operand)?;
                }
                write!(f, " )")
            }
            infix => {
                let symbol = infix.symbol().unwrap_or("?");
                for (position, operand) in operands.iter().enumerate() {
                    if position > 0 {
                        write!(f, " {} ", symbol)?;
                    }
                    write_operand(f, operand)?;
                }
                Ok(())
            }
        }
    }
}

impl From<f64> for Expression {
    fn from(value: f64) -> Self {
        Expression::Constant(value)
    }
}

impl From<i32> for Expression {
    fn from(value: i32) -> Self {
        Expression::Constant(f64::from(value))
    }
}

impl From<Var> for Expression {
    fn from(var: Var) -> Self {
        Expression::Variable(var)
    }
}

impl From<&Var> for Expression {
    fn from(var: &Var) -> Self {
        Expression::Variable(var.clone())
    }
}

impl From<IndexedVar> for Expression {
    fn from(indexed: IndexedVar) -> Self {
        Expression::Indexed(indexed)
    }
}

impl From<&Expression> for Expression {
    fn from(expression: &Expression) -> Self {
        expression.clone()
    }
}

macro_rules! arithmetic_ops {
    ($($trait:ident, $method:ident, $builder:ident;)*) => {$(
        impl<T: Into<Expression>> ops::$trait<T> for Expression {
            type Output = Expression;
            fn $method(self, rhs: T) -> Expression {
                self.$builder(rhs)
            }
        }

        impl<T: Into<Expression>> ops::$trait<T> for Var {
            type Output = Expression;
            fn $method(self, rhs: T) -> Expression {
                Expression::from(self).$builder(rhs)
            }
        }

        impl<T: Into<Expression>> ops::$trait<T> for &Var {
            type Output = Expression;
            fn $method(self, rhs: T) -> Expression {
                Expression::from(self).$builder(rhs)
            }
        }

        impl ops::$trait<Expression> for f64 {
            type Output = Expression;
            fn $method(self, rhs: Expression) -> Expression {
                Expression::from(self).$builder(rhs)
            }
        }

        impl ops::$trait<&Var> for f64 {
            type Output = Expression;
            fn $method(self, rhs: &Var) -> Expression {
                Expression::from(self).$builder(rhs)
            }
        }

        impl ops::$trait<Var> for f64 {
            type Output = Expression;
            fn $method(self, rhs: Var) -> Expression {
                Expression::from(self).$builder(rhs)
            }
        }
    )*};
}

arithmetic_ops! {
    Add, add, plus;
    Sub, sub, minus;
    Mul, mul, times;
    Div, div, divided_by;
}

impl ops::Neg for Expression {
    type Output = Expression;
    fn neg(self) -> Expression {
        self.negate()
    }
}

impl ops::Neg for &Var {
    type Output = Expression;
    fn neg(self) -> Expression {
        Expression::from(self).negate()
    }
}

impl ops::Not for Expression {
    type Output = Expression;
    fn not(self) -> Expression {
        Expression::not(self)
    }
}

impl ops::Not for &Var {
    type Output = Expression;
    fn not(self) -> Expression {
        Expression::from(self).not()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Model;

    fn xyz() -> (Model, Var, Var, Var) {
        let mut model = Model::new("stringify");
        let x = model.add_real("x", f64::NEG_INFINITY, f64::INFINITY).unwrap();
        let y = model.add_boolean("y").unwrap();
        let z = model.add_integer("z", 0.0, 10.0).unwrap();
        (model, x, y, z)
    }

    #[test]
    fn stringify_matches_canonical_form() {
        let (_model, x, y, z) = xyz();

        assert_eq!((&x * 3.0 + &z * 5.0).stringify(), "( x * 3.00 ) + ( z * 5.00 )");
        assert_eq!((!&y).and(&y).stringify(), "( !y ) && y");
        assert_eq!(
            max([Expression::from(0.0), Expression::from(&x), 3.0 * &z])
                .unwrap()
                .stringify(),
            "max( 0.00, x, 3.00 * z )"
        );
        assert_eq!(
            if_then_else(&y, &x, 3.0 * &z).stringify(),
            "if_then_else( y, x, 3.00 * z )"
        );
    }

    #[test]
    fn implication_is_a_disjunction() {
        let (_model, x, y, _z) = xyz();
        let implication = Expression::from(&y).implies(Expression::from(&x).geq(4));
        assert_eq!(implication.operator(), Some(Operator::LogicalOr));
        assert_eq!(implication.stringify(), "( !y ) || ( x >= 4.00 )");
    }

    #[test]
    fn conjunctions_flatten() {
        let (_model, x, y, z) = xyz();
        let left = Expression::from(&x).geq(1).and(&y);
        let right = Expression::from(&z).leq(2).and(Expression::from(&x).lt(9));
        let joined = left.and(right);
        assert_eq!(joined.operator(), Some(Operator::LogicalAnd));
        assert_eq!(joined.operands().len(), 4);

        let disjunction = Expression::from(&y).or(&y).or(&y);
        assert_eq!(disjunction.operands().len(), 3);
    }

    #[test]
    fn malformed_custom_operators_are_rejected() {
        let (_model, x, y, _z) = xyz();
        assert!(n_ary_if([Expression::from(&y), Expression::from(&x)]).is_err());
        assert!(n_ary_if([Expression::from(&y), Expression::from(&x), Expression::from(1.0)]).is_ok());
        assert!(min(Vec::<Expression>::new()).is_err());
        assert!(avg(Vec::<Expression>::new()).is_err());
        assert!(Expression::operation(Operator::Subtract, vec![Expression::from(&x)]).is_err());
    }

    #[test]
    fn linear_keeps_canonical_edges() {
        let (_model, x, _y, z) = xyz();
        let expression = Expression::linear(2.0, &[(3.0, &x), (-1.0, &z)]);
        assert_eq!(expression.stringify(), "2.00 + ( x * 3.00 ) + ( z * -1.00 )");
    }

    #[test]
    fn clones_share_node_identity() {
        let (_model, x, _y, _z) = xyz();
        let expression = &x + 1.0;
        let copy = expression.clone();
        assert_eq!(expression.node_id(), copy.node_id());
        assert_ne!(expression.node_id(), (&x + 1.0).node_id());
    }

    #[test]
    fn collection_nodes_render() {
        let (_model, x, _y, z) = xyz();
        assert_eq!(
            at_collection(&z, &x).stringify(),
            "collection( z )[ x ]"
        );
        assert_eq!(
            count([collection(2)]).stringify(),
            "count( collection( 2.00 ) )"
        );
    }

    #[test]
    fn boolean_valued_nodes() {
        let (_model, x, y, _z) = xyz();
        assert!(Expression::from(&y).is_boolean_valued());
        assert!(Expression::from(&x).leq(3).is_boolean_valued());
        assert!(!(&x + 1.0).is_boolean_valued());
        assert!(if_then_else(&y, 1.0, 0.0).is_boolean_valued());
        assert!(!if_then_else(&y, &x, 0.0).is_boolean_valued());
    }
}
