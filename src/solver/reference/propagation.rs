// Forward/backward interval propagation over the program arena (HC4)

use super::interval::Interval;
use super::program::{Node, NodeId, Program, Restriction};
use crate::solver::backend::VariableKind;

const MAX_ROUNDS: usize = 64;

/// Slack before an integer domain is rounded inwards
const INTEGRAL_SLACK: f64 = 1e-9;

fn narrow(values: &mut [Interval], node: NodeId, allowed: &Interval) -> bool {
    let next = values[node.0].intersect(allowed);
    values[node.0] = next;
    !next.is_empty()
}

fn moved(before: f64, after: f64) -> bool {
    if before == after {
        false
    } else if before.is_infinite() || after.is_infinite() {
        true
    } else {
        (before - after).abs() > 1e-9 * (1.0 + after.abs())
    }
}

/// Valid 0-based positions of an element index
fn positions(index: &Interval, len: usize) -> Option<(usize, usize)> {
    if len == 0 || index.is_empty() {
        return None;
    }
    let first = (index.lo - INTEGRAL_SLACK).ceil().max(0.0);
    let last = (index.hi + INTEGRAL_SLACK).floor().min((len - 1) as f64);
    if first > last {
        None
    } else {
        Some((first as usize, last as usize))
    }
}

fn truth(decided: Option<bool>) -> Interval {
    match decided {
        Some(true) => Interval::point(1.0),
        Some(false) => Interval::point(0.0),
        None => Interval::BOOLEAN,
    }
}

/// `x` such that `x^k` lies in `target`, for a positive integer `k`
fn root(target: &Interval, k: f64, current: &Interval) -> Interval {
    let odd = k % 2.0 == 1.0;
    if odd {
        let signed = |v: f64| v.signum() * v.abs().powf(1.0 / k);
        return Interval::new(signed(target.lo), signed(target.hi));
    }
    let outer = target.hi.max(0.0).powf(1.0 / k);
    let inner = target.lo.max(0.0).powf(1.0 / k);
    let mut allowed = current.intersect(&Interval::new(-outer, outer));
    if inner > 0.0 {
        if allowed.lo > -inner {
            allowed.lo = allowed.lo.max(inner);
        }
        if allowed.hi < inner {
            allowed.hi = allowed.hi.min(-inner);
        }
    }
    allowed
}

impl Program {
    /// Interval of every node given the variable domains
    pub(crate) fn forward(&self, domains: &[Interval]) -> Vec<Interval> {
        let mut values: Vec<Interval> = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let value = match node {
                Node::Constant(value) => Interval::point(*value),
                Node::Variable(var) => domains[var.0],
                Node::Sum { terms, constant } => terms
                    .iter()
                    .fold(Interval::point(*constant), |acc, (c, t)| {
                        acc.add(&values[t.0].scale(*c))
                    }),
                Node::Product(a, b) => values[a.0].mul(&values[b.0]),
                Node::Divide(a, b) => values[a.0].div(&values[b.0]),
                Node::Power(a, b) => values[a.0].pow(&values[b.0]),
                Node::Abs(a) => values[a.0].abs(),
                Node::Min(operands) => operands[1..]
                    .iter()
                    .fold(values[operands[0].0], |acc, o| acc.min(&values[o.0])),
                Node::Max(operands) => operands[1..]
                    .iter()
                    .fold(values[operands[0].0], |acc, o| acc.max(&values[o.0])),
                Node::Compare(relation, a, b) => truth(relation.decide(&values[a.0], &values[b.0])),
                Node::Not(a) => {
                    let operand = values[a.0];
                    truth(if operand.excludes_zero() {
                        Some(false)
                    } else if operand.is_zero() {
                        Some(true)
                    } else {
                        None
                    })
                }
                Node::And(operands) => truth(
                    if operands.iter().any(|o| values[o.0].is_zero()) {
                        Some(false)
                    } else if operands.iter().all(|o| values[o.0].excludes_zero()) {
                        Some(true)
                    } else {
                        None
                    },
                ),
                Node::Or(operands) => truth(
                    if operands.iter().any(|o| values[o.0].excludes_zero()) {
                        Some(true)
                    } else if operands.iter().all(|o| values[o.0].is_zero()) {
                        Some(false)
                    } else {
                        None
                    },
                ),
                Node::IfThenElse(c, a, b) => {
                    let condition = values[c.0];
                    if condition.excludes_zero() {
                        values[a.0]
                    } else if condition.is_zero() {
                        values[b.0]
                    } else {
                        values[a.0].hull(&values[b.0])
                    }
                }
                Node::Element { array, index } => match positions(&values[index.0], array.len()) {
                    Some((first, last)) => array[first..=last]
                        .iter()
                        .fold(Interval::EMPTY, |acc, member| acc.hull(&values[member.0])),
                    None => Interval::EMPTY,
                },
            };
            values.push(value);
        }
        values
    }

    /// Narrow `domains` to a fixed point; `false` when some domain empties.
    ///
    /// `cut` restricts one node further, the search uses it for the
    /// objective bound.
    pub(crate) fn propagate(
        &self,
        domains: &mut [Interval],
        cut: Option<(NodeId, Interval)>,
        tolerance: f64,
    ) -> bool {
        for _ in 0..MAX_ROUNDS {
            if !self.tighten_integral(domains) {
                return false;
            }
            let mut values = self.forward(domains);
            if values.iter().any(Interval::is_empty) {
                return false;
            }
            for restriction in &self.restrictions {
                if let Restriction::Range {
                    node, lower, upper, ..
                } = restriction
                {
                    let allowed = Interval::new(lower - tolerance, upper + tolerance);
                    if !narrow(&mut values, *node, &allowed) {
                        return false;
                    }
                }
            }
            if let Some((node, bound)) = cut {
                if !narrow(&mut values, node, &bound) {
                    return false;
                }
            }

            let before = domains.to_vec();
            for id in (0..self.nodes.len()).rev() {
                if !self.backward(NodeId(id), &mut values, domains) {
                    return false;
                }
            }
            if !self.all_different(domains) || !self.tighten_integral(domains) {
                return false;
            }
            let changed = before
                .iter()
                .zip(domains.iter())
                .any(|(b, a)| moved(b.lo, a.lo) || moved(b.hi, a.hi));
            if !changed {
                return true;
            }
        }
        true
    }

    fn tighten_integral(&self, domains: &mut [Interval]) -> bool {
        for (info, domain) in self.variables.iter().zip(domains.iter_mut()) {
            if info.kind != VariableKind::Continuous {
                *domain = domain.integral(INTEGRAL_SLACK);
            }
            if domain.is_empty() {
                return false;
            }
        }
        true
    }

    fn all_different(&self, domains: &mut [Interval]) -> bool {
        for restriction in &self.restrictions {
            let Restriction::AllDifferent { members, .. } = restriction else {
                continue;
            };
            let hull = members
                .iter()
                .fold(Interval::EMPTY, |acc, m| acc.hull(&domains[m.0]));
            if hull.width() + 1.0 < members.len() as f64 {
                return false;
            }
            for (i, fixed) in members.iter().enumerate() {
                let value = domains[fixed.0];
                if !value.is_point() {
                    continue;
                }
                for (j, other) in members.iter().enumerate() {
                    if i == j {
                        continue;
                    }
                    let domain = &mut domains[other.0];
                    if domain.lo == value.lo {
                        domain.lo += 1.0;
                    }
                    if domain.hi == value.lo {
                        domain.hi -= 1.0;
                    }
                    if domain.is_empty() {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Push the interval of `id` down onto its operands
    fn backward(&self, id: NodeId, values: &mut [Interval], domains: &mut [Interval]) -> bool {
        let target = values[id.0];
        if target.is_empty() {
            return false;
        }
        match &self.nodes[id.0] {
            Node::Constant(_) => true,
            Node::Variable(var) => {
                let domain = domains[var.0].intersect(&target);
                domains[var.0] = domain;
                !domain.is_empty()
            }
            Node::Sum { terms, constant } => {
                let scaled: Vec<Interval> =
                    terms.iter().map(|(c, t)| values[t.0].scale(*c)).collect();
                let total = scaled
                    .iter()
                    .fold(Interval::point(*constant), |acc, term| acc.add(term));
                let lower_infinite = scaled.iter().filter(|s| s.lo.is_infinite()).count();
                let upper_infinite = scaled.iter().filter(|s| s.hi.is_infinite()).count();
                for ((coefficient, term), own) in terms.iter().zip(&scaled) {
                    // bounds of the sum without this term
                    let others_lo = if own.lo.is_infinite() {
                        if lower_infinite > 1 {
                            f64::NEG_INFINITY
                        } else {
                            scaled
                                .iter()
                                .filter(|s| !std::ptr::eq(*s, own))
                                .fold(*constant, |acc, s| acc + s.lo)
                        }
                    } else if lower_infinite > 0 {
                        f64::NEG_INFINITY
                    } else {
                        total.lo - own.lo
                    };
                    let others_hi = if own.hi.is_infinite() {
                        if upper_infinite > 1 {
                            f64::INFINITY
                        } else {
                            scaled
                                .iter()
                                .filter(|s| !std::ptr::eq(*s, own))
                                .fold(*constant, |acc, s| acc + s.hi)
                        }
                    } else if upper_infinite > 0 {
                        f64::INFINITY
                    } else {
                        total.hi - own.hi
                    };
                    let others = Interval::new(others_lo, others_hi);
                    let allowed = target.sub(&others).scale(1.0 / coefficient);
                    if !narrow(values, *term, &allowed) {
                        return false;
                    }
                }
                true
            }
            Node::Product(a, b) if a == b => {
                let allowed = root(&target, 2.0, &values[a.0]);
                narrow(values, *a, &allowed)
            }
            Node::Product(a, b) => {
                let rhs = values[b.0];
                if rhs.excludes_zero() && !narrow(values, *a, &target.div(&rhs)) {
                    return false;
                }
                let lhs = values[a.0];
                if lhs.excludes_zero() && !narrow(values, *b, &target.div(&lhs)) {
                    return false;
                }
                true
            }
            Node::Divide(a, b) => {
                let divisor = values[b.0];
                if !narrow(values, *a, &target.mul(&divisor)) {
                    return false;
                }
                if target.excludes_zero() {
                    let dividend = values[a.0];
                    return narrow(values, *b, &dividend.div(&target));
                }
                true
            }
            Node::Power(a, e) => {
                let exponent = values[e.0];
                if !exponent.is_point() {
                    return true;
                }
                let k = exponent.lo;
                if k == 1.0 {
                    narrow(values, *a, &target)
                } else if k.fract() == 0.0 && k > 1.0 && k <= 64.0 {
                    let allowed = root(&target, k, &values[a.0]);
                    narrow(values, *a, &allowed)
                } else if k == -1.0 && target.excludes_zero() {
                    narrow(values, *a, &Interval::point(1.0).div(&target))
                } else {
                    true
                }
            }
            Node::Abs(a) => {
                let mut allowed = values[a.0].intersect(&Interval::new(-target.hi, target.hi));
                if target.lo > 0.0 {
                    if allowed.lo > -target.lo {
                        allowed.lo = allowed.lo.max(target.lo);
                    }
                    if allowed.hi < target.lo {
                        allowed.hi = allowed.hi.min(-target.lo);
                    }
                }
                narrow(values, *a, &allowed)
            }
            Node::Min(operands) => operands
                .iter()
                .all(|o| narrow(values, *o, &Interval::new(target.lo, f64::INFINITY))),
            Node::Max(operands) => operands
                .iter()
                .all(|o| narrow(values, *o, &Interval::new(f64::NEG_INFINITY, target.hi))),
            Node::Compare(relation, a, b) => {
                let relation = if target.lo > 0.5 {
                    *relation
                } else if target.hi < 0.5 {
                    relation.negated()
                } else {
                    return true;
                };
                let (lhs, rhs) = relation.restrict(&values[a.0], &values[b.0]);
                narrow(values, *a, &lhs) && narrow(values, *b, &rhs)
            }
            Node::Not(a) => {
                if target.lo > 0.5 {
                    narrow(values, *a, &Interval::point(0.0))
                } else if target.hi < 0.5 && self.is_boolean(*a) {
                    narrow(values, *a, &Interval::point(1.0))
                } else {
                    true
                }
            }
            Node::And(operands) => {
                if target.lo > 0.5 {
                    operands
                        .iter()
                        .filter(|o| self.is_boolean(**o))
                        .all(|o| narrow(values, *o, &Interval::point(1.0)))
                } else if target.hi < 0.5 {
                    let open: Vec<NodeId> = operands
                        .iter()
                        .copied()
                        .filter(|o| !values[o.0].excludes_zero())
                        .collect();
                    match open.as_slice() {
                        [] => false,
                        [last] => narrow(values, *last, &Interval::point(0.0)),
                        _ => true,
                    }
                } else {
                    true
                }
            }
            Node::Or(operands) => {
                if target.hi < 0.5 {
                    operands
                        .iter()
                        .all(|o| narrow(values, *o, &Interval::point(0.0)))
                } else if target.lo > 0.5 {
                    let open: Vec<NodeId> = operands
                        .iter()
                        .copied()
                        .filter(|o| !values[o.0].is_zero())
                        .collect();
                    match open.as_slice() {
                        [] => false,
                        [last] if self.is_boolean(*last) => {
                            narrow(values, *last, &Interval::point(1.0))
                        }
                        _ => true,
                    }
                } else {
                    true
                }
            }
            Node::IfThenElse(c, a, b) => {
                let condition = values[c.0];
                if condition.excludes_zero() {
                    return narrow(values, *a, &target);
                }
                if condition.is_zero() {
                    return narrow(values, *b, &target);
                }
                if target.intersect(&values[a.0]).is_empty()
                    && !narrow(values, *c, &Interval::point(0.0))
                {
                    return false;
                }
                if target.intersect(&values[b.0]).is_empty() && self.is_boolean(*c) {
                    return narrow(values, *c, &Interval::point(1.0));
                }
                true
            }
            Node::Element { array, index } => {
                let Some((mut first, mut last)) = positions(&values[index.0], array.len()) else {
                    return false;
                };
                while first <= last && target.intersect(&values[array[first].0]).is_empty() {
                    first += 1;
                }
                while last > first && target.intersect(&values[array[last].0]).is_empty() {
                    last -= 1;
                }
                if first > last {
                    return false;
                }
                if !narrow(values, *index, &Interval::new(first as f64, last as f64)) {
                    return false;
                }
                if first == last {
                    return narrow(values, array[first], &target);
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::reference::program::Relation;

    fn integer(program: &mut Program, name: &str, lo: f64, hi: f64) -> NodeId {
        let var = program
            .add_variable(VariableKind::Integer, lo, hi, name)
            .unwrap();
        program.variable_node(var).unwrap()
    }

    #[test]
    fn linear_bounds_are_narrowed() {
        let mut program = Program::default();
        let x = integer(&mut program, "x", 0.0, 100.0);
        let y = integer(&mut program, "y", 0.0, 100.0);
        let sum = program.weighted_sum(&[(1.0, x), (1.0, y)], 0.0).unwrap();
        program.add_range(sum, f64::NEG_INFINITY, 10.0, "cap").unwrap();
        let difference = program.weighted_sum(&[(1.0, x), (-1.0, y)], 0.0).unwrap();
        program.add_range(difference, 4.0, f64::INFINITY, "gap").unwrap();

        let mut domains = program.root_domains();
        assert!(program.propagate(&mut domains, None, 1e-6));
        assert_eq!(domains[0], Interval::new(4.0, 10.0));
        assert_eq!(domains[1], Interval::new(0.0, 6.0));
    }

    #[test]
    fn product_of_a_binary_fixes_the_binary() {
        // b·(x - 3) >= 0 with x <= 2 forces b = 0
        let mut program = Program::default();
        let b = program.add_variable(VariableKind::Binary, 0.0, 1.0, "b").unwrap();
        let b = program.variable_node(b).unwrap();
        let x = integer(&mut program, "x", 0.0, 2.0);
        let shifted = program.weighted_sum(&[(1.0, x)], -3.0).unwrap();
        let product = program.product(b, shifted).unwrap();
        program.add_range(product, 0.0, f64::INFINITY, "reified").unwrap();

        let mut domains = program.root_domains();
        assert!(program.propagate(&mut domains, None, 1e-6));
        assert_eq!(domains[0], Interval::point(0.0));
    }

    #[test]
    fn strict_comparison_between_tied_points_fails() {
        let mut program = Program::default();
        let x = integer(&mut program, "x", 5.0, 5.0);
        let y = integer(&mut program, "y", 5.0, 5.0);
        let less = program.compare(Relation::Lt, x, y).unwrap();
        program.add_range(less, 1.0, 1.0, "less").unwrap();
        let mut domains = program.root_domains();
        assert!(!program.propagate(&mut domains, None, 1e-6));
    }

    #[test]
    fn element_trims_the_index() {
        let mut program = Program::default();
        let i = integer(&mut program, "i", 0.0, 3.0);
        let array: Vec<NodeId> = [10.0, 20.0, 30.0, 40.0]
            .iter()
            .map(|v| program.constant(*v))
            .collect();
        let value = program.element(&array, i).unwrap();
        program.add_range(value, 25.0, 35.0, "pick").unwrap();
        let mut domains = program.root_domains();
        assert!(program.propagate(&mut domains, None, 1e-6));
        assert_eq!(domains[0], Interval::point(2.0));
    }

    #[test]
    fn all_different_removes_fixed_values() {
        let mut program = Program::default();
        let list = program.add_list(3, "order").unwrap();
        let members = program.lists[list.0].clone();
        let mut domains = program.root_domains();
        domains[members[0].0] = Interval::point(0.0);
        domains[members[1].0] = Interval::point(2.0);
        assert!(program.propagate(&mut domains, None, 1e-6));
        assert_eq!(domains[members[2].0], Interval::point(1.0));
    }
}
