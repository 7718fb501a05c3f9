// Depth-first branch and bound over propagated domains

use std::time::Instant;

use log::{debug, info, trace, warn};

use super::interval::Interval;
use super::program::{NodeId, Program};
use crate::domain::ObjectiveSense;
use crate::solver::backend::{BackendStatus, VariableKind};

/// Node budget applied when the caller sets none
pub const DEFAULT_NODE_LIMIT: u64 = 2_000_000;

/// Improvement required of the next incumbent, relative to the tolerance
const CUT_FACTOR: f64 = 10.0;

/// Continuous domains narrower than this are fixed at their midpoint
const NARROW_WIDTH: f64 = 1e-4;

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Limits {
    pub time_limit: Option<f64>,
    pub node_limit: Option<u64>,
    pub verbose: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct Outcome {
    pub status: BackendStatus,
    pub assignment: Option<Vec<f64>>,
    pub nodes: u64,
    pub incumbents: u64,
}

pub(crate) struct Search<'p> {
    program: &'p Program,
    tolerance: f64,
    limits: Limits,
    incumbent: Option<(Vec<f64>, f64)>,
    /// A continuous value was chosen rather than implied
    guessed: bool,
    nodes: u64,
    incumbents: u64,
}

impl<'p> Search<'p> {
    pub(crate) fn new(program: &'p Program, tolerance: f64, limits: Limits) -> Self {
        Self {
            program,
            tolerance,
            limits,
            incumbent: None,
            guessed: false,
            nodes: 0,
            incumbents: 0,
        }
    }

    pub(crate) fn run(mut self) -> Outcome {
        let started = Instant::now();
        let node_limit = self.limits.node_limit.unwrap_or(DEFAULT_NODE_LIMIT);
        let mut stack = vec![self.program.root_domains()];
        let mut stopped = None;
        let mut satisfied = false;

        while let Some(mut domains) = stack.pop() {
            if self.nodes >= node_limit {
                stopped = Some(BackendStatus::NodeLimit);
                break;
            }
            if let Some(limit) = self.limits.time_limit {
                if started.elapsed().as_secs_f64() >= limit {
                    stopped = Some(BackendStatus::TimeLimit);
                    break;
                }
            }
            self.nodes += 1;

            let cut = self.objective_cut();
            if !self.program.propagate(&mut domains, cut, self.tolerance) {
                continue;
            }
            match self.first_fail(&domains) {
                Some(index) => {
                    let children = branches(index, &domains);
                    stack.extend(children.into_iter().rev());
                }
                None => {
                    let Some(assignment) = self.complete(domains, cut) else {
                        continue;
                    };
                    let values = self.program.evaluate(&assignment);
                    let objective = self
                        .program
                        .objective
                        .map(|(node, _)| values[node.0])
                        .unwrap_or(0.0);
                    self.incumbents += 1;
                    if self.limits.verbose {
                        info!(
                            "incumbent {} with objective {} at node {}",
                            self.incumbents, objective, self.nodes
                        );
                    } else {
                        trace!(
                            "incumbent {} with objective {} at node {}",
                            self.incumbents,
                            objective,
                            self.nodes
                        );
                    }
                    self.incumbent = Some((assignment, objective));
                    if !self.optimizing() {
                        satisfied = true;
                        break;
                    }
                }
            }
        }

        let status = match (stopped, &self.incumbent) {
            (Some(limit), _) => limit,
            (None, Some(_)) if satisfied || !self.guessed => BackendStatus::Optimal,
            (None, Some(_)) => BackendStatus::Interrupted,
            (None, None) if self.guessed => BackendStatus::Unknown,
            (None, None) => BackendStatus::Infeasible,
        };
        if self.guessed && status != BackendStatus::Optimal {
            warn!("search fixed continuous variables heuristically; the result is not proven");
        }
        debug!(
            "search finished: {} after {} nodes, {} incumbents, {:.3}s",
            status,
            self.nodes,
            self.incumbents,
            started.elapsed().as_secs_f64()
        );
        Outcome {
            status,
            assignment: self.incumbent.map(|(assignment, _)| assignment),
            nodes: self.nodes,
            incumbents: self.incumbents,
        }
    }

    fn optimizing(&self) -> bool {
        matches!(
            self.program.objective,
            Some((_, ObjectiveSense::Minimize | ObjectiveSense::Maximize))
        )
    }

    /// Bound the objective node strictly past the incumbent
    fn objective_cut(&self) -> Option<(NodeId, Interval)> {
        let (node, sense) = self.program.objective?;
        let (_, best) = self.incumbent.as_ref()?;
        let step = CUT_FACTOR * self.tolerance * best.abs().max(1.0);
        match sense {
            ObjectiveSense::Minimize => Some((node, Interval::new(f64::NEG_INFINITY, best - step))),
            ObjectiveSense::Maximize => Some((node, Interval::new(best + step, f64::INFINITY))),
            ObjectiveSense::Feasible => None,
        }
    }

    /// Unfixed integral variable with the smallest domain, earliest on ties
    fn first_fail(&self, domains: &[Interval]) -> Option<usize> {
        self.program
            .variables
            .iter()
            .zip(domains)
            .enumerate()
            .filter(|(_, (info, domain))| {
                info.kind != VariableKind::Continuous && !domain.is_point()
            })
            .fold(None, |best: Option<(usize, f64)>, (index, (_, domain))| {
                let width = domain.width();
                match best {
                    Some((_, smallest)) if smallest <= width => best,
                    _ => Some((index, width)),
                }
            })
            .map(|(index, _)| index)
    }

    /// Fix the remaining continuous variables and verify the point
    fn complete(&mut self, mut domains: Vec<Interval>, cut: Option<(NodeId, Interval)>) -> Option<Vec<f64>> {
        for index in 0..domains.len() {
            let domain = domains[index];
            if domain.is_point() {
                continue;
            }
            let narrow = domain.width() <= NARROW_WIDTH * (1.0 + domain.lo.abs());
            if !narrow {
                self.guessed = true;
            }
            let mut fixed = false;
            for value in self.candidates(index, &domain, narrow) {
                let mut trial = domains.clone();
                trial[index] = Interval::point(value);
                if self.program.propagate(&mut trial, cut, self.tolerance) {
                    domains = trial;
                    fixed = true;
                    break;
                }
            }
            if !fixed {
                self.guessed = true;
                return None;
            }
        }
        let assignment: Vec<f64> = domains.iter().map(|domain| domain.lo).collect();
        let values = self.program.evaluate(&assignment);
        match self.program.violation(&values, &assignment, self.tolerance) {
            None => Some(assignment),
            Some(name) => {
                trace!("leaf rejected by '{}'", name);
                None
            }
        }
    }

    fn candidates(&self, index: usize, domain: &Interval, narrow: bool) -> Vec<f64> {
        let mut values = Vec::with_capacity(4);
        if narrow {
            values.push(domain.midpoint());
        }
        let objective_var = self.program.objective.and_then(|(node, sense)| {
            (self.program.variables[index].node == node).then_some(sense)
        });
        match objective_var {
            Some(ObjectiveSense::Maximize) => values.extend([domain.hi, domain.lo]),
            _ => values.extend([domain.lo, domain.hi]),
        }
        values.push(0.0_f64.clamp(domain.lo, domain.hi));
        if domain.lo.is_finite() && domain.hi.is_finite() {
            values.push(domain.midpoint());
        }
        let mut unique: Vec<f64> = Vec::with_capacity(values.len());
        for value in values {
            if value.is_finite() && !unique.contains(&value) {
                unique.push(value);
            }
        }
        unique
    }
}

/// Children of a branching on `index`, in exploration order
fn branches(index: usize, domains: &[Interval]) -> Vec<Vec<Interval>> {
    let domain = domains[index];
    let parts = if domain.lo.is_finite() {
        vec![
            Interval::point(domain.lo),
            Interval::new(domain.lo + 1.0, domain.hi),
        ]
    } else if domain.hi.is_finite() {
        vec![
            Interval::point(domain.hi),
            Interval::new(domain.lo, domain.hi - 1.0),
        ]
    } else {
        vec![
            Interval::point(0.0),
            Interval::new(1.0, f64::INFINITY),
            Interval::new(f64::NEG_INFINITY, -1.0),
        ]
    };
    parts
        .into_iter()
        .map(|part| {
            let mut child = domains.to_vec();
            child[index] = part;
            child
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branches_split_off_the_lower_bound_first() {
        let domains = vec![Interval::new(2.0, 5.0)];
        let children = branches(0, &domains);
        assert_eq!(children[0][0], Interval::point(2.0));
        assert_eq!(children[1][0], Interval::new(3.0, 5.0));

        let free = vec![Interval::ENTIRE];
        assert_eq!(branches(0, &free).len(), 3);
    }
}
