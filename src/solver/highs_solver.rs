// HiGHS engine for the linear back-end
// Translates a LinearProblem into a HiGHS RowProblem (columns first, then rows)

use highs::{HighsModelStatus, RowProblem, Sense};
use log::warn;

use crate::domain::{ObjectiveSense, Result};
use crate::solver::backend::{BackendStatus, VariableKind};
use crate::solver::linear::{LinearBackend, LinearEngine, LinearOutcome, LinearProblem};

pub struct Highs;

/// HiGHS through the `highs` crate
pub type HighsBackend = LinearBackend<Highs>;

impl LinearEngine for Highs {
    const NAME: &'static str = "HiGHS";
    const TOLERANCE: f64 = 1e-7;

    fn optimise(problem: &LinearProblem, tolerance: f64) -> Result<LinearOutcome> {
        let mut pb = RowProblem::default();
        let objective_column = problem.objective.map(|(column, _)| column);

        let mut cols = Vec::with_capacity(problem.columns.len());
        for (index, column) in problem.columns.iter().enumerate() {
            let cost = if objective_column == Some(index) { 1.0 } else { 0.0 };
            let col = match column.kind {
                VariableKind::Integer | VariableKind::Binary => {
                    pb.add_integer_column(cost, column.lower..=column.upper)
                }
                VariableKind::Continuous => pb.add_column(cost, column.lower..=column.upper),
            };
            cols.push(col);
        }

        for row in &problem.rows {
            let terms: Vec<_> = row
                .terms
                .iter()
                .map(|(column, coefficient)| (cols[*column], *coefficient))
                .collect();
            pb.add_row(row.lower..=row.upper, &terms);
        }

        let sense = match problem.objective {
            Some((_, ObjectiveSense::Maximize)) => Sense::Maximise,
            _ => Sense::Minimise,
        };
        let mut model = pb.optimise(sense);
        model.set_option("output_flag", problem.verbose);
        model.set_option("primal_feasibility_tolerance", tolerance);
        model.set_option("mip_feasibility_tolerance", tolerance);
        if let Some(seconds) = problem.time_limit {
            model.set_option("time_limit", seconds);
        }
        if let Some(nodes) = problem.node_limit {
            model.set_option("mip_max_nodes", i32::try_from(nodes).unwrap_or(i32::MAX));
        }

        let solved = model.solve();
        let status = match solved.status() {
            HighsModelStatus::Optimal | HighsModelStatus::ModelEmpty => BackendStatus::Optimal,
            HighsModelStatus::Infeasible => BackendStatus::Infeasible,
            HighsModelStatus::Unbounded => BackendStatus::Unbounded,
            HighsModelStatus::UnboundedOrInfeasible => BackendStatus::InfeasibleOrUnbounded,
            HighsModelStatus::ReachedTimeLimit => BackendStatus::TimeLimit,
            HighsModelStatus::ReachedIterationLimit => BackendStatus::NodeLimit,
            status => {
                warn!("HiGHS returned status {:?}", status);
                BackendStatus::Unknown
            }
        };
        let columns = match status {
            BackendStatus::Infeasible
            | BackendStatus::Unbounded
            | BackendStatus::InfeasibleOrUnbounded => None,
            _ => Some(solved.get_solution().columns().to_vec()),
        };
        Ok(LinearOutcome { status, columns })
    }
}
