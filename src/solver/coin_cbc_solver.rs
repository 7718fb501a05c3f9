// COIN-OR CBC engine for the linear back-end, through good_lp

use good_lp::{
    solvers::coin_cbc, variable, variables, Expression, ResolutionError,
    Solution as GoodLpSolutionTrait, SolverModel, Variable as GoodLpVariable,
};
use log::warn;

use crate::domain::{ModelError, ObjectiveSense, Result};
use crate::solver::backend::{BackendStatus, VariableKind};
use crate::solver::linear::{LinearBackend, LinearEngine, LinearOutcome, LinearProblem};

pub struct CoinCbc;

/// COIN-OR CBC through `good_lp`
pub type CoinCbcBackend = LinearBackend<CoinCbc>;

impl LinearEngine for CoinCbc {
    const NAME: &'static str = "COIN-OR CBC";
    const TOLERANCE: f64 = 1e-7;

    fn optimise(problem: &LinearProblem, tolerance: f64) -> Result<LinearOutcome> {
        let mut vars = variables!();
        let mut lp_variables: Vec<GoodLpVariable> = Vec::with_capacity(problem.columns.len());
        for column in &problem.columns {
            let mut definition = variable();
            if column.kind != VariableKind::Continuous {
                definition = definition.integer();
            }
            if column.lower.is_finite() {
                definition = definition.min(column.lower);
            }
            if column.upper.is_finite() {
                definition = definition.max(column.upper);
            }
            lp_variables.push(vars.add(definition));
        }

        let objective: Expression = match problem.objective {
            Some((column, _)) => lp_variables[column].into(),
            None => 0.into(),
        };
        let mut lp_model = match problem.objective {
            Some((_, ObjectiveSense::Maximize)) => vars.maximise(objective),
            _ => vars.minimise(objective),
        }
        .using(coin_cbc::coin_cbc);
        lp_model.set_parameter("log", if problem.verbose { "1" } else { "0" });
        lp_model.set_parameter("primalTolerance", &tolerance.to_string());
        if let Some(seconds) = problem.time_limit {
            lp_model.set_parameter("seconds", &seconds.to_string());
        }
        if let Some(nodes) = problem.node_limit {
            lp_model.set_parameter("maxNodes", &nodes.to_string());
        }

        for row in &problem.rows {
            let mut lhs: Expression = 0.into();
            for (column, coefficient) in &row.terms {
                lhs += *coefficient * lp_variables[*column];
            }
            if row.lower == row.upper {
                lp_model = lp_model.with(lhs.eq(row.lower));
                continue;
            }
            if row.lower.is_finite() {
                lp_model = lp_model.with(lhs.clone().geq(row.lower));
            }
            if row.upper.is_finite() {
                lp_model = lp_model.with(lhs.leq(row.upper));
            }
        }

        let limited = problem.time_limit.is_some() || problem.node_limit.is_some();
        match lp_model.solve() {
            Ok(sol) => {
                let columns: Vec<f64> = lp_variables.iter().map(|var| sol.value(*var)).collect();
                let status = if !limited || sol.model().is_proven_optimal() {
                    BackendStatus::Optimal
                } else {
                    BackendStatus::Interrupted
                };
                Ok(LinearOutcome {
                    status,
                    columns: Some(columns),
                })
            }
            Err(ResolutionError::Infeasible) => Ok(LinearOutcome {
                status: BackendStatus::Infeasible,
                columns: None,
            }),
            Err(ResolutionError::Unbounded) => Ok(LinearOutcome {
                status: BackendStatus::Unbounded,
                columns: None,
            }),
            Err(e) if limited => {
                warn!("CBC stopped without a solution: {:?}", e);
                Ok(LinearOutcome {
                    status: BackendStatus::Interrupted,
                    columns: None,
                })
            }
            Err(e) => Err(ModelError::Backend(format!("{:?}", e))),
        }
    }
}
