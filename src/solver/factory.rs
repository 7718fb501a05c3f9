use log::debug;

use crate::application::{CpAdapter, MipAdapter};
use crate::domain::{Model, Result, Solution, SolverBackend, SolverConfig, SolverService};
use crate::solver::reference::ReferenceSolver;

/// Lowered model behind the common solving interface
pub type BoxedSolver<'m> = Box<dyn SolverService<'m> + 'm>;

/// Factory for lowering a model onto the back-end named in its configuration
pub struct SolverFactory;

impl SolverFactory {
    /// Lower `model` for `config.backend`.
    ///
    /// `Auto` takes the CP lowering when the model has sequences (lists are
    /// native there) and the MIP lowering otherwise, both on the reference
    /// solver.
    pub fn create<'m>(model: &'m Model, config: SolverConfig) -> Result<BoxedSolver<'m>> {
        let backend = match config.backend {
            SolverBackend::Auto if !model.sequences().is_empty() => SolverBackend::Cp,
            SolverBackend::Auto => SolverBackend::Mip,
            other => other,
        };
        debug!("lowering '{}' for {}", model.name(), backend);
        match backend {
            SolverBackend::Cp => Ok(Box::new(CpAdapter::new(
                model,
                ReferenceSolver::new(),
                config,
            )?)),
            SolverBackend::Highs => Self::highs(model, config),
            SolverBackend::CoinCbc => Self::coin_cbc(model, config),
            _ => Ok(Box::new(MipAdapter::new(
                model,
                ReferenceSolver::new(),
                config,
            )?)),
        }
    }

    /// Lower and solve in one call
    pub fn solve<'m>(model: &'m Model, config: SolverConfig) -> Result<Solution<'m>> {
        Self::create(model, config)?.solve()
    }

    #[cfg(feature = "highs")]
    fn highs<'m>(model: &'m Model, config: SolverConfig) -> Result<BoxedSolver<'m>> {
        let backend = crate::solver::highs_solver::HighsBackend::new();
        Ok(Box::new(MipAdapter::new(model, backend, config)?))
    }

    #[cfg(not(feature = "highs"))]
    fn highs<'m>(_model: &'m Model, _config: SolverConfig) -> Result<BoxedSolver<'m>> {
        Err(crate::domain::ModelError::Backend(
            "HiGHS support is not enabled (build with the `highs` feature)".to_string(),
        ))
    }

    #[cfg(feature = "coin_cbc")]
    fn coin_cbc<'m>(model: &'m Model, config: SolverConfig) -> Result<BoxedSolver<'m>> {
        let backend = crate::solver::coin_cbc_solver::CoinCbcBackend::new();
        Ok(Box::new(MipAdapter::new(model, backend, config)?))
    }

    #[cfg(not(feature = "coin_cbc"))]
    fn coin_cbc<'m>(_model: &'m Model, _config: SolverConfig) -> Result<BoxedSolver<'m>> {
        Err(crate::domain::ModelError::Backend(
            "COIN-OR CBC support is not enabled (build with the `coin_cbc` feature)".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Expression, ModelError};

    #[test]
    fn auto_prefers_lists_for_sequences() {
        let mut model = Model::new("auto");
        model.add_sequence("order", 3).unwrap();
        let solver = SolverFactory::create(&model, SolverConfig::default()).unwrap();
        assert_eq!(solver.name(), "reference");

        let solution = SolverFactory::solve(&model, SolverConfig::default()).unwrap();
        assert!(solution.complete());
    }

    #[test]
    fn lowering_errors_come_from_create() {
        let mut model = Model::new("bad");
        let x = model.add_integer("x", 0.0, 3.0).unwrap();
        model
            .add_constraint(Expression::from(&x).divided_by(0.0).geq(1))
            .unwrap();
        let config = SolverConfig::default().with_backend(SolverBackend::Mip);
        assert!(matches!(
            SolverFactory::create(&model, config),
            Err(ModelError::Lowering(_))
        ));
    }

    #[cfg(not(feature = "highs"))]
    #[test]
    fn disabled_sdk_backends_are_reported() {
        let model = Model::new("empty");
        let config = SolverConfig::default().with_backend(SolverBackend::Highs);
        assert!(matches!(
            SolverFactory::create(&model, config),
            Err(ModelError::Backend(_))
        ));
    }
}
