// Solver back-ends: trait contracts, the reference solver and SDK adapters

pub mod backend;
pub mod factory;
pub mod linear;
pub mod reference;

#[cfg(feature = "coin_cbc")]
pub mod coin_cbc_solver;
#[cfg(feature = "highs")]
pub mod highs_solver;

pub use backend::{BackendStatus, CpBackend, CpOperator, MipBackend, VariableKind};
pub use factory::SolverFactory;
pub use linear::{LinearBackend, LinearEngine};
pub use reference::ReferenceSolver;

#[cfg(feature = "coin_cbc")]
pub use coin_cbc_solver::CoinCbcBackend;
#[cfg(feature = "highs")]
pub use highs_solver::HighsBackend;
