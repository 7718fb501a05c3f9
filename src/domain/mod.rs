// Domain module: expression model, evaluation and solutions

pub mod evaluator;
pub mod expression;
pub mod models;
pub mod registry;
pub mod solution;
pub mod solver_service;
pub mod value_objects;

pub use evaluator::*;
pub use expression::*;
pub use models::*;
pub use registry::*;
pub use solution::*;
pub use solver_service::*;
pub use value_objects::*;
