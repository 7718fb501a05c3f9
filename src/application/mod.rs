// Application layer: lowering a model onto a solver back-end

pub mod collections;
pub mod cp_lowering;
pub mod mip_lowering;

pub use cp_lowering::CpAdapter;
pub use mip_lowering::MipAdapter;
