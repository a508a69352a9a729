//! Symmetry-blocked matrices and dense tensors used by the solvers.

mod blocked;
mod tensor;
pub(crate) mod utils;

pub use blocked::{offsets, BlockedMatrix, BlockedVector, Dimension};
pub use tensor::Tensor4;
