mod electron_tensor;
mod jk;
mod transform;

pub use electron_tensor::ElectronTensor;
pub use jk::{build_jk, DirectBuilder, FockBuilder, JkPair, PkBuilder};
pub use transform::{dense_so, transform_chemist, MoIntegrals, OrbitalSpaces, SpinCases};
