mod options;
mod system;

pub use options::{
    AoBasis, DcftAlgorithm, DcftFunctional, DcftOptions, GuessType, JkAlgorithm,
    Orthogonalization, ReferenceKind, ScfOptions,
};
pub use system::{ConfigAtom, ConfigSystem};
