use std::io;

/// Errors surfaced by the solvers.
///
/// A singular DIIS subspace is not an error: it is recovered inside
/// [`DiisSubspace::extrapolate`](crate::diis::DiisSubspace::extrapolate).
#[derive(Debug, thiserror::Error)]
pub enum SolverError {
    /// The requested options are inconsistent with each other or with the system.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A valid option that is not available in combination with another one.
    #[error("{feature} is not implemented for {combination}")]
    NotImplemented {
        feature: String,
        combination: String,
    },

    /// A tracked residual grew past the divergence bound.
    #[error("{quantity} diverged: {value:.3e} exceeds {bound:.1}")]
    Divergence {
        quantity: String,
        value: f64,
        bound: f64,
    },

    /// The iteration cap was reached without meeting the convergence criteria.
    #[error("{solver} did not converge in {iterations} iterations")]
    NonConvergence { solver: String, iterations: usize },

    /// A DIIS call supplied slots that do not match the declared layout.
    #[error("DIIS slot mismatch in {subspace}: {reason}")]
    SlotMismatch { subspace: String, reason: String },

    /// The persistence layer refused an operation.
    #[error("persistence failure on {file}: {reason}")]
    Persistence { file: String, reason: String },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl SolverError {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn not_implemented(feature: impl Into<String>, combination: impl Into<String>) -> Self {
        Self::NotImplemented {
            feature: feature.into(),
            combination: combination.into(),
        }
    }
}

pub type Result<T, E = SolverError> = std::result::Result<T, E>;
