//! Density cumulant functional theory: the cumulant equations coupled to the
//! orbital optimization, solved by alternating updates (`TWOSTEP`), by one
//! joint loop (`SIMULTANEOUS`) or by truncated Newton steps (`QC`).

mod cumulant;
mod driver;
mod kernel;
mod qc;
mod simultaneous;
mod state;
mod tau;
mod twostep;

pub use cumulant::{denominators, Case, CumulantStep, DensityCumulant};
pub use driver::{run_dcft, ConvergenceState, DcftDriver, DcftOutput, Outcome};
pub use kernel::{CumulantKernel, DenseCumulantKernel, MoFock};
pub use state::{DcftState, Snapshot};
pub use tau::Tau;
