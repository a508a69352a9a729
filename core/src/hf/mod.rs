//! Hartree-Fock: orbitals, occupation, guesses and the single-level SCF driver.

mod driver;
mod guess;
pub mod occupation;
mod orbital_step;
mod orbitals;
mod orthogonalize;

pub use driver::{run_scf, ScfDriver, ScfOutput, SolverContext};
pub use guess::{compute_guess, Guess};
pub use occupation::OccupationPolicy;
pub use orbital_step::{FockState, OrbitalStep};
pub use orbitals::{OrbitalSet, SpinChannel, SpinOrbitals};
pub use orthogonalize::Orthogonalizer;
