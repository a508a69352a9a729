//! Iterative self-consistent field solvers: Hartree-Fock references and
//! density cumulant functional theory on top of them.

pub mod atom;
pub mod checkpoint;
pub mod config;
pub mod convergence;
pub mod dcft;
pub mod diis;
pub mod error;
pub mod globals;
pub mod hf;
pub mod integrals;
pub mod krylov;
pub mod linalg;
pub mod report;
pub mod step;
pub mod system;
pub mod testing;
