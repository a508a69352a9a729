use serde::Serialize;

use crate::checkpoint::{FileId, OpenMode, ScopedFile};
use crate::config::{DcftAlgorithm, DcftOptions};
use crate::convergence::{ConvergenceTracker, Criterion, CriterionKind};
use crate::error::{Result, SolverError};
use crate::globals;
use crate::hf::{OrbitalSet, ScfDriver, ScfOutput, SolverContext};
use crate::system::IntegralSystem;

use super::cumulant::DensityCumulant;
use super::state::DcftState;
use super::{qc, simultaneous, twostep};

/// Convergence flags of the coupled iterations and the latest residuals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ConvergenceState {
    /// The orbitals needed no further update.
    pub scf_done: bool,
    pub lambda_done: bool,
    pub density_converged: bool,
    pub energy_converged: bool,
    pub orbital_residual: f64,
    pub cumulant_residual: f64,
    pub density_residual: f64,
}

impl ConvergenceState {
    pub fn converged(&self) -> bool {
        self.scf_done && self.lambda_done && self.density_converged
    }

    pub fn fully_converged(&self) -> bool {
        self.converged() && self.energy_converged
    }
}

/// How one of the algorithms ended.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Outcome {
    pub convergence: ConvergenceState,
    pub macro_iterations: usize,
}

/// Thresholds of every criterion the algorithms check.
pub(super) fn tracker(options: &DcftOptions) -> ConvergenceTracker {
    ConvergenceTracker::new(options.divergence_threshold)
        .with(Criterion::Cumulant, CriterionKind::Value, options.lambda_threshold())
        .with(Criterion::OrbitalGradient, CriterionKind::Value, options.orbital_threshold())
        .with(Criterion::Density, CriterionKind::Value, options.orbital_threshold())
        .with(Criterion::Energy, CriterionKind::Delta, options.energy_convergence)
}

/// The output of a DCFT calculation
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct DcftOutput {
    pub total_energy: f64,
    pub scf_energy: f64,
    pub lambda_energy: f64,
    pub orbitals: OrbitalSet,
    pub cumulant: DensityCumulant,
    pub macro_iterations: usize,
    pub converged: bool,
    pub convergence: ConvergenceState,
    /// The SCF that supplied the guess orbitals.
    pub reference: ScfOutput,
    /// Lowest eigenvalues of the symmetrized Newton Jacobian, if requested.
    pub stability: Option<Vec<f64>>,
}

/// Coupled orbital and cumulant optimization on top of an SCF reference.
pub struct DcftDriver<'a> {
    options: DcftOptions,
    system: &'a IntegralSystem,
    scf: ScfDriver<'a>,
}

impl<'a> DcftDriver<'a> {
    /// Checks the options and prepares the reference solver.
    pub fn new(system: &'a IntegralSystem, options: DcftOptions) -> Result<Self> {
        options.validate()?;
        let scf = ScfDriver::new(system, options.reference.clone())?;
        Ok(Self { options, system, scf })
    }

    pub fn options(&self) -> &DcftOptions {
        &self.options
    }

    pub fn run(&self, ctx: &mut SolverContext<'_>) -> Result<DcftOutput> {
        let reference = self.scf.run(ctx)?;
        if !reference.converged {
            log::warn!("continuing DCFT from an unconverged reference");
        }
        self.iterate(reference, ctx)
    }

    /// Runs the selected algorithm starting from `reference`.
    pub fn iterate(&self, reference: ScfOutput, ctx: &mut SolverContext<'_>) -> Result<DcftOutput> {
        let options = &self.options;
        let mut state = DcftState::new(
            self.system,
            self.scf.orthogonalizer(),
            self.scf.fock_builder(),
            &reference,
            options,
            &mut *ctx.store,
        )?;
        log::info!(
            "{} with the {:?} algorithm, MP2 guess energy {:.12}",
            options.dcft_functional,
            options.algorithm,
            state.total_energy()
        );

        let mut file = ScopedFile::open(&mut *ctx.store, FileId::Cumulant, OpenMode::Create)?;
        let observer = &mut *ctx.observer;
        let outcome = match options.algorithm {
            DcftAlgorithm::TwoStep => twostep::run(&mut state, options, &mut file, observer)?,
            DcftAlgorithm::Simultaneous => simultaneous::run(&mut state, options, &mut file, observer)?,
            DcftAlgorithm::Qc => qc::run(&mut state, options, &mut file, observer)?,
        };
        let stability = if options.stability_check {
            Some(qc::stability_check(&mut state, options, file.store_mut())?)
        } else {
            None
        };
        state.save(&mut file)?;
        file.close()?;

        let Outcome {
            convergence,
            macro_iterations,
        } = outcome;
        let converged = convergence.converged();
        if converged {
            log::info!("DCFT converged in {macro_iterations} macro iterations");
        } else if options.fail_on_maxiter {
            return Err(SolverError::NonConvergence {
                solver: format!("{} {:?}", options.dcft_functional, options.algorithm),
                iterations: macro_iterations,
            });
        } else {
            log::warn!("DCFT did not converge in {macro_iterations} macro iterations, continuing anyway");
        }

        let total_energy = state.total_energy();
        ctx.globals.set(globals::DCFT_SCF_ENERGY, state.scf_energy());
        ctx.globals.set(globals::DCFT_LAMBDA_ENERGY, state.lambda_energy());
        ctx.globals.set(globals::DCFT_TOTAL_ENERGY, total_energy);
        ctx.globals.set(globals::CURRENT_ENERGY, total_energy);
        log::info!("DCFT SCF energy    {:20.12}", state.scf_energy());
        log::info!("DCFT lambda energy {:20.12}", state.lambda_energy());
        log::info!("DCFT total energy  {total_energy:20.12}");

        Ok(DcftOutput {
            total_energy,
            scf_energy: state.scf_energy(),
            lambda_energy: state.lambda_energy(),
            orbitals: state.orbitals().clone(),
            cumulant: state.lambda().clone(),
            macro_iterations,
            converged,
            convergence,
            reference,
            stability,
        })
    }
}

/// Runs the reference SCF and the DCFT iterations.
pub fn run_dcft(system: &IntegralSystem, options: DcftOptions, ctx: &mut SolverContext<'_>) -> Result<DcftOutput> {
    DcftDriver::new(system, options)?.run(ctx)
}
