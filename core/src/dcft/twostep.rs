//! Alternating cumulant and orbital updates.

use crate::checkpoint::ScopedFile;
use crate::config::{DcftFunctional, DcftOptions};
use crate::convergence::{ConvergenceTracker, Criterion};
use crate::diis::DiisSubspace;
use crate::error::Result;
use crate::report::{IterationObserver, IterationRecord, Phase};
use crate::step::accelerate;

use super::driver::{tracker, ConvergenceState, Outcome};
use super::state::DcftState;

struct Loop<'r, 'f> {
    options: &'r DcftOptions,
    tracker: ConvergenceTracker,
    flags: ConvergenceState,
    file: &'r mut ScopedFile<'f>,
    observer: &'r mut dyn IterationObserver,
}

pub fn run(
    state: &mut DcftState<'_>,
    options: &DcftOptions,
    file: &mut ScopedFile<'_>,
    observer: &mut dyn IterationObserver,
) -> Result<Outcome> {
    let mut run = Loop {
        options,
        tracker: tracker(options),
        flags: ConvergenceState::default(),
        file,
        observer,
    };
    let mut cumulant_diis = DiisSubspace::in_core("cumulant DIIS", options.diis_config());
    let mut orbital_diis = DiisSubspace::in_core("orbital DIIS", options.diis_config());

    let mut cycle = 0;
    while (!run.flags.scf_done || !run.flags.lambda_done) && cycle < options.maxiter {
        cycle += 1;
        if cycle > 1 || !options.relax_guess_orbitals {
            run.cumulant_updates(state, cycle, &mut cumulant_diis)?;
        }
        if state.functional() == DcftFunctional::Cepa0 {
            run.flags.scf_done = true;
            run.flags.density_converged = true;
            state.save(run.file)?;
            break;
        }

        let orbital_cycles = if options.mo_relax {
            run.orbital_updates(state, cycle, &mut orbital_diis)?
        } else {
            log::warn!("orbital relaxation is disabled, the orbitals stay fixed");
            run.flags.density_converged = true;
            1
        };
        run.flags.scf_done = orbital_cycles == 1;
        run.flags.energy_converged = false;

        state.save(run.file)?;
        state.refresh_integrals();
    }

    Ok(Outcome {
        convergence: run.flags,
        macro_iterations: cycle,
    })
}

impl Loop<'_, '_> {
    /// Cumulant iterations at fixed orbitals.
    fn cumulant_updates(&mut self, state: &mut DcftState<'_>, cycle: usize, diis: &mut DiisSubspace) -> Result<()> {
        let options = self.options;
        diis.reset_subspace();
        let electrons = state.orbitals().alpha.nocc() + state.orbitals().beta.nocc();

        self.flags.lambda_done = false;
        self.flags.energy_converged = false;
        let mut micro = 0;
        while (!self.flags.lambda_done || !self.flags.energy_converged) && micro < options.lambda_maxiter {
            micro += 1;
            let mut record = IterationRecord::new(Phase::Cumulant, cycle, micro);

            let rms = state.cumulant_residual();
            self.tracker.record(Criterion::Cumulant, rms)?;
            self.flags.lambda_done = self.tracker.is_converged(Criterion::Cumulant);
            self.flags.cumulant_residual = rms;

            state.update_cumulant();
            if options.diis_enabled() {
                let store = rms < options.diis_start_thresh && electrons > 1;
                let (_, cumulant) = state.steps_mut();
                record.diis = accelerate(cumulant, diis, store, options.diis_min_vecs)?;
            }

            if options.relax_tau {
                state.refresh_tau(self.file.store_mut())?;
                state.build_fock();
            }
            let previous = state.total_energy();
            let energy = state.compute_energy();
            self.tracker.record(Criterion::Energy, energy)?;
            self.flags.energy_converged = self.tracker.is_converged(Criterion::Energy);

            record.energy = energy;
            record.delta_energy = energy - previous;
            record.cumulant_residual = Some(rms);
            self.observer.on_iteration(&record);
        }
        Ok(())
    }

    /// Orbital iterations at fixed cumulant and tau, returns how many ran.
    fn orbital_updates(&mut self, state: &mut DcftState<'_>, cycle: usize, diis: &mut DiisSubspace) -> Result<usize> {
        let options = self.options;
        diis.reset_subspace();
        state.refresh_tau(self.file.store_mut())?;
        let electrons = state.orbitals().alpha.nocc() + state.orbitals().beta.nocc();

        let mut orbitals_done = false;
        self.flags.density_converged = false;
        self.flags.energy_converged = false;
        let mut micro = 0;
        while (!orbitals_done || !self.flags.density_converged || !self.flags.energy_converged)
            && micro < options.scf_maxiter
        {
            micro += 1;
            let mut record = IterationRecord::new(Phase::Orbital, cycle, micro);

            state.build_fock();
            let gradient = state.orbital_residual();
            self.tracker.record(Criterion::OrbitalGradient, gradient)?;
            orbitals_done = self.tracker.is_converged(Criterion::OrbitalGradient);
            self.flags.orbital_residual = gradient;

            let previous = state.total_energy();
            let energy = state.compute_energy();
            self.tracker.record(Criterion::Energy, energy)?;
            self.flags.energy_converged = self.tracker.is_converged(Criterion::Energy);

            if options.diis_enabled() {
                let store = gradient < options.diis_start_thresh && electrons > 1;
                let (orbital, _) = state.steps_mut();
                record.diis = accelerate(orbital, diis, store, options.diis_min_vecs + 1)?;
            }

            let change = state.update_orbitals(micro)?;
            self.tracker.record(Criterion::Density, change)?;
            self.flags.density_converged = self.tracker.is_converged(Criterion::Density);
            self.flags.density_residual = change;

            record.energy = energy;
            record.delta_energy = energy - previous;
            record.orbital_residual = Some(gradient);
            record.density_residual = Some(change);
            self.observer.on_iteration(&record);
        }
        Ok(micro)
    }
}
