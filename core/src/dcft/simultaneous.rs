//! Orbitals and cumulant updated together in one loop.

use crate::checkpoint::ScopedFile;
use crate::config::DcftOptions;
use crate::convergence::Criterion;
use crate::diis::DiisSubspace;
use crate::error::Result;
use crate::report::{IterationObserver, IterationRecord, Phase};
use crate::step::{accelerate, Joint};

use super::driver::{tracker, ConvergenceState, Outcome};
use super::state::DcftState;

pub fn run(
    state: &mut DcftState<'_>,
    options: &DcftOptions,
    file: &mut ScopedFile<'_>,
    observer: &mut dyn IterationObserver,
) -> Result<Outcome> {
    let mut tracker = tracker(options);
    let mut flags = ConvergenceState::default();
    // Fa, Fb and the three cumulant blocks
    let mut diis = DiisSubspace::in_core("DCFT DIIS", options.diis_config());
    let electrons = state.orbitals().alpha.nocc() + state.orbitals().beta.nocc();

    let mut cycle = 0;
    while !flags.fully_converged() && cycle < options.maxiter {
        cycle += 1;
        let mut record = IterationRecord::new(Phase::Simultaneous, cycle, cycle);

        let rms = state.cumulant_residual();
        tracker.record(Criterion::Cumulant, rms)?;
        flags.lambda_done = tracker.is_converged(Criterion::Cumulant);
        flags.cumulant_residual = rms;
        state.update_cumulant();

        state.refresh_tau(file.store_mut())?;
        state.build_fock();
        let gradient = state.orbital_residual();
        tracker.record(Criterion::OrbitalGradient, gradient)?;
        flags.scf_done = tracker.is_converged(Criterion::OrbitalGradient);
        flags.orbital_residual = gradient;

        let previous = state.total_energy();
        let energy = state.compute_energy();
        tracker.record(Criterion::Energy, energy)?;
        flags.energy_converged = tracker.is_converged(Criterion::Energy);

        if options.diis_enabled() {
            let store = gradient < options.diis_start_thresh && rms < options.diis_start_thresh && electrons > 1;
            let (orbital, cumulant) = state.steps_mut();
            record.diis = accelerate(&mut Joint(orbital, cumulant), &mut diis, store, options.diis_min_vecs + 1)?;
        }

        let change = state.update_orbitals(cycle)?;
        tracker.record(Criterion::Density, change)?;
        flags.density_converged = tracker.is_converged(Criterion::Density);
        flags.density_residual = change;

        state.refresh_integrals();
        state.save(file)?;

        record.energy = energy;
        record.delta_energy = energy - previous;
        record.orbital_residual = Some(gradient);
        record.cumulant_residual = Some(rms);
        record.density_residual = Some(change);
        observer.on_iteration(&record);
    }

    Ok(Outcome {
        convergence: flags,
        macro_iterations: cycle,
    })
}
