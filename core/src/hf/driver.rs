use crate::checkpoint::Persistence;
use crate::config::{GuessType, ReferenceKind, ScfOptions};
use crate::convergence::{ConvergenceTracker, Criterion, CriterionKind};
use crate::diis::DiisSubspace;
use crate::error::{Result, SolverError};
use crate::globals::{self, Globals};
use crate::integrals::{build_jk, FockBuilder};
use crate::linalg::BlockedMatrix;
use crate::report::{IterationObserver, IterationRecord, Phase};
use crate::step::accelerate;
use crate::system::IntegralSystem;

use super::guess::{compute_guess, Guess};
use super::occupation::OccupationPolicy;
use super::orbital_step::OrbitalStep;
use super::orbitals::{OrbitalSet, SpinChannel};
use super::orthogonalize::Orthogonalizer;

/// The collaborators a solver reports to and persists through.
pub struct SolverContext<'a> {
    pub store: &'a mut dyn Persistence,
    pub observer: &'a mut dyn IterationObserver,
    pub globals: &'a mut Globals,
}

/// The output of an SCF calculation
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ScfOutput {
    pub reference: ReferenceKind,
    /// Final orbitals, occupied first within each irrep.
    pub orbitals: OrbitalSet,
    /// Alpha and beta densities the final energy belongs to.
    pub densities: (BlockedMatrix, BlockedMatrix),
    /// Alpha and beta Fock matrices built from `densities`.
    pub fock: (BlockedMatrix, BlockedMatrix),
    pub total_energy: f64,
    pub one_electron_energy: f64,
    pub two_electron_energy: f64,
    pub nuclear_repulsion: f64,
    /// After how many iterations the loop stopped.
    pub iterations: usize,
    pub converged: bool,
    /// The guess that was actually used.
    pub guess: GuessType,
    /// `(<S^2>, S(S+1))` of open-shell references.
    pub spin_contamination: Option<(f64, f64)>,
}

impl ScfOutput {
    pub fn electronic_energy(&self) -> f64 {
        self.total_energy - self.nuclear_repulsion
    }
}

/// Single-level SCF over RHF, UHF or ROHF.
pub struct ScfDriver<'a> {
    options: ScfOptions,
    system: &'a IntegralSystem,
    x: Orthogonalizer,
    jk: Box<dyn FockBuilder + 'a>,
    policy: OccupationPolicy,
}

impl<'a> ScfDriver<'a> {
    /// Validates the options and sets up the orthogonalizer and the Fock builder.
    pub fn new(system: &'a IntegralSystem, options: ScfOptions) -> Result<Self> {
        options.validate()?;
        let x = Orthogonalizer::new(system.overlap(), options.s_orthogonalization, options.s_tolerance)?;
        let jk = build_jk(options.scf_type, system.eri(), system.nsopi())?;
        let policy = OccupationPolicy::new(&options, system.nalpha(), system.nbeta(), &x.nmopi())?;
        log::debug!(
            "{:?} on {} with {} functions, {} alpha and {} beta electrons",
            options.reference,
            system.name(),
            system.nso(),
            system.nalpha(),
            system.nbeta(),
        );

        Ok(Self {
            options,
            system,
            x,
            jk,
            policy,
        })
    }

    pub fn options(&self) -> &ScfOptions {
        &self.options
    }

    pub fn orthogonalizer(&self) -> &Orthogonalizer {
        &self.x
    }

    pub fn fock_builder(&self) -> &dyn FockBuilder {
        self.jk.as_ref()
    }

    pub fn run(&self, ctx: &mut SolverContext<'_>) -> Result<ScfOutput> {
        let options = &self.options;
        let guess = compute_guess(
            options.guess,
            self.system,
            &self.x,
            &self.policy,
            &mut *ctx.store,
            options.s_tolerance,
        )?;
        self.iterate(&guess, ctx)
    }

    /// Iterates from an explicit starting point.
    pub fn iterate(&self, guess: &Guess, ctx: &mut SolverContext<'_>) -> Result<ScfOutput> {
        let options = &self.options;
        let mut step = OrbitalStep::new(options.reference, self.system, &self.x, self.jk.as_ref(), guess)
            .with_damping(options.damping_percentage, options.damping_convergence);
        let mut diis = DiisSubspace::in_core("SCF DIIS", options.diis_config());
        let mut tracker = ConvergenceTracker::new(options.divergence_threshold)
            .with(Criterion::Energy, CriterionKind::Delta, options.e_convergence)
            .with(Criterion::OrbitalGradient, CriterionKind::Value, options.d_convergence);
        let electrons = self.system.nalpha() + self.system.nbeta();

        // the guess density gives the first energy
        step.build_fock();
        let mut energy = step.energy();
        tracker.record(Criterion::Energy, energy)?;
        log::info!("energy of the guess density: {energy:.12}");

        let mut converged = false;
        let mut iterations = 0;
        while iterations < options.maxiter {
            iterations += 1;
            let mut record = IterationRecord::new(Phase::Scf, iterations, iterations);

            let gradient = step.compute_error();
            tracker.record(Criterion::OrbitalGradient, gradient)?;

            if options.diis_enabled() {
                let store = iterations >= options.diis_start
                    && gradient < options.diis_start_threshold
                    && electrons > 1;
                record.diis = accelerate(&mut step, &mut diis, store, options.diis_min_vecs)?;
            }

            step.diagonalize();
            record.flags = step.occupy(iterations, &self.policy)?;
            let (_, damped) = step.form_density();
            record.flags.damping = damped;

            step.build_fock();
            let previous = energy;
            energy = step.energy();
            tracker.record(Criterion::Energy, energy)?;
            ctx.globals.set(globals::SCF_ITERATION_ENERGY, energy);

            record.energy = energy;
            record.delta_energy = energy - previous;
            record.orbital_residual = Some(gradient);
            ctx.observer.on_iteration(&record);

            if !self.policy.pending(iterations)
                && tracker.all_converged(&[Criterion::Energy, Criterion::OrbitalGradient])
            {
                converged = true;
                break;
            }
        }

        if converged {
            log::info!("SCF converged in {iterations} iterations");
        } else if options.fail_on_maxiter {
            return Err(SolverError::NonConvergence {
                solver: format!("{:?} SCF", options.reference),
                iterations,
            });
        } else {
            log::warn!("SCF did not converge in {iterations} iterations, continuing anyway");
        }

        self.finalize(step, energy, iterations, converged, guess.kind, ctx)
    }

    fn finalize(
        &self,
        mut step: OrbitalStep<'_>,
        energy: f64,
        iterations: usize,
        converged: bool,
        guess: GuessType,
        ctx: &mut SolverContext<'_>,
    ) -> Result<ScfOutput> {
        let options = &self.options;
        step.canonical_phases();

        let mut orbitals = step.orbitals().clone();
        if options.frac_start > 0 && options.frac_renormalize {
            log::info!("fractional occupations renormalized to whole electrons");
            for spin in SpinChannel::BOTH {
                let noccpi = orbitals.spin(spin).noccpi().clone();
                orbitals.spin_mut(spin).occupy(&noccpi);
            }
        }

        let spin_contamination = match options.reference {
            ReferenceKind::Rhf => None,
            ReferenceKind::Uhf | ReferenceKind::Rohf => {
                let (s2, exact) = orbitals.spin_contamination(self.system.overlap());
                log::info!("<S^2> = {s2:.8}, S(S+1) = {exact:.8}");
                Some((s2, exact))
            }
        };

        let nuclear_repulsion = self.system.nuclear_repulsion();
        ctx.globals.set(globals::NUCLEAR_REPULSION_ENERGY, nuclear_repulsion);
        ctx.globals.set(globals::ONE_ELECTRON_ENERGY, step.one_electron_energy());
        ctx.globals.set(globals::TWO_ELECTRON_ENERGY, step.two_electron_energy());
        ctx.globals.set(globals::SCF_TOTAL_ENERGY, energy);
        ctx.globals.set(globals::CURRENT_ENERGY, energy);
        log::info!("final SCF energy: {energy:.12}");

        orbitals.save(&mut *ctx.store)?;

        Ok(ScfOutput {
            reference: options.reference,
            densities: (
                step.density(SpinChannel::Alpha).clone(),
                step.density(SpinChannel::Beta).clone(),
            ),
            fock: (
                step.fock(SpinChannel::Alpha).f.clone(),
                step.fock(SpinChannel::Beta).f.clone(),
            ),
            orbitals,
            total_energy: energy,
            one_electron_energy: step.one_electron_energy(),
            two_electron_energy: step.two_electron_energy(),
            nuclear_repulsion,
            iterations,
            converged,
            guess,
            spin_contamination,
        })
    }
}

/// Runs a complete SCF with the given options.
pub fn run_scf(system: &IntegralSystem, options: ScfOptions, ctx: &mut SolverContext<'_>) -> Result<ScfOutput> {
    ScfDriver::new(system, options)?.run(ctx)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::checkpoint::MemoryStore;
    use crate::config::JkAlgorithm;
    use crate::convergence::DIVERGENCE_THRESHOLD;
    use crate::report::RecordingObserver;
    use crate::testing;

    struct Harness {
        store: MemoryStore,
        observer: RecordingObserver,
        globals: Globals,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: MemoryStore::new(),
                observer: RecordingObserver::new(),
                globals: Globals::new(),
            }
        }

        fn run(&mut self, system: &IntegralSystem, options: ScfOptions) -> Result<ScfOutput> {
            let mut ctx = SolverContext {
                store: &mut self.store,
                observer: &mut self.observer,
                globals: &mut self.globals,
            };
            run_scf(system, options, &mut ctx)
        }
    }

    #[test]
    fn core_only_converges_in_one_iteration() {
        let system = testing::core_only(-1.5, 0.5).unwrap();
        let mut harness = Harness::new();
        let output = harness.run(&system, ScfOptions::default()).unwrap();

        assert!(output.converged);
        assert_eq!(output.iterations, 1);
        assert_relative_eq!(output.total_energy, -3.0, epsilon = 1e-12);
        assert_eq!(harness.globals.get(globals::CURRENT_ENERGY), Some(output.total_energy));
        assert_eq!(harness.globals.get(globals::TWO_ELECTRON_ENERGY), Some(0.0));
        assert_eq!(harness.observer.phase(Phase::Scf).count(), 1);
    }

    #[test]
    fn closed_shell_references_agree() {
        let system = testing::model_system(&[4, 2], 2, 2).unwrap();
        let mut energies = Vec::new();
        for reference in [ReferenceKind::Rhf, ReferenceKind::Uhf, ReferenceKind::Rohf] {
            let options = ScfOptions {
                reference,
                e_convergence: 1e-10,
                d_convergence: 1e-8,
                ..Default::default()
            };
            let output = Harness::new().run(&system, options).unwrap();
            assert!(output.converged);
            energies.push(output.total_energy);
        }
        assert_relative_eq!(energies[0], energies[1], epsilon = 1e-8);
        assert_relative_eq!(energies[0], energies[2], epsilon = 1e-8);
    }

    #[test]
    fn model_systems_settle_on_one_occupation() {
        for (nsopi, nalpha, nbeta) in [(&[4, 2][..], 2, 2), (&[5][..], 2, 2), (&[6][..], 3, 3)] {
            let system = testing::model_system(nsopi, nalpha, nbeta).unwrap();
            let mut harness = Harness::new();
            let output = harness.run(&system, ScfOptions::default()).unwrap();
            assert!(output.converged);
            assert!(output.iterations < 20, "{nsopi:?} took {} iterations", output.iterations);

            let energies: Vec<f64> = harness.observer.phase(Phase::Scf).map(|r| r.energy).collect();
            let last = energies[energies.len() - 1];
            assert!(energies[energies.len() / 2..].iter().all(|e| (e - last).abs() < 1e-3));
        }
    }

    #[test]
    fn jk_algorithms_agree() {
        let system = testing::model_system(&[5], 2, 2).unwrap();
        let run = |scf_type| {
            let options = ScfOptions {
                scf_type,
                e_convergence: 1e-10,
                d_convergence: 1e-8,
                ..Default::default()
            };
            Harness::new().run(&system, options).unwrap().total_energy
        };
        assert_relative_eq!(run(JkAlgorithm::Pk), run(JkAlgorithm::Direct), epsilon = 1e-9);
    }

    #[test]
    fn diis_extrapolates_once_enough_vectors_are_stored() {
        let system = testing::model_system(&[6], 3, 3).unwrap();
        let mut harness = Harness::new();
        harness.run(&system, ScfOptions::default()).unwrap();

        let records: Vec<_> = harness.observer.phase(Phase::Scf).collect();
        assert!(records[0].diis.stored && !records[0].diis.extrapolated);
        assert!(records.iter().skip(1).all(|r| r.diis.extrapolated));
        assert!(records.iter().all(|r| r.diis.size <= 10));
    }

    #[test]
    fn open_shell_reports_spin_contamination() {
        let system = testing::model_system(&[4, 2], 3, 1).unwrap();
        let options = ScfOptions {
            reference: ReferenceKind::Uhf,
            ..Default::default()
        };
        let output = Harness::new().run(&system, options).unwrap();
        let (s2, exact) = output.spin_contamination.unwrap();
        assert_relative_eq!(exact, 2.0);
        assert!(s2 >= exact - 1e-10);
    }

    #[test]
    fn maxiter_without_convergence() {
        let system = testing::model_system(&[6], 3, 3).unwrap();
        let options = ScfOptions {
            maxiter: 1,
            ..Default::default()
        };
        let error = Harness::new().run(&system, options.clone()).unwrap_err();
        assert!(matches!(error, SolverError::NonConvergence { iterations: 1, .. }));

        let output = Harness::new()
            .run(
                &system,
                ScfOptions {
                    fail_on_maxiter: false,
                    ..options
                },
            )
            .unwrap();
        assert!(!output.converged);
        assert_ne!(output.total_energy, 0.0);
    }

    #[test]
    fn large_gradient_diverges() {
        let system = testing::model_system(&[6], 3, 3).unwrap();
        let options = ScfOptions {
            divergence_threshold: 1e-12,
            ..Default::default()
        };
        let error = Harness::new().run(&system, options).unwrap_err();
        assert!(matches!(error, SolverError::Divergence { .. }));
    }

    #[test]
    fn overwhelming_repulsion_trips_the_default_bound() {
        let mut config = testing::model_config(&[6], 3, 3);
        for (_, value) in &mut config.eri {
            *value *= 1e5;
        }
        let system = IntegralSystem::try_from(config).unwrap();
        let options = ScfOptions::default();
        assert_eq!(options.divergence_threshold, DIVERGENCE_THRESHOLD);

        match Harness::new().run(&system, options) {
            Err(SolverError::Divergence { value, bound, .. }) => {
                assert_eq!(bound, DIVERGENCE_THRESHOLD);
                assert!(value > bound);
            }
            other => panic!("expected divergence, got {other:?}"),
        }
    }

    #[test]
    fn excited_state_holds_back_convergence() {
        let system = testing::core_only(-1.5, 0.5).unwrap();
        let options = ScfOptions {
            mom_start: 3,
            mom_occ: vec![1],
            mom_vir: vec![2],
            ..Default::default()
        };
        let mut harness = Harness::new();
        let output = harness.run(&system, options).unwrap();

        assert_eq!(output.iterations, 4);
        assert_relative_eq!(output.total_energy, 1.0, epsilon = 1e-12);
        let records: Vec<_> = harness.observer.phase(Phase::Scf).collect();
        assert!(!records[1].flags.mom && records[2].flags.mom);
    }

    #[test]
    fn converged_orbitals_are_saved() {
        let system = testing::model_system(&[4, 2], 2, 2).unwrap();
        let mut harness = Harness::new();
        let output = harness.run(&system, ScfOptions::default()).unwrap();

        let stored = OrbitalSet::load(&mut harness.store, system.nsopi()).unwrap().unwrap();
        assert_eq!(stored, output.orbitals);

        let read = harness
            .run(
                &system,
                ScfOptions {
                    guess: GuessType::Read,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(read.guess, GuessType::Read);
        assert!(read.iterations < output.iterations);
        assert_relative_eq!(read.total_energy, output.total_energy, epsilon = 1e-6);
    }
}
