//! Orbitals, cumulant and every intermediate built from them.

use nalgebra::DVector;

use crate::checkpoint::{FileId, OpenMode, Persistence, ScopedFile};
use crate::config::{AoBasis, DcftFunctional, DcftOptions, ReferenceKind, ScfOptions};
use crate::error::{Result, SolverError};
use crate::hf::{Guess, OccupationPolicy, OrbitalSet, OrbitalStep, Orthogonalizer, ScfOutput, SpinChannel};
use crate::integrals::FockBuilder;
use crate::linalg::{BlockedMatrix, Dimension};
use crate::system::IntegralSystem;

use super::cumulant::{CumulantStep, DensityCumulant};
use super::kernel::{CumulantKernel, DenseCumulantKernel, MoFock};
use super::tau::Tau;

const TAU_LABEL: &str = "tau";

/// What a trial step needs to be undone.
#[derive(Clone, Debug)]
pub struct Snapshot {
    orbitals: OrbitalSet,
    lambda: DensityCumulant,
}

/// The coupled orbital and cumulant state.
///
/// The orbital sector is an unrestricted [`OrbitalStep`] whose Fock matrices
/// carry `G(τ)` as an external potential.
pub struct DcftState<'a> {
    functional: DcftFunctional,
    ao_basis: AoBasis,
    nuclear_repulsion: f64,
    nsopi: Dimension,
    core: &'a BlockedMatrix,
    jk: &'a dyn FockBuilder,
    orbital: OrbitalStep<'a>,
    cumulant: CumulantStep,
    kernel: DenseCumulantKernel,
    tau: Tau,
    tau_so: [BlockedMatrix; 2],
    mo_fock: [MoFock; 2],
    policy: OccupationPolicy,
    scf_energy: f64,
    lambda_energy: f64,
}

impl<'a> DcftState<'a> {
    /// Starts from the reference orbitals and the MP2 cumulant.
    pub fn new(
        system: &'a IntegralSystem,
        x: &'a Orthogonalizer,
        jk: &'a dyn FockBuilder,
        reference: &ScfOutput,
        options: &DcftOptions,
        store: &mut dyn Persistence,
    ) -> Result<Self> {
        let guess = Guess {
            orbitals: reference.orbitals.clone(),
            densities: None,
            kind: reference.guess,
        };
        let mut orbital = OrbitalStep::new(ReferenceKind::Uhf, system, x, jk, &guess);
        orbital.build_fock();

        let unrestricted = ScfOptions {
            reference: ReferenceKind::Uhf,
            ..Default::default()
        };
        let mut policy = OccupationPolicy::new(&unrestricted, system.nalpha(), system.nbeta(), &x.nmopi())?;
        if options.lock_occupation {
            policy = policy.locked();
        }

        let orbitals = orbital.orbitals();
        let mo_fock = [
            MoFock::new(&orbital.fock(SpinChannel::Alpha).f, &orbitals.alpha),
            MoFock::new(&orbital.fock(SpinChannel::Beta).f, &orbitals.beta),
        ];
        let kernel = DenseCumulantKernel::new(system.eri(), system.nsopi(), orbitals);
        let mut cumulant = CumulantStep::new(&mo_fock);
        cumulant.mp2_guess(&kernel);

        let occupied = [mo_fock[0].oo.nrows(), mo_fock[1].oo.nrows()];
        let virtuals = [mo_fock[0].vv.nrows(), mo_fock[1].vv.nrows()];
        let nsopi = system.nsopi().clone();
        let mut state = Self {
            functional: options.dcft_functional,
            ao_basis: options.ao_basis,
            nuclear_repulsion: system.nuclear_repulsion(),
            tau_so: [BlockedMatrix::square(&nsopi), BlockedMatrix::square(&nsopi)],
            nsopi,
            core: system.core_hamiltonian(),
            jk,
            orbital,
            cumulant,
            kernel,
            tau: Tau::zeros(occupied, virtuals),
            mo_fock,
            policy,
            scf_energy: reference.total_energy,
            lambda_energy: 0.0,
        };

        state.refresh_tau(store)?;
        state.build_fock();
        let energy = state.compute_energy();
        log::info!(
            "{} guess energy {energy:.12} with {occupied:?} occupied and {virtuals:?} virtual orbitals",
            state.functional
        );
        Ok(state)
    }

    pub fn functional(&self) -> DcftFunctional {
        self.functional
    }

    pub fn orbitals(&self) -> &OrbitalSet {
        self.orbital.orbitals()
    }

    pub fn lambda(&self) -> &DensityCumulant {
        self.cumulant.lambda()
    }

    pub fn tau(&self) -> &Tau {
        &self.tau
    }

    pub fn tau_so(&self) -> &[BlockedMatrix; 2] {
        &self.tau_so
    }

    pub fn mo_fock(&self) -> &[MoFock; 2] {
        &self.mo_fock
    }

    pub fn kernel(&self) -> &DenseCumulantKernel {
        &self.kernel
    }

    pub fn orbital_step(&self) -> &OrbitalStep<'a> {
        &self.orbital
    }

    pub fn cumulant_step(&self) -> &CumulantStep {
        &self.cumulant
    }

    /// Both sectors at once, for joint acceleration.
    pub fn steps_mut(&mut self) -> (&mut OrbitalStep<'a>, &mut CumulantStep) {
        (&mut self.orbital, &mut self.cumulant)
    }

    pub fn scf_energy(&self) -> f64 {
        self.scf_energy
    }

    pub fn lambda_energy(&self) -> f64 {
        self.lambda_energy
    }

    pub fn total_energy(&self) -> f64 {
        self.scf_energy + self.lambda_energy
    }

    /// Tau of the current cumulant and its SO-basis potential.
    pub fn refresh_tau(&mut self, store: &mut dyn Persistence) -> Result<()> {
        self.tau = match self.functional {
            DcftFunctional::Cepa0 => Tau::zeros(
                [self.mo_fock[0].oo.nrows(), self.mo_fock[1].oo.nrows()],
                [self.mo_fock[0].vv.nrows(), self.mo_fock[1].vv.nrows()],
            ),
            DcftFunctional::Dc06 => Tau::approximate(self.cumulant.lambda()),
            DcftFunctional::Dc12 => {
                let mut tau = Tau::approximate(self.cumulant.lambda());
                tau.refine();
                tau
            }
        };
        self.tau_so = self.tau.to_so(self.orbital.orbitals(), &self.nsopi);

        let potential = match self.ao_basis {
            AoBasis::None => self.kernel.tau_potential(&self.tau_so),
            AoBasis::Disk => self.tau_potential_from_disk(store)?,
        };
        self.orbital.set_external(Some(potential));
        Ok(())
    }

    /// Round-trips the SO-basis tau through its file and contracts it with the
    /// Fock builder.
    fn tau_potential_from_disk(&self, store: &mut dyn Persistence) -> Result<[BlockedMatrix; 2]> {
        let mut file = ScopedFile::open(store, FileId::SoTensors, OpenMode::Create)?;
        file.write_json(TAU_LABEL, &self.tau_so)?;
        let tau: Option<[BlockedMatrix; 2]> = file.read_json(TAU_LABEL)?;
        file.close()?;
        let [alpha, beta] = tau.ok_or_else(|| SolverError::Persistence {
            file: FileId::SoTensors.to_string(),
            reason: format!("entry '{TAU_LABEL}' vanished after writing"),
        })?;

        let alpha = self.jk.coulomb_exchange(&alpha);
        let beta = self.jk.coulomb_exchange(&beta);
        let coulomb = alpha.j.add(&beta.j);
        Ok([coulomb.sub(&alpha.k), coulomb.sub(&beta.k)])
    }

    /// `F = H + G(κ) + G(τ)` in the SO and MO bases.
    pub fn build_fock(&mut self) {
        self.orbital.build_fock();
        self.orbital.update_mo_fock();
        self.refresh_mo_fock();
    }

    fn refresh_mo_fock(&mut self) {
        let orbitals = self.orbital.orbitals();
        self.mo_fock = [
            MoFock::new(&self.orbital.fock(SpinChannel::Alpha).f, &orbitals.alpha),
            MoFock::new(&self.orbital.fock(SpinChannel::Beta).f, &orbitals.beta),
        ];
    }

    /// `E = E_nuc + ½ Σσ (H + Fσ)·(κσ + τσ) + E_λ`.
    pub fn compute_energy(&mut self) -> f64 {
        let mut scf = self.nuclear_repulsion;
        for (s, spin) in SpinChannel::BOTH.into_iter().enumerate() {
            let h_plus_f = self.core.add(&self.orbital.fock(spin).f);
            let density = self.orbital.density(spin).add(&self.tau_so[s]);
            scf += 0.5 * h_plus_f.dot(&density);
        }
        self.scf_energy = scf;
        self.lambda_energy = self.kernel.energy(self.cumulant.lambda());
        self.total_energy()
    }

    /// Cumulant residual RMS at the current orbitals and Fock matrices.
    pub fn cumulant_residual(&mut self) -> f64 {
        self.cumulant.compute_residual(&self.kernel, &self.mo_fock)
    }

    pub fn update_cumulant(&mut self) {
        self.cumulant.update();
    }

    /// Orbital gradient RMS of the current Fock matrices.
    pub fn orbital_residual(&mut self) -> f64 {
        self.orbital.compute_error()
    }

    /// Diagonalizes the Fock matrices and forms the new densities, returns the
    /// RMS density change.
    pub fn update_orbitals(&mut self, iteration: usize) -> Result<f64> {
        self.orbital.diagonalize();
        if !self.orbital.align_phases() {
            log::warn!("new orbitals could not be matched to the previous ones");
        }
        self.orbital.occupy(iteration, &self.policy)?;
        let (change, _) = self.orbital.form_density();
        Ok(change)
    }

    /// Replaces the orbitals, rebuilding the densities.
    pub fn set_orbitals(&mut self, orbitals: &OrbitalSet) {
        self.orbital.set_orbitals(orbitals);
    }

    pub fn set_lambda(&mut self, lambda: &DensityCumulant) {
        self.cumulant.lambda_mut().copy_from(lambda);
    }

    /// Integrals and denominators for the current orbitals.
    pub fn refresh_integrals(&mut self) {
        self.kernel.transform_integrals(self.orbital.orbitals());
        self.orbital.update_mo_fock();
        self.refresh_mo_fock();
        self.cumulant.set_denominators(&self.mo_fock);
    }

    /// Every intermediate of the current orbitals and cumulant, ending with
    /// both residuals and the energy.
    pub fn evaluate(&mut self, store: &mut dyn Persistence) -> Result<()> {
        self.kernel.transform_integrals(self.orbital.orbitals());
        self.refresh_tau(store)?;
        self.build_fock();
        self.cumulant.set_denominators(&self.mo_fock);
        self.orbital_residual();
        self.cumulant_residual();
        self.compute_energy();
        Ok(())
    }

    /// The occupied-virtual MO Fock elements per spin and irrep followed by the
    /// independent cumulant residuals.
    pub fn residual_vector(&self) -> DVector<f64> {
        let mut values = Vec::new();
        for spin in SpinChannel::BOTH {
            let orbitals = self.orbital.orbitals().spin(spin);
            let mo = self.orbital.mo_fock(spin);
            let nmopi = orbitals.nmopi();
            for (h, &nocc) in orbitals.noccpi().iter().enumerate() {
                for (i, a) in itertools::iproduct!(0..nocc, nocc..nmopi[h]) {
                    values.push(mo.block(h)[(i, a)]);
                }
            }
        }
        let residual = self.cumulant.residual();
        for (case, index) in residual.unique_indices() {
            values.push(residual.get(case, index));
        }
        DVector::from_vec(values)
    }

    /// Persists the cumulant and the orbitals, writing the cumulant file through.
    pub fn save(&self, file: &mut ScopedFile<'_>) -> Result<()> {
        self.cumulant.lambda().save(file)?;
        file.flush()?;
        self.orbital.orbitals().save(file.store_mut())
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            orbitals: self.orbital.orbitals().clone(),
            lambda: self.cumulant.lambda().clone(),
        }
    }

    /// Puts back orbitals and cumulant. Intermediates are stale until the next
    /// [`Self::evaluate`].
    pub fn restore(&mut self, snapshot: &Snapshot) {
        self.set_orbitals(&snapshot.orbitals);
        self.set_lambda(&snapshot.lambda);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::checkpoint::{DirectoryStore, MemoryStore};
    use crate::globals::Globals;
    use crate::hf::{ScfDriver, SolverContext};
    use crate::report::RecordingObserver;
    use crate::testing;

    /// A small open-shell system with its converged UHF reference.
    pub(crate) fn reference() -> (IntegralSystem, ScfOutput) {
        let system = testing::model_system(&[4, 2], 2, 1).unwrap();
        let options = DcftOptions::default();
        let output = {
            let driver = ScfDriver::new(&system, options.reference.clone()).unwrap();
            let (mut store, mut observer, mut globals) = (MemoryStore::new(), RecordingObserver::new(), Globals::new());
            let mut ctx = SolverContext {
                store: &mut store,
                observer: &mut observer,
                globals: &mut globals,
            };
            driver.run(&mut ctx).unwrap()
        };
        (system, output)
    }

    fn with_state<T>(options: DcftOptions, body: impl FnOnce(&mut DcftState, &mut MemoryStore) -> T) -> T {
        let (system, output) = reference();
        let driver = ScfDriver::new(&system, options.reference.clone()).unwrap();
        let mut store = MemoryStore::new();
        let mut state = DcftState::new(
            &system,
            driver.orthogonalizer(),
            driver.fock_builder(),
            &output,
            &options,
            &mut store,
        )
        .unwrap();
        body(&mut state, &mut store)
    }

    #[test]
    fn disk_and_in_core_tau_potentials_agree() {
        let energy = |ao_basis| {
            let options = DcftOptions {
                ao_basis,
                ..Default::default()
            };
            with_state(options, |state, store| {
                assert!(!store.is_open(FileId::SoTensors));
                state.compute_energy()
            })
        };
        assert_relative_eq!(energy(AoBasis::None), energy(AoBasis::Disk), epsilon = 1e-12);
    }

    #[test]
    fn zero_cumulant_recovers_the_reference() {
        let (_, output) = reference();
        with_state(DcftOptions::default(), |state, store| {
            assert!(state.lambda().rms() > 0.0);
            let [oa, ob] = [state.mo_fock()[0].oo.nrows(), state.mo_fock()[1].oo.nrows()];
            let [va, vb] = [state.mo_fock()[0].vv.nrows(), state.mo_fock()[1].vv.nrows()];
            state.set_lambda(&DensityCumulant::zeros([oa, ob], [va, vb]));
            state.evaluate(store).unwrap();
            assert_eq!(state.lambda_energy(), 0.0);
            assert_relative_eq!(state.scf_energy(), output.total_energy, epsilon = 1e-8);
        });
    }

    #[test]
    fn cepa0_has_no_tau() {
        let options = DcftOptions {
            dcft_functional: DcftFunctional::Cepa0,
            ..Default::default()
        };
        let (_, output) = reference();
        with_state(options, |state, _| {
            assert_eq!(state.tau_so()[0].max_abs(), 0.0);
            // the reference energy is untouched without tau
            assert_relative_eq!(state.scf_energy(), output.total_energy, epsilon = 1e-8);
        });
    }

    #[test]
    fn snapshot_restores_the_residuals() {
        with_state(DcftOptions::default(), |state, store| {
            state.evaluate(store).unwrap();
            let before = state.residual_vector();
            let snapshot = state.snapshot();

            state.update_cumulant();
            state.evaluate(store).unwrap();
            assert!((state.residual_vector() - &before).norm() > 0.0);

            state.restore(&snapshot);
            state.evaluate(store).unwrap();
            assert_relative_eq!(state.residual_vector(), before, epsilon = 1e-12);
        });
    }

    #[test]
    fn residual_vector_covers_rotations_and_amplitudes() {
        with_state(DcftOptions::default(), |state, _| {
            let orbitals = state.orbitals();
            let rotations: usize = [&orbitals.alpha, &orbitals.beta]
                .iter()
                .map(|o| o.noccpi().iter().zip(o.nvirpi().iter()).map(|(i, a)| i * a).sum::<usize>())
                .sum();
            assert_eq!(
                state.residual_vector().len(),
                rotations + state.lambda().unique_len()
            );
        });
    }

    #[test]
    fn saved_cumulant_reaches_disk_before_close() {
        let root = std::env::temp_dir().join(format!("scf-core-dcft-save-{}", std::process::id()));
        let (system, output) = reference();
        let options = DcftOptions::default();
        let driver = ScfDriver::new(&system, options.reference.clone()).unwrap();
        let mut store = DirectoryStore::new(&root).unwrap();
        let state = DcftState::new(
            &system,
            driver.orthogonalizer(),
            driver.fock_builder(),
            &output,
            &options,
            &mut store,
        )
        .unwrap();

        let mut file = ScopedFile::open(&mut store, FileId::Cumulant, OpenMode::Create).unwrap();
        state.save(&mut file).unwrap();
        assert!(file.store_mut().is_open(FileId::Cumulant));

        let mut reader = DirectoryStore::new(&root).unwrap();
        let mut on_disk = ScopedFile::open(&mut reader, FileId::Cumulant, OpenMode::Existing).unwrap();
        assert_eq!(DensityCumulant::load(&mut on_disk).unwrap().as_ref(), Some(state.lambda()));
        drop(on_disk);
        file.close().unwrap();
        std::fs::remove_dir_all(root).unwrap();
    }
}
