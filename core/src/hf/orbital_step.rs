use crate::config::ReferenceKind;
use crate::diis::{SlotMut, SlotRef};
use crate::error::Result;
use crate::integrals::FockBuilder;
use crate::linalg::{BlockedMatrix, Dimension};
use crate::report::StepFlags;
use crate::step::FixedPointStep;
use crate::system::IntegralSystem;

use super::guess::Guess;
use super::occupation::OccupationPolicy;
use super::orbitals::{OrbitalSet, SpinChannel};
use super::orthogonalize::Orthogonalizer;

fn index(spin: SpinChannel) -> usize {
    match spin {
        SpinChannel::Alpha => 0,
        SpinChannel::Beta => 1,
    }
}

/// Fock matrices of one spin.
#[derive(Clone, Debug, PartialEq)]
pub struct FockState {
    /// Core Hamiltonian plus two-electron part.
    pub f0: BlockedMatrix,
    /// `f0` plus the external potential, the matrix that gets diagonalized.
    pub f: BlockedMatrix,
    /// `f` in the MO basis.
    pub mo: BlockedMatrix,
}

impl FockState {
    fn zeros(nsopi: &[usize], nmopi: &[usize]) -> Self {
        Self {
            f0: BlockedMatrix::square(nsopi),
            f: BlockedMatrix::square(nsopi),
            mo: BlockedMatrix::square(nmopi),
        }
    }
}

/// The orbital sector of an SCF: Fock build, energy, orbital gradient,
/// diagonalization, occupation and density.
pub struct OrbitalStep<'a> {
    reference: ReferenceKind,
    nuclear_repulsion: f64,
    core: &'a BlockedMatrix,
    overlap: &'a BlockedMatrix,
    x: &'a Orthogonalizer,
    jk: &'a dyn FockBuilder,
    orbitals: OrbitalSet,
    previous: OrbitalSet,
    density: [BlockedMatrix; 2],
    fock: [FockState; 2],
    /// ROHF effective Fock matrix in the orthogonal basis.
    effective: BlockedMatrix,
    /// `X^T (F D S - S D F) X` per spin, or the ROHF gradient in slot 0.
    error: [BlockedMatrix; 2],
    external: Option<[BlockedMatrix; 2]>,
    damping: Option<f64>,
    damping_convergence: f64,
    residual: f64,
    one_electron: f64,
    two_electron: f64,
    external_energy: f64,
}

impl<'a> OrbitalStep<'a> {
    pub fn new(
        reference: ReferenceKind,
        system: &'a IntegralSystem,
        x: &'a Orthogonalizer,
        jk: &'a dyn FockBuilder,
        guess: &Guess,
    ) -> Self {
        let nsopi = system.nsopi().clone();
        let nmopi = x.nmopi();
        let (da, db) = guess.densities();
        let db = if reference == ReferenceKind::Rhf {
            da.clone()
        } else {
            db
        };

        Self {
            reference,
            nuclear_repulsion: system.nuclear_repulsion(),
            core: system.core_hamiltonian(),
            overlap: system.overlap(),
            x,
            jk,
            orbitals: guess.orbitals.clone(),
            previous: guess.orbitals.clone(),
            density: [da, db],
            fock: [FockState::zeros(&nsopi, &nmopi), FockState::zeros(&nsopi, &nmopi)],
            effective: BlockedMatrix::square(&nmopi),
            error: [BlockedMatrix::square(&nmopi), BlockedMatrix::square(&nmopi)],
            external: None,
            damping: None,
            damping_convergence: 0.0,
            residual: f64::INFINITY,
            one_electron: 0.0,
            two_electron: 0.0,
            external_energy: 0.0,
        }
    }

    /// Mixes `percentage` of the previous density into every new one until the
    /// density change drops below `convergence`.
    pub fn with_damping(mut self, percentage: Option<f64>, convergence: f64) -> Self {
        self.damping = percentage.filter(|&p| p > 0.0).map(|p| p / 100.0);
        self.damping_convergence = convergence;
        self
    }

    pub fn reference(&self) -> ReferenceKind {
        self.reference
    }

    pub fn orbitals(&self) -> &OrbitalSet {
        &self.orbitals
    }

    pub fn orbitals_mut(&mut self) -> &mut OrbitalSet {
        &mut self.orbitals
    }

    pub fn density(&self, spin: SpinChannel) -> &BlockedMatrix {
        &self.density[index(spin)]
    }

    pub fn fock(&self, spin: SpinChannel) -> &FockState {
        &self.fock[index(spin)]
    }

    pub fn jk(&self) -> &dyn FockBuilder {
        self.jk
    }

    pub fn overlap(&self) -> &BlockedMatrix {
        self.overlap
    }

    pub fn core_hamiltonian(&self) -> &BlockedMatrix {
        self.core
    }

    pub fn nmopi(&self) -> Dimension {
        self.x.nmopi()
    }

    /// Per-spin potential added to `f0`, such as the DCFT tau contribution.
    pub fn set_external(&mut self, potential: Option<[BlockedMatrix; 2]>) {
        self.external = potential;
    }

    pub fn one_electron_energy(&self) -> f64 {
        self.one_electron
    }

    pub fn two_electron_energy(&self) -> f64 {
        self.two_electron
    }

    /// Energy of the densities the current Fock matrices were built from.
    pub fn energy(&self) -> f64 {
        self.nuclear_repulsion + self.one_electron + self.two_electron + self.external_energy
    }

    /// `F = H + J[Da + Db] - K[Ds] (+ V)` from the current densities.
    pub fn build_fock(&mut self) {
        let alpha = self.jk.coulomb_exchange(&self.density[0]);
        let (coulomb, exchange_beta) = match self.reference {
            ReferenceKind::Rhf => {
                let mut j = alpha.j.clone();
                j.scale_mut(2.0);
                (j, alpha.k.clone())
            }
            ReferenceKind::Uhf | ReferenceKind::Rohf => {
                let beta = self.jk.coulomb_exchange(&self.density[1]);
                (alpha.j.add(&beta.j), beta.k)
            }
        };

        let mut one_electron = 0.0;
        let mut two_electron = 0.0;
        let mut external_energy = 0.0;
        for (s, exchange) in [(0, &alpha.k), (1, &exchange_beta)] {
            let state = &mut self.fock[s];
            state.f0.copy_from(self.core);
            state.f0.axpy(1.0, &coulomb);
            state.f0.axpy(-1.0, exchange);
            state.f.copy_from(&state.f0);
            if let Some(potential) = &self.external {
                state.f.axpy(1.0, &potential[s]);
                external_energy += self.density[s].dot(&potential[s]);
            }

            one_electron += self.density[s].dot(self.core);
            two_electron += 0.5 * (self.density[s].dot(&state.f0) - self.density[s].dot(self.core));
        }
        self.one_electron = one_electron;
        self.two_electron = two_electron;
        self.external_energy = external_energy;
    }

    /// Orbital gradient of the current Fock matrices, returns its RMS.
    pub fn compute_error(&mut self) -> f64 {
        self.residual = match self.reference {
            ReferenceKind::Rhf => {
                self.error[0] = self.commutator(0);
                self.error[0].rms()
            }
            ReferenceKind::Uhf => {
                self.error[0] = self.commutator(0);
                self.error[1] = self.commutator(1);
                (0.5 * (self.error[0].rms().powi(2) + self.error[1].rms().powi(2))).sqrt()
            }
            ReferenceKind::Rohf => {
                self.build_effective_fock();
                self.error[0].rms()
            }
        };
        self.residual
    }

    fn commutator(&self, s: usize) -> BlockedMatrix {
        let fds = self.fock[s].f.mul(&self.density[s]).mul(self.overlap);
        fds.sub(&fds.transpose()).transform(self.x.matrix())
    }

    /// Semicanonical ROHF Fock matrix: the average Fock operator with the
    /// docc-socc coupling from beta and the socc-virtual coupling from alpha.
    fn build_effective_fock(&mut self) {
        let c = self.orbitals.alpha.coefficients();
        let fa = self.fock[0].f.transform(c);
        let fb = self.fock[1].f.transform(c);
        let mut effective = fa.add(&fb);
        effective.scale_mut(0.5);
        let mut gradient = BlockedMatrix::square(&effective.rowspi());

        let class = |h: usize, p: usize| {
            let docc = self.orbitals.beta.noccpi()[h];
            let occ = self.orbitals.alpha.noccpi()[h];
            if p < docc {
                0
            } else if p < occ {
                1
            } else {
                2
            }
        };

        for h in 0..effective.nirrep() {
            let n = effective.block(h).nrows();
            for (p, q) in itertools::iproduct!(0..n, 0..n) {
                match (class(h, p), class(h, q)) {
                    (0, 1) | (1, 0) => effective.block_mut(h)[(p, q)] = fb.block(h)[(p, q)],
                    (1, 2) | (2, 1) => effective.block_mut(h)[(p, q)] = fa.block(h)[(p, q)],
                    _ => {}
                }
            }
            for (p, q) in itertools::iproduct!(0..n, 0..n) {
                if class(h, p) < class(h, q) {
                    let value = effective.block(h)[(p, q)];
                    gradient.block_mut(h)[(p, q)] = value;
                    gradient.block_mut(h)[(q, p)] = -value;
                }
            }
        }

        // MO -> orthogonal basis
        let to_orthogonal = self.x.matrix().transpose().mul(self.overlap).mul(c);
        self.effective = effective.back_transform(&to_orthogonal);
        self.error[0] = gradient.back_transform(&to_orthogonal);
    }

    /// New orbitals from the (possibly extrapolated) Fock matrices. The
    /// occupation is left to [`Self::occupy`].
    pub fn diagonalize(&mut self) {
        self.previous.copy_from(&self.orbitals);
        match self.reference {
            ReferenceKind::Rhf => {
                let alpha = self.x.diagonalize(&self.fock[0].f);
                self.orbitals.alpha.set_orbitals(alpha.coefficients, alpha.energies);
                let alpha = self.orbitals.alpha.clone();
                self.orbitals.beta.copy_from(&alpha);
            }
            ReferenceKind::Uhf => {
                for (s, spin) in SpinChannel::BOTH.into_iter().enumerate() {
                    let new = self.x.diagonalize(&self.fock[s].f);
                    self.orbitals
                        .spin_mut(spin)
                        .set_orbitals(new.coefficients, new.energies);
                }
            }
            ReferenceKind::Rohf => {
                let (vectors, energies) = self.effective.symmetric_eigen();
                let coefficients = self.x.matrix().mul(&vectors);
                self.orbitals
                    .alpha
                    .set_orbitals(coefficients.clone(), energies.clone());
                self.orbitals.beta.set_orbitals(coefficients, energies);
            }
        }
    }

    pub fn occupy(&mut self, iteration: usize, policy: &OccupationPolicy) -> Result<StepFlags> {
        policy.apply(iteration, &mut self.orbitals, &self.previous, self.overlap)
    }

    /// Flips new orbitals to follow the previous ones, false if they cannot be matched.
    pub fn align_phases(&mut self) -> bool {
        let alpha = self.orbitals.alpha.align_phases_to(&self.previous.alpha, self.overlap);
        let beta = self.orbitals.beta.align_phases_to(&self.previous.beta, self.overlap);
        alpha && beta
    }

    pub fn canonical_phases(&mut self) {
        self.orbitals.alpha.canonical_phases();
        self.orbitals.beta.canonical_phases();
    }

    /// Densities of the current orbitals, damped while the change is large.
    ///
    /// Returns the RMS change before damping and whether damping applied.
    pub fn form_density(&mut self) -> (f64, bool) {
        let (da, db) = self.orbitals.densities();
        let change = (0.5 * (da.sub(&self.density[0]).rms().powi(2) + db.sub(&self.density[1]).rms().powi(2))).sqrt();

        let damped = match self.damping {
            Some(fraction) if change > self.damping_convergence => {
                for (old, new) in self.density.iter_mut().zip([da, db]) {
                    old.scale_mut(fraction);
                    old.axpy(1.0 - fraction, &new);
                }
                true
            }
            _ => {
                self.density = [da, db];
                false
            }
        };
        (change, damped)
    }

    /// Replaces the orbitals and rebuilds the densities from them.
    pub fn set_orbitals(&mut self, orbitals: &OrbitalSet) {
        self.previous.copy_from(&self.orbitals);
        self.orbitals.copy_from(orbitals);
        let (da, db) = self.orbitals.densities();
        self.density = [da, db];
    }

    /// Recomputes the MO-basis Fock matrices with the current orbitals.
    pub fn update_mo_fock(&mut self) {
        for (s, spin) in SpinChannel::BOTH.into_iter().enumerate() {
            let c = self.orbitals.spin(spin).coefficients();
            self.fock[s].mo = self.fock[s].f.transform(c);
        }
    }

    pub fn mo_fock(&self, spin: SpinChannel) -> &BlockedMatrix {
        &self.fock[index(spin)].mo
    }
}

impl FixedPointStep for OrbitalStep<'_> {
    fn error_slots(&self) -> Vec<SlotRef<'_>> {
        match self.reference {
            ReferenceKind::Rhf | ReferenceKind::Rohf => vec![SlotRef::Matrix(&self.error[0])],
            ReferenceKind::Uhf => vec![SlotRef::Matrix(&self.error[0]), SlotRef::Matrix(&self.error[1])],
        }
    }

    fn solution_slots(&self) -> Vec<SlotRef<'_>> {
        match self.reference {
            ReferenceKind::Rhf => vec![SlotRef::Matrix(&self.fock[0].f)],
            ReferenceKind::Uhf => vec![SlotRef::Matrix(&self.fock[0].f), SlotRef::Matrix(&self.fock[1].f)],
            ReferenceKind::Rohf => vec![SlotRef::Matrix(&self.effective)],
        }
    }

    fn solution_slots_mut(&mut self) -> Vec<SlotMut<'_>> {
        let [alpha, beta] = &mut self.fock;
        match self.reference {
            ReferenceKind::Rhf => vec![SlotMut::Matrix(&mut alpha.f)],
            ReferenceKind::Uhf => vec![SlotMut::Matrix(&mut alpha.f), SlotMut::Matrix(&mut beta.f)],
            ReferenceKind::Rohf => vec![SlotMut::Matrix(&mut self.effective)],
        }
    }

    fn residual_norm(&self) -> f64 {
        self.residual
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::checkpoint::MemoryStore;
    use crate::config::{GuessType, JkAlgorithm, Orthogonalization, ScfOptions};
    use crate::hf::guess::compute_guess;
    use crate::integrals::build_jk;
    use crate::testing;

    fn with_step<T>(
        reference: ReferenceKind,
        nalpha: usize,
        nbeta: usize,
        body: impl FnOnce(&mut OrbitalStep, &OccupationPolicy) -> T,
    ) -> T {
        let system = testing::model_system(&[4, 2], nalpha, nbeta).unwrap();
        let x = Orthogonalizer::new(system.overlap(), Orthogonalization::Symmetric, 1e-7).unwrap();
        let options = ScfOptions {
            reference,
            ..Default::default()
        };
        let policy = OccupationPolicy::new(&options, nalpha, nbeta, &x.nmopi()).unwrap();
        let jk = build_jk(JkAlgorithm::Pk, system.eri(), system.nsopi()).unwrap();
        let guess = compute_guess(GuessType::Core, &system, &x, &policy, &mut MemoryStore::new(), 1e-7).unwrap();
        let mut step = OrbitalStep::new(reference, &system, &x, jk.as_ref(), &guess);
        body(&mut step, &policy)
    }

    #[test]
    fn uhf_of_closed_shell_matches_rhf() {
        let iterate = |step: &mut OrbitalStep, policy: &OccupationPolicy| {
            for iteration in 1..=40 {
                step.build_fock();
                step.compute_error();
                step.diagonalize();
                step.occupy(iteration, policy).unwrap();
                step.form_density();
            }
            step.build_fock();
            step.energy()
        };

        let rhf = with_step(ReferenceKind::Rhf, 2, 2, iterate);
        let uhf = with_step(ReferenceKind::Uhf, 2, 2, iterate);
        assert_relative_eq!(rhf, uhf, epsilon = 1e-8);
    }

    #[test]
    fn gradient_vanishes_for_core_eigenvectors_without_repulsion() {
        let system = testing::core_only(-1.0, 0.3).unwrap();
        let x = Orthogonalizer::new(system.overlap(), Orthogonalization::Symmetric, 1e-7).unwrap();
        let policy = OccupationPolicy::new(&ScfOptions::default(), 1, 1, &x.nmopi()).unwrap();
        let jk = build_jk(JkAlgorithm::Direct, system.eri(), system.nsopi()).unwrap();
        let guess = compute_guess(GuessType::Core, &system, &x, &policy, &mut MemoryStore::new(), 1e-7).unwrap();
        let mut step = OrbitalStep::new(ReferenceKind::Rhf, &system, &x, jk.as_ref(), &guess);

        step.build_fock();
        assert_eq!(step.compute_error(), 0.0);
        assert_relative_eq!(step.energy(), -2.0);
        assert_relative_eq!(step.one_electron_energy(), -2.0);
        assert_eq!(step.two_electron_energy(), 0.0);
    }

    #[test]
    fn rohf_shares_orthonormal_orbitals() {
        with_step(ReferenceKind::Rohf, 3, 1, |step, policy| {
            step.build_fock();
            step.compute_error();
            let e = &step.error[0];
            assert_relative_eq!(e.block(0), &(-e.block(0).transpose()), epsilon = 1e-12);

            step.diagonalize();
            step.occupy(1, policy).unwrap();
            step.form_density();
            let orbitals = step.orbitals();
            assert_eq!(orbitals.alpha.coefficients(), orbitals.beta.coefficients());
            assert_eq!(orbitals.soccpi().iter().sum::<usize>(), 2);

            let unit = step.overlap().transform(orbitals.alpha.coefficients());
            for h in 0..unit.nirrep() {
                let n = unit.block(h).nrows();
                assert_relative_eq!(unit.block(h), &nalgebra::DMatrix::identity(n, n), epsilon = 1e-10);
            }
        });
    }

    #[test]
    fn damping_mixes_in_previous_density() {
        let system = testing::model_system(&[4, 2], 2, 2).unwrap();
        let x = Orthogonalizer::new(system.overlap(), Orthogonalization::Symmetric, 1e-7).unwrap();
        let policy = OccupationPolicy::new(&ScfOptions::default(), 2, 2, &x.nmopi()).unwrap();
        let jk = build_jk(JkAlgorithm::Pk, system.eri(), system.nsopi()).unwrap();
        let guess = compute_guess(GuessType::Core, &system, &x, &policy, &mut MemoryStore::new(), 1e-7).unwrap();
        let mut step = OrbitalStep::new(ReferenceKind::Rhf, &system, &x, jk.as_ref(), &guess).with_damping(Some(25.0), 1e-8);

        let old = step.density(SpinChannel::Alpha).clone();
        step.build_fock();
        step.compute_error();
        step.diagonalize();
        step.occupy(1, &policy).unwrap();
        let (change, damped) = step.form_density();
        assert!(damped && change > 1e-8);

        let (new, _) = step.orbitals().densities();
        let mut expected = old;
        expected.scale_mut(0.25);
        expected.axpy(0.75, &new);
        assert_relative_eq!(step.density(SpinChannel::Alpha).block(0), expected.block(0), epsilon = 1e-12);
        // mixing keeps the electron count
        assert_relative_eq!(step.density(SpinChannel::Alpha).dot(system.overlap()), 2.0, epsilon = 1e-10);
    }
}
