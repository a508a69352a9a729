//! Cumulant residual and energy from the MO-basis integrals.

use nalgebra::DMatrix;

use crate::hf::{OrbitalSet, SpinOrbitals};
use crate::integrals::{dense_so, ElectronTensor, MoIntegrals, OrbitalSpaces, SpinCases};
use crate::linalg::{BlockedMatrix, Dimension, Tensor4};

use super::cumulant::{as_matrix, from_matrix, Case, DensityCumulant};

/// Occupied-occupied and virtual-virtual blocks of the MO Fock matrix of one
/// spin, dense over all irreps in the order of the cumulant indices.
#[derive(Clone, Debug, PartialEq)]
pub struct MoFock {
    pub oo: DMatrix<f64>,
    pub vv: DMatrix<f64>,
}

impl MoFock {
    pub fn new(fock: &BlockedMatrix, orbitals: &SpinOrbitals) -> Self {
        let f = fock.to_dense();
        let occupied = orbitals.occupied_dense();
        let virtuals = orbitals.virtual_dense();
        Self {
            oo: occupied.transpose() * &f * &occupied,
            vv: virtuals.transpose() * &f * &virtuals,
        }
    }
}

fn spaces(orbitals: &SpinOrbitals) -> OrbitalSpaces {
    OrbitalSpaces {
        occupied: orbitals.occupied_dense(),
        virtuals: orbitals.virtual_dense(),
    }
}

/// Integral-dependent pieces of the cumulant equations.
pub trait CumulantKernel {
    /// Re-transforms the integrals into the current occupied and virtual spaces.
    fn transform_integrals(&mut self, orbitals: &OrbitalSet);

    fn integrals(&self) -> &MoIntegrals;

    /// `G(τ)_σ = J[τα + τβ] - K[τσ]` in the SO basis.
    fn tau_potential(&self, tau: &[BlockedMatrix; 2]) -> [BlockedMatrix; 2];

    /// `½ <ab||cd> λ_ijcd + ½ <kl||ij> λ_klab`, without the halves for the
    /// mixed-spin block.
    fn ladder(&self, lambda: &DensityCumulant) -> SpinCases<Tensor4> {
        let mo = self.integrals();
        let term = |case: Case| {
            let l = as_matrix(case.select(&lambda.blocks));
            let vvvv = as_matrix(case.select(&mo.vvvv));
            let oooo = as_matrix(case.select(&mo.oooo));
            let factor = if case == Case::Ab { 1.0 } else { 0.5 };
            let product = (&l * vvvv.transpose() + oooo.transpose() * &l) * factor;
            from_matrix(case.select(&lambda.blocks).dims(), &product)
        };
        SpinCases {
            aa: term(Case::Aa),
            ab: term(Case::Ab),
            bb: term(Case::Bb),
        }
    }

    /// Writes `R = g + P(ab) f_vv λ - P(ij) f_oo λ + ladder` into `out` and
    /// returns its RMS.
    fn residual(&self, lambda: &DensityCumulant, fock: &[MoFock; 2], out: &mut DensityCumulant) -> f64 {
        let ladder = self.ladder(lambda);
        for case in Case::ALL {
            let (s1, s2) = case.spins();
            let (f1, f2) = (&fock[s1], &fock[s2]);
            let l = case.select(&lambda.blocks);
            let g = case.select(&self.integrals().oovv);
            let extra = case.select(&ladder);
            let r = case.select_mut(&mut out.blocks);

            let [no1, no2, nv1, nv2] = l.dims();
            for (i, j, a, b) in itertools::iproduct!(0..no1, 0..no2, 0..nv1, 0..nv2) {
                let mut value = g[(i, j, a, b)] + extra[(i, j, a, b)];
                for c in 0..nv1 {
                    value += f1.vv[(a, c)] * l[(i, j, c, b)];
                }
                for c in 0..nv2 {
                    value += f2.vv[(b, c)] * l[(i, j, a, c)];
                }
                for k in 0..no1 {
                    value -= f1.oo[(k, i)] * l[(k, j, a, b)];
                }
                for k in 0..no2 {
                    value -= f2.oo[(k, j)] * l[(i, k, a, b)];
                }
                r[(i, j, a, b)] = value;
            }
        }
        out.rms()
    }

    /// `¼ λ·(g + G)` for the same-spin blocks and `λ·(g + G)` for the mixed
    /// one, with `G = g + ladder`. Its derivative with respect to an
    /// independent amplitude is twice the residual without the Fock terms.
    fn energy(&self, lambda: &DensityCumulant) -> f64 {
        let ladder = self.ladder(lambda);
        let g = &self.integrals().oovv;
        Case::ALL
            .into_iter()
            .map(|case| {
                let l = case.select(&lambda.blocks);
                let value = 2.0 * l.dot(case.select(g)) + l.dot(case.select(&ladder));
                match case {
                    Case::Ab => value,
                    Case::Aa | Case::Bb => 0.25 * value,
                }
            })
            .sum()
    }
}

/// Kernel over the in-core SO integrals.
#[derive(Clone, Debug)]
pub struct DenseCumulantKernel {
    so: Tensor4,
    nsopi: Dimension,
    integrals: MoIntegrals,
}

impl DenseCumulantKernel {
    pub fn new(eri: &ElectronTensor, nsopi: &[usize], orbitals: &OrbitalSet) -> Self {
        let so = dense_so(eri);
        let integrals = MoIntegrals::new(&so, &spaces(&orbitals.alpha), &spaces(&orbitals.beta));
        Self {
            so,
            nsopi: nsopi.iter().copied().collect(),
            integrals,
        }
    }
}

impl CumulantKernel for DenseCumulantKernel {
    fn transform_integrals(&mut self, orbitals: &OrbitalSet) {
        log::debug!("transforming integrals to the new orbitals");
        self.integrals = MoIntegrals::new(&self.so, &spaces(&orbitals.alpha), &spaces(&orbitals.beta));
    }

    fn integrals(&self) -> &MoIntegrals {
        &self.integrals
    }

    fn tau_potential(&self, tau: &[BlockedMatrix; 2]) -> [BlockedMatrix; 2] {
        let spins = [tau[0].to_dense(), tau[1].to_dense()];
        let total = &spins[0] + &spins[1];
        let n = total.nrows();

        let coulomb = DMatrix::from_fn(n, n, |p, q| {
            itertools::iproduct!(0..n, 0..n)
                .map(|(r, s)| self.so[(p, q, r, s)] * total[(r, s)])
                .sum::<f64>()
        });
        spins.map(|t| {
            let exchange = DMatrix::from_fn(n, n, |p, q| {
                itertools::iproduct!(0..n, 0..n)
                    .map(|(r, s)| self.so[(p, r, q, s)] * t[(r, s)])
                    .sum::<f64>()
            });
            BlockedMatrix::from_dense(&(&coulomb - exchange), &self.nsopi, &self.nsopi)
        })
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::config::{JkAlgorithm, Orthogonalization, ReferenceKind, ScfOptions};
    use crate::hf::{OccupationPolicy, Orthogonalizer};
    use crate::integrals::build_jk;
    use crate::testing;

    fn orbitals(system: &crate::system::IntegralSystem) -> OrbitalSet {
        let x = Orthogonalizer::new(system.overlap(), Orthogonalization::Symmetric, 1e-7).unwrap();
        let options = ScfOptions {
            reference: ReferenceKind::Uhf,
            ..Default::default()
        };
        let policy = OccupationPolicy::new(&options, system.nalpha(), system.nbeta(), &x.nmopi()).unwrap();
        let alpha = x.diagonalize(system.core_hamiltonian());
        let mut orbitals = OrbitalSet {
            beta: alpha.clone(),
            alpha,
        };
        policy.initial(&mut orbitals);
        orbitals
    }

    fn random_cumulant(kernel: &DenseCumulantKernel, seed: u64) -> DensityCumulant {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(seed);
        let oovv = &kernel.integrals().oovv;
        let [oa, _, va, _] = oovv.aa.dims();
        let [ob, _, vb, _] = oovv.bb.dims();
        let mut lambda = DensityCumulant::zeros([oa, ob], [va, vb]);
        for (case, index) in lambda.unique_indices() {
            lambda.set(case, index, rng.gen_range(-0.05..0.05));
        }
        lambda
    }

    #[test]
    fn tau_potential_matches_fock_builder() {
        let system = testing::model_system(&[4, 2], 3, 2).unwrap();
        let orbitals = orbitals(&system);
        let kernel = DenseCumulantKernel::new(system.eri(), system.nsopi(), &orbitals);
        let jk = build_jk(JkAlgorithm::Direct, system.eri(), system.nsopi()).unwrap();

        let (da, db) = orbitals.densities();
        let [ga, gb] = kernel.tau_potential(&[da.clone(), db.clone()]);
        let (ja, jb) = (jk.coulomb_exchange(&da), jk.coulomb_exchange(&db));
        let j = ja.j.add(&jb.j);
        for (g, k) in [(ga, ja.k), (gb, jb.k)] {
            let expected = j.sub(&k);
            for h in 0..2 {
                assert_relative_eq!(g.block(h), expected.block(h), epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn residual_keeps_antisymmetry() {
        let system = testing::model_system(&[5], 3, 3).unwrap();
        let orbitals = orbitals(&system);
        let kernel = DenseCumulantKernel::new(system.eri(), system.nsopi(), &orbitals);
        let fock = [
            MoFock::new(system.core_hamiltonian(), &orbitals.alpha),
            MoFock::new(system.core_hamiltonian(), &orbitals.beta),
        ];
        let lambda = random_cumulant(&kernel, 7);
        let mut out = lambda.clone();
        kernel.residual(&lambda, &fock, &mut out);

        let r = &out.blocks.aa;
        assert_relative_eq!(r[(0, 1, 0, 1)], -r[(1, 0, 0, 1)], epsilon = 1e-12);
        assert_relative_eq!(r[(0, 2, 1, 0)], -r[(0, 2, 0, 1)], epsilon = 1e-12);
        assert_relative_eq!(r[(1, 1, 0, 1)], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn ladder_matches_explicit_sums() {
        let system = testing::model_system(&[5], 2, 2).unwrap();
        let orbitals = orbitals(&system);
        let kernel = DenseCumulantKernel::new(system.eri(), system.nsopi(), &orbitals);
        let lambda = random_cumulant(&kernel, 3);
        let ladder = kernel.ladder(&lambda);
        let mo = kernel.integrals();

        for (case, factor) in [(Case::Aa, 0.5), (Case::Ab, 1.0)] {
            let l = case.select(&lambda.blocks);
            let (vvvv, oooo) = (case.select(&mo.vvvv), case.select(&mo.oooo));
            let [no1, no2, nv1, nv2] = l.dims();
            for (i, j, a, b) in itertools::iproduct!(0..no1, 0..no2, 0..nv1, 0..nv2) {
                let mut expected = 0.0;
                for (c, d) in itertools::iproduct!(0..nv1, 0..nv2) {
                    expected += vvvv[(a, b, c, d)] * l[(i, j, c, d)];
                }
                for (k, m) in itertools::iproduct!(0..no1, 0..no2) {
                    expected += oooo[(k, m, i, j)] * l[(k, m, a, b)];
                }
                assert_relative_eq!(case.select(&ladder)[(i, j, a, b)], factor * expected, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn energy_gradient_is_twice_the_residual() {
        let system = testing::model_system(&[3, 2], 2, 1).unwrap();
        let orbitals = orbitals(&system);
        let kernel = DenseCumulantKernel::new(system.eri(), system.nsopi(), &orbitals);
        assert_eq!(kernel.energy(&DensityCumulant::zeros([2, 1], [3, 4])), 0.0);

        // without Fock terms the residual is g plus the ladder terms
        let fock = [(2, 3), (1, 4)].map(|(o, v)| MoFock {
            oo: DMatrix::zeros(o, o),
            vv: DMatrix::zeros(v, v),
        });
        let lambda = random_cumulant(&kernel, 11);
        let mut residual = lambda.clone();
        kernel.residual(&lambda, &fock, &mut residual);

        let h = 1e-5;
        for (case, index) in [(Case::Aa, [0, 1, 0, 2]), (Case::Ab, [1, 0, 2, 3])] {
            let mut plus = lambda.clone();
            plus.set(case, index, lambda.get(case, index) + h);
            let mut minus = lambda.clone();
            minus.set(case, index, lambda.get(case, index) - h);
            let derivative = (kernel.energy(&plus) - kernel.energy(&minus)) / (2.0 * h);
            assert_relative_eq!(derivative, 2.0 * residual.get(case, index), epsilon = 1e-7);
        }
    }
}
