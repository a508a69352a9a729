//! The one-particle part of the density implied by the cumulant.

use nalgebra::DMatrix;

use crate::hf::OrbitalSet;
use crate::linalg::BlockedMatrix;

use super::cumulant::DensityCumulant;

/// Occupied and virtual blocks of tau per spin, dense in cumulant index order.
#[derive(Clone, Debug, PartialEq)]
pub struct Tau {
    pub oo: [DMatrix<f64>; 2],
    pub vv: [DMatrix<f64>; 2],
}

impl Tau {
    pub fn zeros(occupied: [usize; 2], virtuals: [usize; 2]) -> Self {
        Self {
            oo: occupied.map(|n| DMatrix::zeros(n, n)),
            vv: virtuals.map(|n| DMatrix::zeros(n, n)),
        }
    }

    /// Tau to second order in the cumulant.
    pub fn approximate(lambda: &DensityCumulant) -> Self {
        let (aa, ab, bb) = (&lambda.blocks.aa, &lambda.blocks.ab, &lambda.blocks.bb);
        let [oa, ob, va, vb] = ab.dims();
        let mut tau = Self::zeros([oa, ob], [va, vb]);

        for (i, j) in itertools::iproduct!(0..oa, 0..oa) {
            let mut value = 0.0;
            for (k, a, b) in itertools::iproduct!(0..oa, 0..va, 0..va) {
                value -= 0.5 * aa[(i, k, a, b)] * aa[(j, k, a, b)];
            }
            for (k, a, b) in itertools::iproduct!(0..ob, 0..va, 0..vb) {
                value -= ab[(i, k, a, b)] * ab[(j, k, a, b)];
            }
            tau.oo[0][(i, j)] = value;
        }
        for (i, j) in itertools::iproduct!(0..ob, 0..ob) {
            let mut value = 0.0;
            for (k, a, b) in itertools::iproduct!(0..ob, 0..vb, 0..vb) {
                value -= 0.5 * bb[(i, k, a, b)] * bb[(j, k, a, b)];
            }
            for (k, a, b) in itertools::iproduct!(0..oa, 0..va, 0..vb) {
                value -= ab[(k, i, a, b)] * ab[(k, j, a, b)];
            }
            tau.oo[1][(i, j)] = value;
        }
        for (a, b) in itertools::iproduct!(0..va, 0..va) {
            let mut value = 0.0;
            for (i, j, c) in itertools::iproduct!(0..oa, 0..oa, 0..va) {
                value += 0.5 * aa[(i, j, a, c)] * aa[(i, j, b, c)];
            }
            for (i, j, c) in itertools::iproduct!(0..oa, 0..ob, 0..vb) {
                value += ab[(i, j, a, c)] * ab[(i, j, b, c)];
            }
            tau.vv[0][(a, b)] = value;
        }
        for (a, b) in itertools::iproduct!(0..vb, 0..vb) {
            let mut value = 0.0;
            for (i, j, c) in itertools::iproduct!(0..ob, 0..ob, 0..vb) {
                value += 0.5 * bb[(i, j, a, c)] * bb[(i, j, b, c)];
            }
            for (i, j, c) in itertools::iproduct!(0..oa, 0..ob, 0..va) {
                value += ab[(i, j, c, a)] * ab[(i, j, c, b)];
            }
            tau.vv[1][(a, b)] = value;
        }
        tau
    }

    /// Replaces the approximate tau by the exact one of the DC-12 functional.
    ///
    /// Every eigenvalue `d` becomes `(-1 + sqrt(1 + 4d)) / 2` in the occupied
    /// and `(1 - sqrt(1 - 4d)) / 2` in the virtual space. Returns false if an
    /// eigenvalue was outside the domain and had to be clamped.
    pub fn refine(&mut self) -> bool {
        let occupied = |d: f64| (-1.0 + (1.0 + 4.0 * d).sqrt()) / 2.0;
        let virtual_ = |d: f64| (1.0 - (1.0 - 4.0 * d).sqrt()) / 2.0;

        let mut valid = true;
        for m in &mut self.oo {
            valid &= map_eigenvalues(m, |d| (d.max(-0.25), d >= -0.25), occupied);
        }
        for m in &mut self.vv {
            valid &= map_eigenvalues(m, |d| (d.min(0.25), d <= 0.25), virtual_);
        }
        if !valid {
            log::warn!("tau eigenvalues outside the DC-12 domain were clamped");
        }
        valid
    }

    /// `C_occ tau_oo C_occ^T + C_vir tau_vv C_vir^T` per spin.
    pub fn to_so(&self, orbitals: &OrbitalSet, nsopi: &[usize]) -> [BlockedMatrix; 2] {
        let spins = [&orbitals.alpha, &orbitals.beta];
        std::array::from_fn(|s| {
            let occupied = spins[s].occupied_dense();
            let virtuals = spins[s].virtual_dense();
            let dense = &occupied * &self.oo[s] * occupied.transpose()
                + &virtuals * &self.vv[s] * virtuals.transpose();
            BlockedMatrix::from_dense(&dense, nsopi, nsopi)
        })
    }
}

fn map_eigenvalues(
    matrix: &mut DMatrix<f64>,
    clamp: impl Fn(f64) -> (f64, bool),
    func: impl Fn(f64) -> f64,
) -> bool {
    if matrix.is_empty() {
        return true;
    }
    let eigen = matrix.clone().symmetric_eigen();
    let mut valid = true;
    let values = eigen.eigenvalues.map(|d| {
        let (d, inside) = clamp(d);
        valid &= inside;
        func(d)
    });
    *matrix = &eigen.eigenvectors * DMatrix::from_diagonal(&values) * eigen.eigenvectors.transpose();
    valid
}
