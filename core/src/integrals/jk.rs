//! Coulomb and exchange builds from a density.

use nalgebra::DMatrix;

use crate::config::JkAlgorithm;
use crate::error::{Result, SolverError};
use crate::linalg::{BlockedMatrix, Dimension};

use super::ElectronTensor;

/// `J[D]_pq = Σ_rs D_rs (pq|rs)` and `K[D]_pq = Σ_rs D_rs (pr|qs)`.
#[derive(Clone, Debug, PartialEq)]
pub struct JkPair {
    pub j: BlockedMatrix,
    pub k: BlockedMatrix,
}

/// Builds the two-electron part of a Fock matrix.
///
/// Densities need not be idempotent, the non-idempotent DCFT tau goes through
/// the same builder.
pub trait FockBuilder {
    fn coulomb_exchange(&self, density: &BlockedMatrix) -> JkPair;
}

/// Precomputed supermatrices over all SO pairs.
pub struct PkBuilder {
    nsopi: Dimension,
    /// `(pq|rs)` with row `pq` and column `rs`
    coulomb: DMatrix<f64>,
    /// `(pr|qs)` with row `pq` and column `rs`
    exchange: DMatrix<f64>,
}

impl PkBuilder {
    pub fn new(eri: &ElectronTensor, nsopi: &[usize]) -> Self {
        let n = eri.size();
        let n2 = n * n;
        log::debug!("building PK supermatrices for {n} functions");

        let coulomb = DMatrix::from_fn(n2, n2, |pq, rs| eri[(pq / n, pq % n, rs / n, rs % n)]);
        let exchange = DMatrix::from_fn(n2, n2, |pq, rs| eri[(pq / n, rs / n, pq % n, rs % n)]);
        Self {
            nsopi: nsopi.iter().copied().collect(),
            coulomb,
            exchange,
        }
    }
}

impl FockBuilder for PkBuilder {
    fn coulomb_exchange(&self, density: &BlockedMatrix) -> JkPair {
        let dense = density.to_dense();
        let n = dense.nrows();
        // row-major vec(D) equals column-major vec(D^T), D is symmetric
        let vectorized = DMatrix::from_column_slice(n * n, 1, dense.transpose().as_slice());

        let reshape = |product: DMatrix<f64>| {
            let square = DMatrix::from_row_slice(n, n, product.as_slice());
            BlockedMatrix::from_dense(&square, &self.nsopi, &self.nsopi)
        };

        JkPair {
            j: reshape(&self.coulomb * &vectorized),
            k: reshape(&self.exchange * &vectorized),
        }
    }
}

/// Contracts the electron tensor on every call.
pub struct DirectBuilder<'a> {
    nsopi: Dimension,
    eri: &'a ElectronTensor,
}

impl<'a> DirectBuilder<'a> {
    pub fn new(eri: &'a ElectronTensor, nsopi: &[usize]) -> Self {
        Self {
            nsopi: nsopi.iter().copied().collect(),
            eri,
        }
    }
}

impl FockBuilder for DirectBuilder<'_> {
    fn coulomb_exchange(&self, density: &BlockedMatrix) -> JkPair {
        let dense = density.to_dense();
        let n = dense.nrows();
        let eri = self.eri;

        let row = |p: usize| -> (Vec<f64>, Vec<f64>) {
            let mut j_row = vec![0.0; n];
            let mut k_row = vec![0.0; n];
            for (q, r, s) in itertools::iproduct!(0..n, 0..n, 0..n) {
                let d = dense[(r, s)];
                if d == 0.0 {
                    continue;
                }
                j_row[q] += d * eri[(p, q, r, s)];
                k_row[q] += d * eri[(p, r, q, s)];
            }
            (j_row, k_row)
        };

        #[cfg(feature = "rayon")]
        let rows: Vec<_> = {
            use rayon::iter::{IntoParallelIterator, ParallelIterator};
            (0..n).into_par_iter().map(row).collect()
        };
        #[cfg(not(feature = "rayon"))]
        let rows: Vec<_> = (0..n).map(row).collect();

        let j = DMatrix::from_fn(n, n, |p, q| rows[p].0[q]);
        let k = DMatrix::from_fn(n, n, |p, q| rows[p].1[q]);
        JkPair {
            j: BlockedMatrix::from_dense(&j, &self.nsopi, &self.nsopi),
            k: BlockedMatrix::from_dense(&k, &self.nsopi, &self.nsopi),
        }
    }
}

/// Chooses the builder for `algorithm`.
pub fn build_jk<'a>(
    algorithm: JkAlgorithm,
    eri: &'a ElectronTensor,
    nsopi: &[usize],
) -> Result<Box<dyn FockBuilder + 'a>> {
    match algorithm {
        JkAlgorithm::Pk => Ok(Box::new(PkBuilder::new(eri, nsopi))),
        JkAlgorithm::Direct => Ok(Box::new(DirectBuilder::new(eri, nsopi))),
        JkAlgorithm::Df => Err(SolverError::not_implemented(
            "SCF_TYPE = DF",
            "systems without an auxiliary basis",
        )),
        JkAlgorithm::OutOfCore => Err(SolverError::not_implemented(
            "SCF_TYPE = OUT_OF_CORE",
            "in-core integral input",
        )),
    }
}
