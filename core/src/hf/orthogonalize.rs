use nalgebra::DMatrix;

use crate::config::Orthogonalization;
use crate::error::{Result, SolverError};
use crate::linalg::{utils, BlockedMatrix, Dimension};

use super::orbitals::SpinOrbitals;

/// The basis orthogonalizer `X` with `X^T S X = 1`.
///
/// Symmetric orthogonalization keeps one MO per SO. Canonical orthogonalization
/// drops the overlap eigenvectors below the tolerance, so `nmopi` may be
/// smaller than `nsopi`.
#[derive(Clone, Debug)]
pub struct Orthogonalizer {
    x: BlockedMatrix,
    method: Orthogonalization,
}

impl Orthogonalizer {
    /// Chooses symmetric orthogonalization unless canonical is requested or the
    /// smallest overlap eigenvalue falls below `tolerance`.
    pub fn new(overlap: &BlockedMatrix, requested: Orthogonalization, tolerance: f64) -> Result<Self> {
        let decompositions: Vec<_> = overlap
            .blocks()
            .iter()
            .map(|s| utils::sorted_eigs(s.clone()))
            .collect();

        let min_eigenvalue = decompositions
            .iter()
            .flat_map(|(_, values)| values.iter().copied())
            .fold(f64::INFINITY, f64::min);
        log::debug!("minimum overlap eigenvalue: {min_eigenvalue:.3e}");

        if tolerance <= 0.0 {
            return Err(SolverError::configuration("S_TOLERANCE must be positive"));
        }

        let method = if min_eigenvalue < tolerance {
            Orthogonalization::Canonical
        } else {
            requested
        };

        let blocks = decompositions
            .into_iter()
            .enumerate()
            .map(|(h, (u, s))| match method {
                Orthogonalization::Symmetric => {
                    let inv_sqrt = DMatrix::from_diagonal(&s.map(|v| v.sqrt().recip()));
                    &u * inv_sqrt * u.transpose()
                }
                Orthogonalization::Canonical => {
                    let kept: Vec<usize> = (0..s.len()).filter(|&i| s[i] >= tolerance).collect();
                    let eliminated = s.len() - kept.len();
                    if eliminated > 0 {
                        log::info!("irrep {h}: {eliminated} linearly dependent functions removed");
                    }
                    DMatrix::from_fn(u.nrows(), kept.len(), |i, k| {
                        u[(i, kept[k])] / s[kept[k]].sqrt()
                    })
                }
            })
            .collect();

        log::debug!("using {method:?} orthogonalization");
        Ok(Self {
            x: BlockedMatrix::from_blocks(blocks),
            method,
        })
    }

    pub fn matrix(&self) -> &BlockedMatrix {
        &self.x
    }

    pub fn method(&self) -> Orthogonalization {
        self.method
    }

    pub fn nmopi(&self) -> Dimension {
        self.x.colspi()
    }

    /// Solves `F C = S C e` through `X^T F X`.
    pub fn diagonalize(&self, fock: &BlockedMatrix) -> SpinOrbitals {
        let (vectors, energies) = fock.transform(&self.x).symmetric_eigen();
        SpinOrbitals::new(self.x.mul(&vectors), energies)
    }
}
