use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{FileId, OpenMode, Persistence, ScopedFile};
use crate::error::Result;
use crate::linalg::{BlockedMatrix, BlockedVector, Dimension};

/// Coefficients smaller than this do not decide an orbital's phase.
const PHASE_CUTOFF: f64 = 1e-8;

const CHECKPOINT_LABEL: &str = "orbitals";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpinChannel {
    Alpha,
    Beta,
}

impl SpinChannel {
    pub const BOTH: [SpinChannel; 2] = [SpinChannel::Alpha, SpinChannel::Beta];
}

/// The molecular orbitals of one spin.
///
/// Occupied orbitals always come first within an irrep. Occupation numbers are
/// 1 for the occupied block unless a fractional occupation lowered them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpinOrbitals {
    pub(crate) coefficients: BlockedMatrix,
    pub(crate) energies: BlockedVector,
    pub(crate) occupations: BlockedVector,
    pub(crate) noccpi: Dimension,
}

impl SpinOrbitals {
    /// Orbitals without any electrons in them.
    pub fn new(coefficients: BlockedMatrix, energies: BlockedVector) -> Self {
        let nmopi = coefficients.colspi();
        Self {
            occupations: BlockedVector::zeros(&nmopi),
            noccpi: nmopi.iter().map(|_| 0).collect(),
            coefficients,
            energies,
        }
    }

    pub fn coefficients(&self) -> &BlockedMatrix {
        &self.coefficients
    }

    pub fn energies(&self) -> &BlockedVector {
        &self.energies
    }

    pub fn occupations(&self) -> &BlockedVector {
        &self.occupations
    }

    pub fn noccpi(&self) -> &Dimension {
        &self.noccpi
    }

    pub fn nsopi(&self) -> Dimension {
        self.coefficients.rowspi()
    }

    pub fn nmopi(&self) -> Dimension {
        self.coefficients.colspi()
    }

    pub fn nvirpi(&self) -> Dimension {
        self.nmopi()
            .iter()
            .zip(&self.noccpi)
            .map(|(nmo, nocc)| nmo - nocc)
            .collect()
    }

    pub fn nocc(&self) -> usize {
        self.noccpi.iter().sum()
    }

    /// Number of electrons, fractional occupations included.
    pub fn electrons(&self) -> f64 {
        self.occupations.iter().map(|(_, _, n)| n).sum()
    }

    /// Fully occupies the lowest `noccpi[h]` orbitals of every irrep.
    pub fn occupy(&mut self, noccpi: &[usize]) {
        for (h, &nocc) in noccpi.iter().enumerate() {
            let block = self.occupations.block_mut(h);
            for (i, n) in block.iter_mut().enumerate() {
                *n = if i < nocc { 1.0 } else { 0.0 };
            }
        }
        self.noccpi = noccpi.iter().copied().collect();
    }

    pub(crate) fn set_occupation(&mut self, irrep: usize, orbital: usize, value: f64) {
        self.occupations.block_mut(irrep)[orbital] = value;
    }

    /// Replaces coefficients and energies, keeping the occupation pattern.
    pub(crate) fn set_orbitals(&mut self, coefficients: BlockedMatrix, energies: BlockedVector) {
        self.coefficients = coefficients;
        self.energies = energies;
    }

    pub fn copy_from(&mut self, other: &Self) {
        self.coefficients.copy_from(&other.coefficients);
        self.energies.clone_from(&other.energies);
        self.occupations.clone_from(&other.occupations);
        self.noccpi.clone_from(&other.noccpi);
    }

    /// Permutes the orbitals of `irrep` so that new column `k` is old column `order[k]`.
    pub(crate) fn reorder(&mut self, irrep: usize, order: &[usize]) {
        let c = self.coefficients.block(irrep).clone();
        let eps = self.energies.block(irrep).clone();
        let c_out = self.coefficients.block_mut(irrep);
        for (new, &old) in order.iter().enumerate() {
            c_out.set_column(new, &c.column(old));
        }
        let eps_out = self.energies.block_mut(irrep);
        for (new, &old) in order.iter().enumerate() {
            eps_out[new] = eps[old];
        }
    }

    /// `D = C n C^T` in the SO basis.
    pub fn density(&self) -> BlockedMatrix {
        let blocks = self
            .coefficients
            .blocks()
            .iter()
            .enumerate()
            .map(|(h, c)| {
                let weighted = DMatrix::from_fn(c.nrows(), c.ncols(), |i, j| {
                    c[(i, j)] * self.occupations.block(h)[j]
                });
                weighted * c.transpose()
            })
            .collect();
        BlockedMatrix::from_blocks(blocks)
    }

    /// The occupied columns of every irrep side by side, rows over all SOs.
    pub fn occupied_dense(&self) -> DMatrix<f64> {
        self.coefficients.columns_dense(|h| 0..self.noccpi[h])
    }

    pub fn virtual_dense(&self) -> DMatrix<f64> {
        let nmopi = self.nmopi();
        self.coefficients
            .columns_dense(|h| self.noccpi[h]..nmopi[h])
    }

    /// Energies of the occupied orbitals in the order of [`Self::occupied_dense`].
    pub fn occupied_energies(&self) -> Vec<f64> {
        self.energies
            .iter()
            .filter(|&(h, i, _)| i < self.noccpi[h])
            .map(|(_, _, e)| e)
            .collect()
    }

    pub fn virtual_energies(&self) -> Vec<f64> {
        self.energies
            .iter()
            .filter(|&(h, i, _)| i >= self.noccpi[h])
            .map(|(_, _, e)| e)
            .collect()
    }

    /// Flips orbital signs so every orbital has a positive overlap with its
    /// counterpart in `previous`.
    ///
    /// Returns false and leaves the orbitals untouched if some orbital has no
    /// clear counterpart (`|<old|S|new>| < 0.5`).
    pub fn align_phases_to(&mut self, previous: &SpinOrbitals, overlap: &BlockedMatrix) -> bool {
        let mut flips = Vec::new();
        for h in 0..self.coefficients.nirrep() {
            let old = previous.coefficients.block(h);
            let new = self.coefficients.block(h);
            if old.ncols() != new.ncols() {
                return false;
            }
            let projection = old.transpose() * overlap.block(h) * new;
            for i in 0..new.ncols() {
                let diagonal = projection[(i, i)];
                if diagonal.abs() < 0.5 {
                    return false;
                }
                if diagonal < 0.0 {
                    flips.push((h, i));
                }
            }
        }

        for (h, i) in flips {
            self.coefficients.block_mut(h).column_mut(i).neg_mut();
        }
        true
    }

    /// Makes the first significant coefficient of every orbital positive.
    pub fn canonical_phases(&mut self) {
        for block in self.coefficients.blocks_mut() {
            for mut column in block.column_iter_mut() {
                let leading = column.iter().copied().find(|c| c.abs() > PHASE_CUTOFF);
                if leading.is_some_and(|c| c < 0.0) {
                    column.neg_mut();
                }
            }
        }
    }
}

/// Alpha and beta orbitals. Restricted references keep both identical.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrbitalSet {
    pub alpha: SpinOrbitals,
    pub beta: SpinOrbitals,
}

impl OrbitalSet {
    pub fn spin(&self, spin: SpinChannel) -> &SpinOrbitals {
        match spin {
            SpinChannel::Alpha => &self.alpha,
            SpinChannel::Beta => &self.beta,
        }
    }

    pub fn spin_mut(&mut self, spin: SpinChannel) -> &mut SpinOrbitals {
        match spin {
            SpinChannel::Alpha => &mut self.alpha,
            SpinChannel::Beta => &mut self.beta,
        }
    }

    /// Doubly occupied orbitals per irrep.
    pub fn doccpi(&self) -> Dimension {
        self.alpha
            .noccpi
            .iter()
            .zip(&self.beta.noccpi)
            .map(|(&a, &b)| a.min(b))
            .collect()
    }

    /// Singly occupied orbitals per irrep.
    pub fn soccpi(&self) -> Dimension {
        self.alpha
            .noccpi
            .iter()
            .zip(&self.beta.noccpi)
            .map(|(&a, &b)| a.abs_diff(b))
            .collect()
    }

    pub fn densities(&self) -> (BlockedMatrix, BlockedMatrix) {
        (self.alpha.density(), self.beta.density())
    }

    pub fn copy_from(&mut self, other: &Self) {
        self.alpha.copy_from(&other.alpha);
        self.beta.copy_from(&other.beta);
    }

    /// `(<S^2>, S(S+1))` of the determinant built from these orbitals.
    pub fn spin_contamination(&self, overlap: &BlockedMatrix) -> (f64, f64) {
        let na = self.alpha.electrons();
        let nb = self.beta.electrons();
        let sz = 0.5 * (na - nb);

        let mut overlap_sum = 0.0;
        for h in 0..overlap.nirrep() {
            let ca = self.alpha.coefficients.block(h);
            let cb = self.beta.coefficients.block(h);
            let m = ca.transpose() * overlap.block(h) * cb;
            for (i, j) in itertools::iproduct!(0..self.alpha.noccpi[h], 0..self.beta.noccpi[h]) {
                let weight = self.alpha.occupations.block(h)[i] * self.beta.occupations.block(h)[j];
                overlap_sum += weight * m[(i, j)].powi(2);
            }
        }

        let s2 = sz * (sz + 1.0) + nb - overlap_sum;
        let s = sz.abs();
        (s2, s * (s + 1.0))
    }

    /// Writes the orbitals to the checkpoint file.
    pub fn save(&self, store: &mut dyn Persistence) -> Result<()> {
        let mut file = ScopedFile::open(store, FileId::Checkpoint, OpenMode::Existing)?;
        file.write_json(CHECKPOINT_LABEL, self)?;
        file.close()
    }

    /// Orbitals from the checkpoint file, if there are any with the shape `nsopi`.
    pub fn load(store: &mut dyn Persistence, nsopi: &[usize]) -> Result<Option<Self>> {
        let mut file = ScopedFile::open(store, FileId::Checkpoint, OpenMode::Existing)?;
        let orbitals: Option<Self> = file.read_json(CHECKPOINT_LABEL)?;
        file.close()?;

        Ok(orbitals.filter(|o| {
            let fits = o.alpha.nsopi().as_slice() == nsopi && o.beta.nsopi().as_slice() == nsopi;
            if !fits {
                log::warn!("orbitals in the checkpoint do not match the basis, ignoring them");
            }
            fits
        }))
    }
}
