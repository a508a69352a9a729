use std::ops::Range;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::utils;

/// Sizes per irreducible representation.
pub type Dimension = SmallVec<[usize; 8]>;

/// Start offset of every irrep when the blocks are laid out one after the other.
pub fn offsets(dims: &[usize]) -> Dimension {
    let mut offset = 0;
    dims.iter()
        .map(|&n| {
            let start = offset;
            offset += n;
            start
        })
        .collect()
}

/// A matrix that is block diagonal in the irreps. Elements coupling two different
/// irreps are never stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockedMatrix {
    blocks: Vec<DMatrix<f64>>,
}

impl BlockedMatrix {
    pub fn zeros(rowspi: &[usize], colspi: &[usize]) -> Self {
        assert_eq!(rowspi.len(), colspi.len(), "irrep count mismatch");
        Self {
            blocks: rowspi
                .iter()
                .zip(colspi)
                .map(|(&r, &c)| DMatrix::zeros(r, c))
                .collect(),
        }
    }

    pub fn square(dims: &[usize]) -> Self {
        Self::zeros(dims, dims)
    }

    pub fn identity(dims: &[usize]) -> Self {
        Self {
            blocks: dims.iter().map(|&n| DMatrix::identity(n, n)).collect(),
        }
    }

    pub fn from_blocks(blocks: Vec<DMatrix<f64>>) -> Self {
        Self { blocks }
    }

    /// Builds every block element from `func(irrep, row, col)`.
    pub fn from_fn(
        rowspi: &[usize],
        colspi: &[usize],
        mut func: impl FnMut(usize, usize, usize) -> f64,
    ) -> Self {
        Self {
            blocks: rowspi
                .iter()
                .zip(colspi)
                .enumerate()
                .map(|(h, (&r, &c))| DMatrix::from_fn(r, c, |i, j| func(h, i, j)))
                .collect(),
        }
    }

    /// Extracts the diagonal blocks of a dense matrix laid out irrep after irrep.
    pub fn from_dense(dense: &DMatrix<f64>, rowspi: &[usize], colspi: &[usize]) -> Self {
        let row_offsets = offsets(rowspi);
        let col_offsets = offsets(colspi);
        Self::from_fn(rowspi, colspi, |h, i, j| {
            dense[(row_offsets[h] + i, col_offsets[h] + j)]
        })
    }

    pub fn nirrep(&self) -> usize {
        self.blocks.len()
    }

    pub fn rowspi(&self) -> Dimension {
        self.blocks.iter().map(|b| b.nrows()).collect()
    }

    pub fn colspi(&self) -> Dimension {
        self.blocks.iter().map(|b| b.ncols()).collect()
    }

    pub fn block(&self, h: usize) -> &DMatrix<f64> {
        &self.blocks[h]
    }

    pub fn block_mut(&mut self, h: usize) -> &mut DMatrix<f64> {
        &mut self.blocks[h]
    }

    pub fn blocks(&self) -> &[DMatrix<f64>] {
        &self.blocks
    }

    pub fn blocks_mut(&mut self) -> &mut [DMatrix<f64>] {
        &mut self.blocks
    }

    pub fn same_shape(&self, other: &Self) -> bool {
        self.blocks.len() == other.blocks.len()
            && self
                .blocks
                .iter()
                .zip(&other.blocks)
                .all(|(a, b)| a.shape() == b.shape())
    }

    /// Number of stored elements.
    pub fn len(&self) -> usize {
        self.blocks.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrites the contents in place. Shapes must match.
    pub fn copy_from(&mut self, other: &Self) {
        assert!(self.same_shape(other), "block shape mismatch in copy");
        for (a, b) in self.blocks.iter_mut().zip(&other.blocks) {
            a.copy_from(b);
        }
    }

    pub fn fill(&mut self, value: f64) {
        self.blocks.iter_mut().for_each(|b| b.fill(value));
    }

    pub fn scale_mut(&mut self, factor: f64) {
        self.blocks.iter_mut().for_each(|b| *b *= factor);
    }

    /// `self += alpha * other`
    pub fn axpy(&mut self, alpha: f64, other: &Self) {
        for (a, b) in self.blocks.iter_mut().zip(&other.blocks) {
            *a += b * alpha;
        }
    }

    pub fn add(&self, other: &Self) -> Self {
        self.zip_with(other, |a, b| a + b)
    }

    pub fn sub(&self, other: &Self) -> Self {
        self.zip_with(other, |a, b| a - b)
    }

    /// Block-wise matrix product.
    pub fn mul(&self, other: &Self) -> Self {
        self.zip_with(other, |a, b| a * b)
    }

    pub fn transpose(&self) -> Self {
        Self {
            blocks: self.blocks.iter().map(|b| b.transpose()).collect(),
        }
    }

    /// `X^T A X`
    pub fn transform(&self, x: &Self) -> Self {
        self.zip_with(x, |a, x| x.tr_mul(&(a * x)))
    }

    /// `X A X^T`
    pub fn back_transform(&self, x: &Self) -> Self {
        self.zip_with(x, |a, x| x * a * x.transpose())
    }

    /// Frobenius inner product summed over blocks.
    pub fn dot(&self, other: &Self) -> f64 {
        self.blocks
            .iter()
            .zip(&other.blocks)
            .map(|(a, b)| a.dot(b))
            .sum()
    }

    pub fn sum_of_squares(&self) -> f64 {
        self.blocks.iter().map(|b| b.norm_squared()).sum()
    }

    pub fn rms(&self) -> f64 {
        match self.len() {
            0 => 0.0,
            n => (self.sum_of_squares() / n as f64).sqrt(),
        }
    }

    pub fn trace(&self) -> f64 {
        self.blocks.iter().map(|b| b.trace()).sum()
    }

    pub fn max_abs(&self) -> f64 {
        self.blocks
            .iter()
            .flat_map(|b| b.iter())
            .fold(0.0, |acc: f64, v| acc.max(v.abs()))
    }

    /// Diagonalizes every block, eigenvalues ascending within each irrep.
    pub fn symmetric_eigen(&self) -> (Self, BlockedVector) {
        let (vectors, values): (Vec<_>, Vec<_>) = self
            .blocks
            .iter()
            .map(|b| utils::sorted_eigs(b.clone()))
            .unzip();
        (Self { blocks: vectors }, BlockedVector { blocks: values })
    }

    /// Dense block-diagonal representation.
    pub fn to_dense(&self) -> DMatrix<f64> {
        let rows = offsets(&self.rowspi());
        let cols = offsets(&self.colspi());
        let nrow = self.blocks.iter().map(|b| b.nrows()).sum();
        let ncol = self.blocks.iter().map(|b| b.ncols()).sum();

        let mut dense = DMatrix::zeros(nrow, ncol);
        for (h, block) in self.blocks.iter().enumerate() {
            dense
                .view_mut((rows[h], cols[h]), block.shape())
                .copy_from(block);
        }
        dense
    }

    /// Dense matrix built from a column range of every block, keeping the
    /// row layout of the full dense representation.
    pub fn columns_dense(&self, ranges: impl Fn(usize) -> Range<usize>) -> DMatrix<f64> {
        let rows = offsets(&self.rowspi());
        let nrow = self.blocks.iter().map(|b| b.nrows()).sum();
        let ncol = (0..self.nirrep()).map(|h| ranges(h).len()).sum();

        let mut dense = DMatrix::zeros(nrow, ncol);
        let mut col = 0;
        for (h, block) in self.blocks.iter().enumerate() {
            let range = ranges(h);
            let width = range.len();
            dense
                .view_mut((rows[h], col), (block.nrows(), width))
                .copy_from(&block.columns(range.start, width));
            col += width;
        }
        dense
    }

    fn zip_with(
        &self,
        other: &Self,
        mut func: impl FnMut(&DMatrix<f64>, &DMatrix<f64>) -> DMatrix<f64>,
    ) -> Self {
        assert_eq!(self.nirrep(), other.nirrep(), "irrep count mismatch");
        Self {
            blocks: self
                .blocks
                .iter()
                .zip(&other.blocks)
                .map(|(a, b)| func(a, b))
                .collect(),
        }
    }
}

/// A vector partitioned by irrep, e.g. orbital energies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockedVector {
    blocks: Vec<DVector<f64>>,
}

impl BlockedVector {
    pub fn zeros(dims: &[usize]) -> Self {
        Self {
            blocks: dims.iter().map(|&n| DVector::zeros(n)).collect(),
        }
    }

    pub fn from_blocks(blocks: Vec<DVector<f64>>) -> Self {
        Self { blocks }
    }

    pub fn dims(&self) -> Dimension {
        self.blocks.iter().map(|b| b.len()).collect()
    }

    pub fn block(&self, h: usize) -> &DVector<f64> {
        &self.blocks[h]
    }

    pub fn block_mut(&mut self, h: usize) -> &mut DVector<f64> {
        &mut self.blocks[h]
    }

    pub fn nirrep(&self) -> usize {
        self.blocks.len()
    }

    /// `(irrep, index, value)` for every element.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        self.blocks
            .iter()
            .enumerate()
            .flat_map(|(h, b)| b.iter().enumerate().map(move |(i, &v)| (h, i, v)))
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    use super::*;

    fn sample() -> BlockedMatrix {
        BlockedMatrix::from_blocks(vec![
            DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.5, 2.0]),
            DMatrix::from_row_slice(1, 1, &[3.0]),
        ])
    }

    #[test]
    fn dense_round_trip_keeps_blocks() {
        let m = sample();
        let dense = m.to_dense();
        assert_eq!(dense.shape(), (3, 3));
        assert_eq!(dense[(0, 2)], 0.0);
        assert_eq!(dense[(2, 2)], 3.0);

        let back = BlockedMatrix::from_dense(&dense, &[2, 1], &[2, 1]);
        assert_eq!(back, m);
    }

    #[test]
    fn transform_with_identity_is_noop() {
        let m = sample();
        let x = BlockedMatrix::identity(&[2, 1]);
        assert_eq!(m.transform(&x), m);
    }

    #[test]
    fn eigenvalues_sorted_per_irrep() {
        let (vectors, values) = sample().symmetric_eigen();
        assert!(values.block(0)[0] < values.block(0)[1]);
        assert_relative_eq!(values.block(1)[0], 3.0);
        assert_eq!(vectors.colspi().as_slice(), &[2, 1]);
    }

    #[test]
    fn columns_dense_selects_ranges() {
        let c = BlockedMatrix::from_blocks(vec![
            DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]),
            DMatrix::from_row_slice(1, 1, &[5.0]),
        ]);
        let occupied = c.columns_dense(|h| if h == 0 { 0..1 } else { 0..1 });
        assert_eq!(occupied.shape(), (3, 2));
        assert_eq!(occupied[(1, 0)], 3.0);
        assert_eq!(occupied[(2, 1)], 5.0);
        assert_eq!(occupied[(2, 0)], 0.0);
    }

    #[test]
    fn rms_counts_stored_elements() {
        let m = BlockedMatrix::from_blocks(vec![DMatrix::from_element(2, 2, 2.0)]);
        assert_relative_eq!(m.rms(), 2.0);
        assert_eq!(BlockedMatrix::square(&[0, 0]).rms(), 0.0);
    }
}
