//! The density cumulant and its Jacobi update.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::checkpoint::ScopedFile;
use crate::diis::{SlotMut, SlotRef};
use crate::error::Result;
use crate::integrals::SpinCases;
use crate::linalg::Tensor4;
use crate::step::FixedPointStep;

use super::kernel::{CumulantKernel, MoFock};

const CUMULANT_LABEL: &str = "lambda";

/// `λ` in three spin blocks: `<OO|VV>` (αα), `<Oo|Vv>` (αβ) and `<oo|vv>` (ββ),
/// each laid out as `[i, j, a, b]`. The same-spin blocks are antisymmetric in
/// `i <-> j` and in `a <-> b`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DensityCumulant {
    pub blocks: SpinCases<Tensor4>,
}

impl DensityCumulant {
    /// `occupied` and `virtuals` hold the alpha and beta counts.
    pub fn zeros(occupied: [usize; 2], virtuals: [usize; 2]) -> Self {
        let [oa, ob] = occupied;
        let [va, vb] = virtuals;
        Self {
            blocks: SpinCases {
                aa: Tensor4::zeros([oa, oa, va, va]),
                ab: Tensor4::zeros([oa, ob, va, vb]),
                bb: Tensor4::zeros([ob, ob, vb, vb]),
            },
        }
    }

    pub fn copy_from(&mut self, other: &Self) {
        self.blocks.aa.copy_from(&other.blocks.aa);
        self.blocks.ab.copy_from(&other.blocks.ab);
        self.blocks.bb.copy_from(&other.blocks.bb);
    }

    fn tensors(&self) -> [&Tensor4; 3] {
        [&self.blocks.aa, &self.blocks.ab, &self.blocks.bb]
    }

    /// RMS over the three blocks together.
    pub fn rms(&self) -> f64 {
        let (squares, len) = self
            .tensors()
            .iter()
            .fold((0.0, 0), |(s, n), t| (s + t.sum_of_squares(), n + t.len()));
        if len == 0 {
            0.0
        } else {
            (squares / len as f64).sqrt()
        }
    }

    /// Number of independent amplitudes.
    pub fn unique_len(&self) -> usize {
        let pairs = |n: usize| n * n.saturating_sub(1) / 2;
        let [oa, _, va, _] = self.blocks.aa.dims();
        let [ob, _, vb, _] = self.blocks.bb.dims();
        pairs(oa) * pairs(va) + self.blocks.ab.len() + pairs(ob) * pairs(vb)
    }

    /// Visits the independent amplitudes in a fixed order: `i<j, a<b` of the
    /// alpha block, all of the mixed block, then `I<J, A<B` of the beta block.
    pub fn unique_indices(&self) -> Vec<(Case, [usize; 4])> {
        let mut indices = Vec::with_capacity(self.unique_len());
        let same_spin = |case: Case, dims: [usize; 4], out: &mut Vec<(Case, [usize; 4])>| {
            for i in 0..dims[0] {
                for j in i + 1..dims[1] {
                    for a in 0..dims[2] {
                        for b in a + 1..dims[3] {
                            out.push((case, [i, j, a, b]));
                        }
                    }
                }
            }
        };
        same_spin(Case::Aa, self.blocks.aa.dims(), &mut indices);
        let [o1, o2, v1, v2] = self.blocks.ab.dims();
        for (i, j, a, b) in itertools::iproduct!(0..o1, 0..o2, 0..v1, 0..v2) {
            indices.push((Case::Ab, [i, j, a, b]));
        }
        same_spin(Case::Bb, self.blocks.bb.dims(), &mut indices);
        indices
    }

    pub fn get(&self, case: Case, [i, j, a, b]: [usize; 4]) -> f64 {
        case.select(&self.blocks)[(i, j, a, b)]
    }

    /// Sets an amplitude together with its antisymmetric partners.
    pub fn set(&mut self, case: Case, [i, j, a, b]: [usize; 4], value: f64) {
        let tensor = case.select_mut(&mut self.blocks);
        tensor[(i, j, a, b)] = value;
        if case != Case::Ab {
            tensor[(j, i, a, b)] = -value;
            tensor[(i, j, b, a)] = -value;
            tensor[(j, i, b, a)] = value;
        }
    }

    pub fn save(&self, file: &mut ScopedFile<'_>) -> Result<()> {
        file.write_json(CUMULANT_LABEL, self)
    }

    pub fn load(file: &mut ScopedFile<'_>) -> Result<Option<Self>> {
        file.read_json(CUMULANT_LABEL)
    }
}

/// One of the three spin blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Case {
    Aa,
    Ab,
    Bb,
}

impl Case {
    pub const ALL: [Case; 3] = [Case::Aa, Case::Ab, Case::Bb];

    pub fn select<T>(self, cases: &SpinCases<T>) -> &T {
        match self {
            Case::Aa => &cases.aa,
            Case::Ab => &cases.ab,
            Case::Bb => &cases.bb,
        }
    }

    pub fn select_mut<T>(self, cases: &mut SpinCases<T>) -> &mut T {
        match self {
            Case::Aa => &mut cases.aa,
            Case::Ab => &mut cases.ab,
            Case::Bb => &mut cases.bb,
        }
    }

    /// Spin of the `(i, a)` and `(j, b)` index pairs, 0 for alpha.
    pub fn spins(self) -> (usize, usize) {
        match self {
            Case::Aa => (0, 0),
            Case::Ab => (0, 1),
            Case::Bb => (1, 1),
        }
    }
}

/// `D_ijab = f_ii + f_jj - f_aa - f_bb` from the MO Fock diagonals.
pub fn denominators(fock: &[MoFock; 2]) -> SpinCases<Tensor4> {
    let build = |case: Case| {
        let (s1, s2) = case.spins();
        let (o1, v1) = (fock[s1].oo.diagonal(), fock[s1].vv.diagonal());
        let (o2, v2) = (fock[s2].oo.diagonal(), fock[s2].vv.diagonal());
        Tensor4::from_fn([o1.len(), o2.len(), v1.len(), v2.len()], |i, j, a, b| {
            o1[i] + o2[j] - v1[a] - v2[b]
        })
    };
    SpinCases {
        aa: build(Case::Aa),
        ab: build(Case::Ab),
        bb: build(Case::Bb),
    }
}

/// Rows over the first two indices, columns over the last two.
pub(crate) fn as_matrix(tensor: &Tensor4) -> DMatrix<f64> {
    let [n0, n1, n2, n3] = tensor.dims();
    DMatrix::from_row_slice(n0 * n1, n2 * n3, tensor.as_slice())
}

pub(crate) fn from_matrix(dims: [usize; 4], matrix: &DMatrix<f64>) -> Tensor4 {
    let mut tensor = Tensor4::zeros(dims);
    tensor
        .as_mut_slice()
        .copy_from_slice(matrix.transpose().as_slice());
    tensor
}

/// The cumulant sector: amplitudes, residual and denominators.
#[derive(Clone, Debug)]
pub struct CumulantStep {
    lambda: DensityCumulant,
    residual: DensityCumulant,
    denominators: SpinCases<Tensor4>,
    rms: f64,
}

impl CumulantStep {
    pub fn new(fock: &[MoFock; 2]) -> Self {
        let occupied = [fock[0].oo.nrows(), fock[1].oo.nrows()];
        let virtuals = [fock[0].vv.nrows(), fock[1].vv.nrows()];
        Self {
            lambda: DensityCumulant::zeros(occupied, virtuals),
            residual: DensityCumulant::zeros(occupied, virtuals),
            denominators: denominators(fock),
            rms: f64::INFINITY,
        }
    }

    pub fn lambda(&self) -> &DensityCumulant {
        &self.lambda
    }

    pub fn lambda_mut(&mut self) -> &mut DensityCumulant {
        &mut self.lambda
    }

    pub fn residual(&self) -> &DensityCumulant {
        &self.residual
    }

    pub fn denominator(&self, case: Case, [i, j, a, b]: [usize; 4]) -> f64 {
        case.select(&self.denominators)[(i, j, a, b)]
    }

    pub fn set_denominators(&mut self, fock: &[MoFock; 2]) {
        self.denominators = denominators(fock);
    }

    /// `λ = g / D`, the first-order cumulant.
    pub fn mp2_guess(&mut self, kernel: &dyn CumulantKernel) {
        let g = &kernel.integrals().oovv;
        for case in Case::ALL {
            let lambda = case.select_mut(&mut self.lambda.blocks);
            let (g, d) = (case.select(g), case.select(&self.denominators));
            for ((l, g), d) in lambda.as_mut_slice().iter_mut().zip(g.as_slice()).zip(d.as_slice()) {
                *l = g / d;
            }
        }
    }

    /// Recomputes the residual, returns its RMS.
    pub fn compute_residual(&mut self, kernel: &dyn CumulantKernel, fock: &[MoFock; 2]) -> f64 {
        self.rms = kernel.residual(&self.lambda, fock, &mut self.residual);
        self.rms
    }

    /// Jacobi step `λ += R / D`.
    pub fn update(&mut self) {
        for case in Case::ALL {
            let lambda = case.select_mut(&mut self.lambda.blocks);
            let (r, d) = (case.select(&self.residual.blocks), case.select(&self.denominators));
            for ((l, r), d) in lambda.as_mut_slice().iter_mut().zip(r.as_slice()).zip(d.as_slice()) {
                *l += r / d;
            }
        }
    }
}

impl FixedPointStep for CumulantStep {
    fn error_slots(&self) -> Vec<SlotRef<'_>> {
        self.residual.tensors().into_iter().map(SlotRef::Tensor).collect()
    }

    fn solution_slots(&self) -> Vec<SlotRef<'_>> {
        self.lambda.tensors().into_iter().map(SlotRef::Tensor).collect()
    }

    fn solution_slots_mut(&mut self) -> Vec<SlotMut<'_>> {
        let SpinCases { aa, ab, bb } = &mut self.lambda.blocks;
        vec![SlotMut::Tensor(aa), SlotMut::Tensor(ab), SlotMut::Tensor(bb)]
    }

    fn residual_norm(&self) -> f64 {
        self.rms
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::checkpoint::{FileId, MemoryStore, OpenMode};

    fn fock(occ: &[f64], vir: &[f64]) -> MoFock {
        MoFock {
            oo: DMatrix::from_diagonal(&nalgebra::DVector::from_row_slice(occ)),
            vv: DMatrix::from_diagonal(&nalgebra::DVector::from_row_slice(vir)),
        }
    }

    #[test]
    fn denominators_follow_orbital_energies() {
        let fock = [fock(&[-1.0, -0.5], &[0.25, 0.75]), fock(&[-0.9], &[0.3, 0.6])];
        let d = denominators(&fock);
        assert_eq!(d.aa.dims(), [2, 2, 2, 2]);
        assert_eq!(d.ab.dims(), [2, 1, 2, 2]);
        assert_eq!(d.bb.dims(), [1, 1, 2, 2]);
        assert_relative_eq!(d.aa[(0, 1, 0, 1)], -1.0 - 0.5 - 0.25 - 0.75);
        assert_relative_eq!(d.ab[(1, 0, 1, 0)], -0.5 - 0.9 - 0.75 - 0.3);
    }

    #[test]
    fn set_keeps_antisymmetry() {
        let mut lambda = DensityCumulant::zeros([3, 2], [2, 2]);
        lambda.set(Case::Aa, [0, 2, 0, 1], 0.3);
        assert_eq!(lambda.get(Case::Aa, [2, 0, 0, 1]), -0.3);
        assert_eq!(lambda.get(Case::Aa, [0, 2, 1, 0]), -0.3);
        assert_eq!(lambda.get(Case::Aa, [2, 0, 1, 0]), 0.3);

        lambda.set(Case::Ab, [2, 1, 0, 1], 0.1);
        assert_eq!(lambda.get(Case::Ab, [2, 1, 0, 1]), 0.1);
        assert_relative_eq!(lambda.blocks.ab.sum_of_squares(), 0.01, epsilon = 1e-15);
    }

    #[test]
    fn unique_amplitudes_are_counted_once() {
        let lambda = DensityCumulant::zeros([3, 2], [2, 3]);
        // 3 * 1 + 3 * 2 * 2 * 3 + 1 * 3
        assert_eq!(lambda.unique_len(), 3 + 36 + 3);
        assert_eq!(lambda.unique_indices().len(), lambda.unique_len());
    }

    #[test]
    fn matrix_view_round_trips() {
        let t = Tensor4::from_fn([2, 3, 2, 1], |i, j, k, l| (i * 100 + j * 10 + k + l) as f64);
        let m = as_matrix(&t);
        assert_eq!(m[(5, 1)], t[(1, 2, 1, 0)]);
        assert_eq!(from_matrix(t.dims(), &m), t);
    }

    #[test]
    fn cumulant_persists_in_its_file() {
        let mut store = MemoryStore::new();
        let mut lambda = DensityCumulant::zeros([2, 2], [2, 2]);
        lambda.set(Case::Bb, [0, 1, 0, 1], -0.02);

        let mut file = ScopedFile::open(&mut store, FileId::Cumulant, OpenMode::Create).unwrap();
        lambda.save(&mut file).unwrap();
        assert_eq!(DensityCumulant::load(&mut file).unwrap(), Some(lambda));
    }
}
