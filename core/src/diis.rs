//! Pulay DIIS over composite vectors.
//!
//! An entry is a pair of error and solution tuples. Every element of a tuple is a
//! [`Slot`]: a blocked matrix or a four-index tensor. The extrapolation treats each
//! tuple as one flattened vector.

use std::borrow::Cow;
use std::collections::VecDeque;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::checkpoint::{FileId, OpenMode, Persistence, ScopedFile};
use crate::error::{Result, SolverError};
use crate::linalg::{utils, BlockedMatrix, Dimension, Tensor4};

/// Relative size of the smallest pivot below which the B-matrix is treated as singular.
const SINGULAR_TOLERANCE: f64 = 1e-12;
/// Coefficients larger than this indicate a numerically singular solve.
const MAX_COEFFICIENT: f64 = 1e8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SlotShape {
    Matrix { rowspi: Dimension, colspi: Dimension },
    Tensor([usize; 4]),
}

/// An owned copy of one slot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Slot {
    Matrix(BlockedMatrix),
    Tensor(Tensor4),
}

#[derive(Clone, Copy, Debug)]
pub enum SlotRef<'a> {
    Matrix(&'a BlockedMatrix),
    Tensor(&'a Tensor4),
}

#[derive(Debug)]
pub enum SlotMut<'a> {
    Matrix(&'a mut BlockedMatrix),
    Tensor(&'a mut Tensor4),
}

impl SlotRef<'_> {
    pub fn shape(&self) -> SlotShape {
        match self {
            SlotRef::Matrix(m) => SlotShape::Matrix {
                rowspi: m.rowspi(),
                colspi: m.colspi(),
            },
            SlotRef::Tensor(t) => SlotShape::Tensor(t.dims()),
        }
    }

    fn to_slot(self) -> Slot {
        match self {
            SlotRef::Matrix(m) => Slot::Matrix(m.clone()),
            SlotRef::Tensor(t) => Slot::Tensor(t.clone()),
        }
    }
}

impl Slot {
    fn dot(&self, other: &Slot) -> f64 {
        match (self, other) {
            (Slot::Matrix(a), Slot::Matrix(b)) => a.dot(b),
            (Slot::Tensor(a), Slot::Tensor(b)) => a.dot(b),
            // layouts are checked on insertion
            _ => 0.0,
        }
    }

    fn sum_of_squares(&self) -> f64 {
        self.dot(self)
    }
}

impl SlotMut<'_> {
    pub fn shape(&self) -> SlotShape {
        match self {
            SlotMut::Matrix(m) => SlotRef::Matrix(m).shape(),
            SlotMut::Tensor(t) => SlotRef::Tensor(t).shape(),
        }
    }

    fn zero(&mut self) {
        match self {
            SlotMut::Matrix(m) => m.fill(0.0),
            SlotMut::Tensor(t) => t.fill(0.0),
        }
    }

    fn axpy(&mut self, alpha: f64, source: &Slot) {
        match (self, source) {
            (SlotMut::Matrix(m), Slot::Matrix(s)) => m.axpy(alpha, s),
            (SlotMut::Tensor(t), Slot::Tensor(s)) => t.axpy(alpha, s),
            _ => {}
        }
    }
}

/// Which entry to evict once the subspace is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemovalPolicy {
    #[default]
    OldestAdded,
    LargestError,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiisConfig {
    /// Entries kept before eviction.
    pub max_vectors: usize,
    /// Entries needed before [`DiisSubspace::extrapolate`] is worth calling.
    pub min_vectors: usize,
    pub removal: RemovalPolicy,
}

impl Default for DiisConfig {
    fn default() -> Self {
        Self {
            max_vectors: 10,
            min_vectors: 2,
            removal: RemovalPolicy::OldestAdded,
        }
    }
}

/// Outcome of an extrapolation.
#[derive(Clone, Debug, PartialEq)]
pub struct Extrapolation {
    /// One coefficient per stored entry, oldest first. Entries dropped to
    /// recover from a singular system have a zero coefficient.
    pub coefficients: Vec<f64>,
    /// Oldest entries left out of this extrapolation.
    pub dropped: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Payload {
    errors: Vec<Slot>,
    solutions: Vec<Slot>,
}

#[derive(Debug)]
struct Entry {
    position: usize,
    error_norm: f64,
    /// `None` when the entry lives in the store.
    payload: Option<Payload>,
}

enum Backing {
    InCore,
    OnDisk(Box<dyn Persistence>),
}

pub struct DiisSubspace {
    label: String,
    config: DiisConfig,
    error_layout: Option<Vec<SlotShape>>,
    solution_layout: Option<Vec<SlotShape>>,
    /// oldest first
    entries: VecDeque<Entry>,
    backing: Backing,
}

impl std::fmt::Debug for DiisSubspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiisSubspace")
            .field("label", &self.label)
            .field("config", &self.config)
            .field("size", &self.entries.len())
            .field("on_disk", &matches!(self.backing, Backing::OnDisk(_)))
            .finish()
    }
}

impl DiisSubspace {
    pub fn in_core(label: impl Into<String>, config: DiisConfig) -> Self {
        Self::with_backing(label.into(), config, Backing::InCore)
    }

    /// Entries are written to [`FileId::Diis`] of `store` and read back on extrapolation.
    pub fn on_disk(label: impl Into<String>, config: DiisConfig, store: Box<dyn Persistence>) -> Self {
        Self::with_backing(label.into(), config, Backing::OnDisk(store))
    }

    fn with_backing(label: String, config: DiisConfig, backing: Backing) -> Self {
        Self {
            label,
            config,
            error_layout: None,
            solution_layout: None,
            entries: VecDeque::with_capacity(config.max_vectors),
            backing,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn config(&self) -> &DiisConfig {
        &self.config
    }

    pub fn subspace_size(&self) -> usize {
        self.entries.len()
    }

    pub fn has_layout(&self) -> bool {
        self.error_layout.is_some() && self.solution_layout.is_some()
    }

    /// Declares the composite layout. Changing it discards stored entries.
    pub fn set_vector_slots(&mut self, errors: Vec<SlotShape>, solutions: Vec<SlotShape>) {
        if self.error_layout.as_ref() != Some(&errors)
            || self.solution_layout.as_ref() != Some(&solutions)
        {
            if !self.entries.is_empty() {
                log::debug!("{}: layout changed, clearing {} entries", self.label, self.entries.len());
            }
            self.entries.clear();
        }
        self.error_layout = Some(errors);
        self.solution_layout = Some(solutions);
    }

    pub fn reset_subspace(&mut self) {
        self.entries.clear();
    }

    /// Stores deep copies of an entry.
    ///
    /// Returns `Ok(false)` when the storage could not take the entry; the
    /// subspace is then unchanged. Slots that do not match the declared layout
    /// are an error.
    pub fn add_entry(&mut self, errors: &[SlotRef<'_>], solutions: &[SlotRef<'_>]) -> Result<bool> {
        self.verify("error", self.error_layout.as_deref(), errors.iter().map(SlotRef::shape))?;
        self.verify(
            "solution",
            self.solution_layout.as_deref(),
            solutions.iter().map(SlotRef::shape),
        )?;

        if self.config.max_vectors == 0 {
            return Ok(false);
        }

        let payload = Payload {
            errors: errors.iter().map(|s| s.to_slot()).collect(),
            solutions: solutions.iter().map(|s| s.to_slot()).collect(),
        };
        let error_norm = payload
            .errors
            .iter()
            .map(Slot::sum_of_squares)
            .sum::<f64>()
            .sqrt();

        let victim = (self.entries.len() >= self.config.max_vectors).then(|| self.victim());
        let position = match victim {
            Some(index) => self.entries[index].position,
            None => (0..)
                .find(|p| self.entries.iter().all(|e| e.position != *p))
                .unwrap_or(self.entries.len()),
        };

        let payload = match &mut self.backing {
            Backing::InCore => Some(payload),
            Backing::OnDisk(store) => {
                match write_payload(store.as_mut(), &entry_label(&self.label, position), &payload) {
                    Ok(()) => None,
                    Err(e) => {
                        log::warn!("{}: could not store entry: {e}", self.label);
                        return Ok(false);
                    }
                }
            }
        };

        if let Some(index) = victim {
            self.entries.remove(index);
        }
        self.entries.push_back(Entry {
            position,
            error_norm,
            payload,
        });
        Ok(true)
    }

    /// Writes `Σ c_i solution_i` into `out`, with the Pulay coefficients `c`.
    ///
    /// A singular system is retried without the oldest entry. With a single entry
    /// left the latest solution is copied unchanged.
    pub fn extrapolate(&mut self, out: &mut [SlotMut<'_>]) -> Result<Extrapolation> {
        self.verify(
            "output",
            self.solution_layout.as_deref(),
            out.iter().map(SlotMut::shape),
        )?;

        let n = self.entries.len();
        if n == 0 {
            return Ok(Extrapolation {
                coefficients: Vec::new(),
                dropped: 0,
            });
        }

        let payloads = load_payloads(&self.label, &self.entries, &mut self.backing)?;

        let b = utils::symmetric_matrix(n, |i, j| {
            payloads[i]
                .errors
                .iter()
                .zip(&payloads[j].errors)
                .map(|(a, b)| a.dot(b))
                .sum()
        });

        let mut dropped = 0;
        let coefficients = loop {
            let m = n - dropped;
            if m == 1 {
                break DVector::from_fn(1, |_, _| 1.0);
            }
            match solve_pulay(b.view((dropped, dropped), (m, m)).into_owned()) {
                Some(c) => break c,
                None => {
                    log::debug!(
                        "{}: singular subspace of {m} vectors, dropping the oldest",
                        self.label
                    );
                    dropped += 1;
                }
            }
        };

        for (k, slot) in out.iter_mut().enumerate() {
            slot.zero();
            for (c, payload) in coefficients.iter().zip(&payloads[dropped..]) {
                slot.axpy(*c, &payload.solutions[k]);
            }
        }

        let mut all = vec![0.0; dropped];
        all.extend(coefficients.iter());
        Ok(Extrapolation {
            coefficients: all,
            dropped,
        })
    }

    fn victim(&self) -> usize {
        match self.config.removal {
            RemovalPolicy::OldestAdded => 0,
            RemovalPolicy::LargestError => self
                .entries
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.error_norm.total_cmp(&b.error_norm))
                .map_or(0, |(i, _)| i),
        }
    }

    fn verify(
        &self,
        kind: &str,
        expected: Option<&[SlotShape]>,
        actual: impl ExactSizeIterator<Item = SlotShape>,
    ) -> Result<()> {
        let mismatch = |reason: String| SolverError::SlotMismatch {
            subspace: self.label.clone(),
            reason,
        };

        let expected = expected.ok_or_else(|| mismatch("vector slots were never declared".into()))?;
        if actual.len() != expected.len() {
            return Err(mismatch(format!(
                "expected {} {kind} slots, got {}",
                expected.len(),
                actual.len()
            )));
        }
        for (k, (shape, declared)) in actual.zip(expected).enumerate() {
            if shape != *declared {
                return Err(mismatch(format!(
                    "{kind} slot {k} has shape {shape:?}, declared {declared:?}"
                )));
            }
        }
        Ok(())
    }
}

fn entry_label(subspace: &str, position: usize) -> String {
    format!("{subspace} entry {position}")
}

fn load_payloads<'a>(
    label: &str,
    entries: &'a VecDeque<Entry>,
    backing: &mut Backing,
) -> Result<Vec<Cow<'a, Payload>>> {
    match backing {
        Backing::InCore => entries
            .iter()
            .map(|e| {
                e.payload.as_ref().map(Cow::Borrowed).ok_or_else(|| SolverError::Persistence {
                    file: label.to_owned(),
                    reason: "in-core entry without data".into(),
                })
            })
            .collect(),
        Backing::OnDisk(store) => {
            let mut file = ScopedFile::open(store.as_mut(), FileId::Diis, OpenMode::Existing)?;
            let mut payloads = Vec::with_capacity(entries.len());
            for entry in entries {
                let entry = entry_label(label, entry.position);
                let payload: Payload = file.read_json(&entry)?.ok_or_else(|| SolverError::Persistence {
                    file: FileId::Diis.to_string(),
                    reason: format!("missing entry {entry}"),
                })?;
                payloads.push(Cow::Owned(payload));
            }
            file.close()?;
            Ok(payloads)
        }
    }
}

fn write_payload(store: &mut dyn Persistence, label: &str, payload: &Payload) -> Result<()> {
    let mut file = ScopedFile::open(store, FileId::Diis, OpenMode::Existing)?;
    file.write_json(label, payload)?;
    file.close()
}

/// Solves the bordered system `[B -1; -1 0] [c; λ] = [0; -1]`.
fn solve_pulay(b: DMatrix<f64>) -> Option<DVector<f64>> {
    let n = b.nrows();
    let scale = b.diagonal().iter().fold(0.0f64, |acc, &v| acc.max(v));
    if !(scale > 0.0 && scale.is_finite()) {
        return None;
    }

    let matrix = DMatrix::from_fn(n + 1, n + 1, |i, j| match (i, j) {
        (i, j) if i == n && j == n => 0.0,
        (i, j) if i == n || j == n => -1.0,
        (i, j) => b[(i, j)] / scale,
    });
    let rhs = DVector::from_fn(n + 1, |i, _| if i == n { -1.0 } else { 0.0 });

    let qr = matrix.qr();
    let pivots = qr.r().diagonal().map(f64::abs);
    if pivots.min() <= SINGULAR_TOLERANCE * pivots.max() {
        return None;
    }

    let solution = qr.solve(&rhs)?;
    let coefficients = solution.rows(0, n).into_owned();
    coefficients
        .iter()
        .all(|c| c.is_finite() && c.abs() < MAX_COEFFICIENT)
        .then_some(coefficients)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::checkpoint::MemoryStore;

    fn row(values: &[f64]) -> BlockedMatrix {
        BlockedMatrix::from_blocks(vec![DMatrix::from_row_slice(1, values.len(), values)])
    }

    fn shape(n: usize) -> SlotShape {
        SlotRef::Matrix(&row(&vec![0.0; n])).shape()
    }

    fn subspace(config: DiisConfig, n: usize) -> DiisSubspace {
        let mut diis = DiisSubspace::in_core("test", config);
        diis.set_vector_slots(vec![shape(n)], vec![shape(1)]);
        diis
    }

    fn add(diis: &mut DiisSubspace, error: &[f64], solution: f64) -> bool {
        diis.add_entry(
            &[SlotRef::Matrix(&row(error))],
            &[SlotRef::Matrix(&row(&[solution]))],
        )
        .unwrap()
    }

    fn extrapolate(diis: &mut DiisSubspace) -> (f64, Extrapolation) {
        let mut out = row(&[0.0]);
        let info = diis.extrapolate(&mut [SlotMut::Matrix(&mut out)]).unwrap();
        (out.block(0)[(0, 0)], info)
    }

    #[test]
    fn two_orthogonal_errors_mix_equally() {
        let mut diis = subspace(DiisConfig::default(), 2);
        add(&mut diis, &[1.0, 0.0], 1.0);
        add(&mut diis, &[0.0, 1.0], 3.0);

        let (value, info) = extrapolate(&mut diis);
        assert_relative_eq!(info.coefficients[0], 0.5, epsilon = 1e-12);
        assert_relative_eq!(info.coefficients[1], 0.5, epsilon = 1e-12);
        assert_relative_eq!(value, 2.0, epsilon = 1e-12);
        assert_eq!(info.dropped, 0);
    }

    #[test]
    fn full_subspace_evicts_oldest() {
        let config = DiisConfig {
            max_vectors: 3,
            ..Default::default()
        };
        let mut diis = subspace(config, 4);
        for k in 0..4 {
            let mut error = [0.0; 4];
            error[k] = 1.0;
            assert!(add(&mut diis, &error, (k + 1) as f64));
        }
        assert_eq!(diis.subspace_size(), 3);

        // equal-norm orthogonal errors average the retained solutions 2, 3, 4
        let (value, _) = extrapolate(&mut diis);
        assert_relative_eq!(value, 3.0, epsilon = 1e-12);
    }

    #[test]
    fn largest_error_policy_evicts_worst_entry() {
        let config = DiisConfig {
            max_vectors: 3,
            removal: RemovalPolicy::LargestError,
            ..Default::default()
        };
        let mut diis = subspace(config, 4);
        add(&mut diis, &[1.0, 0.0, 0.0, 0.0], 1.0);
        add(&mut diis, &[0.0, 5.0, 0.0, 0.0], 100.0);
        add(&mut diis, &[0.0, 0.0, 1.0, 0.0], 2.0);
        add(&mut diis, &[0.0, 0.0, 0.0, 1.0], 3.0);

        assert_eq!(diis.subspace_size(), 3);
        let (value, _) = extrapolate(&mut diis);
        assert_relative_eq!(value, 2.0, epsilon = 1e-12);
    }

    #[test]
    fn identical_entries_fall_back_to_latest_solution() {
        let mut diis = subspace(DiisConfig::default(), 2);
        add(&mut diis, &[0.3, 0.4], 7.0);
        add(&mut diis, &[0.3, 0.4], 7.0);

        let (value, info) = extrapolate(&mut diis);
        assert_relative_eq!(value, 7.0, epsilon = 1e-10);
        let sum: f64 = info.coefficients.iter().sum();
        assert_relative_eq!(sum, 1.0, epsilon = 1e-10);
    }

    #[test]
    fn zero_errors_keep_latest_solution() {
        let mut diis = subspace(DiisConfig::default(), 2);
        add(&mut diis, &[0.0, 0.0], 1.0);
        add(&mut diis, &[0.0, 0.0], 2.0);

        let (value, info) = extrapolate(&mut diis);
        assert_eq!(value, 2.0);
        assert_eq!(info.dropped, 1);
        assert_eq!(info.coefficients, vec![0.0, 1.0]);
    }

    #[test]
    fn slots_must_match_declaration() {
        let mut diis = DiisSubspace::in_core("test", DiisConfig::default());
        let error = row(&[1.0, 0.0]);
        let solution = row(&[1.0]);

        let undeclared = diis.add_entry(&[SlotRef::Matrix(&error)], &[SlotRef::Matrix(&solution)]);
        assert!(matches!(undeclared, Err(SolverError::SlotMismatch { .. })));

        diis.set_vector_slots(vec![shape(2)], vec![shape(1)]);
        let wrong_count = diis.add_entry(
            &[SlotRef::Matrix(&error), SlotRef::Matrix(&error)],
            &[SlotRef::Matrix(&solution)],
        );
        assert!(matches!(wrong_count, Err(SolverError::SlotMismatch { .. })));

        let tensor = Tensor4::zeros([1, 1, 1, 2]);
        let wrong_kind = diis.add_entry(&[SlotRef::Tensor(&tensor)], &[SlotRef::Matrix(&solution)]);
        assert!(matches!(wrong_kind, Err(SolverError::SlotMismatch { .. })));
        assert_eq!(diis.subspace_size(), 0);
    }

    #[test]
    fn heterogeneous_slots_share_coefficients() {
        let mut diis = DiisSubspace::in_core("mixed", DiisConfig::default());
        let matrix_shape = shape(2);
        let tensor_shape = SlotShape::Tensor([1, 1, 1, 1]);
        diis.set_vector_slots(
            vec![matrix_shape.clone(), tensor_shape.clone()],
            vec![matrix_shape, tensor_shape],
        );

        let entries = [([1.0, 0.0], 0.0, [2.0, 0.0], 4.0), ([0.0, 0.0], 1.0, [0.0, 2.0], 8.0)];
        for (matrix_error, tensor_error, matrix_solution, tensor_solution) in entries {
            let me = row(&matrix_error);
            let te = Tensor4::from_fn([1, 1, 1, 1], |_, _, _, _| tensor_error);
            let ms = row(&matrix_solution);
            let ts = Tensor4::from_fn([1, 1, 1, 1], |_, _, _, _| tensor_solution);
            diis.add_entry(
                &[SlotRef::Matrix(&me), SlotRef::Tensor(&te)],
                &[SlotRef::Matrix(&ms), SlotRef::Tensor(&ts)],
            )
            .unwrap();
        }

        let mut matrix = row(&[0.0, 0.0]);
        let mut tensor = Tensor4::zeros([1, 1, 1, 1]);
        diis.extrapolate(&mut [SlotMut::Matrix(&mut matrix), SlotMut::Tensor(&mut tensor)])
            .unwrap();

        assert_relative_eq!(matrix.block(0)[(0, 0)], 1.0, epsilon = 1e-12);
        assert_relative_eq!(matrix.block(0)[(0, 1)], 1.0, epsilon = 1e-12);
        assert_relative_eq!(tensor[(0, 0, 0, 0)], 6.0, epsilon = 1e-12);
    }

    #[test]
    fn stored_entries_are_copies() {
        let mut diis = subspace(DiisConfig::default(), 2);
        let mut error = row(&[1.0, 0.0]);
        let mut solution = row(&[1.0]);
        diis.add_entry(&[SlotRef::Matrix(&error)], &[SlotRef::Matrix(&solution)])
            .unwrap();

        error.fill(9.0);
        solution.fill(9.0);
        let (value, _) = extrapolate(&mut diis);
        assert_eq!(value, 1.0);
    }

    #[test]
    fn coefficients_sum_to_one_for_random_subspaces() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut diis = subspace(DiisConfig::default(), 6);
        for _ in 0..5 {
            let error: Vec<f64> = (0..6).map(|_| rng.gen_range(-1.0..1.0)).collect();
            add(&mut diis, &error, rng.gen_range(-1.0..1.0));
        }

        let (_, info) = extrapolate(&mut diis);
        let sum: f64 = info.coefficients.iter().sum();
        assert_relative_eq!(sum, 1.0, epsilon = 1e-10);
    }

    #[test]
    fn on_disk_entries_extrapolate_like_in_core() {
        let mut diis = DiisSubspace::on_disk("disk", DiisConfig::default(), Box::new(MemoryStore::new()));
        diis.set_vector_slots(vec![shape(2)], vec![shape(1)]);
        add(&mut diis, &[1.0, 0.0], 1.0);
        add(&mut diis, &[0.0, 1.0], 3.0);

        let (value, info) = extrapolate(&mut diis);
        assert_relative_eq!(value, 2.0, epsilon = 1e-12);
        assert_relative_eq!(info.coefficients[0], 0.5, epsilon = 1e-12);
    }

    struct ReadOnlyStore(MemoryStore);

    impl Persistence for ReadOnlyStore {
        fn open(&mut self, file: FileId, mode: OpenMode) -> Result<()> {
            self.0.open(file, mode)
        }

        fn read_entry(&mut self, file: FileId, label: &str) -> Result<Option<Vec<u8>>> {
            self.0.read_entry(file, label)
        }

        fn write_entry(&mut self, file: FileId, _label: &str, _bytes: &[u8]) -> Result<()> {
            Err(SolverError::Persistence {
                file: file.to_string(),
                reason: "read only".into(),
            })
        }

        fn close(&mut self, file: FileId, keep: bool) -> Result<()> {
            self.0.close(file, keep)
        }

        fn is_open(&self, file: FileId) -> bool {
            self.0.is_open(file)
        }
    }

    #[test]
    fn storage_failure_is_reported_not_raised() {
        let mut diis = DiisSubspace::on_disk(
            "readonly",
            DiisConfig::default(),
            Box::new(ReadOnlyStore(MemoryStore::new())),
        );
        diis.set_vector_slots(vec![shape(2)], vec![shape(1)]);

        assert!(!add(&mut diis, &[1.0, 0.0], 1.0));
        assert_eq!(diis.subspace_size(), 0);
    }

    #[test]
    fn reset_clears_history() {
        let mut diis = subspace(DiisConfig::default(), 2);
        add(&mut diis, &[1.0, 0.0], 1.0);
        diis.reset_subspace();
        assert_eq!(diis.subspace_size(), 0);
        assert!(diis.has_layout());
    }
}
