use std::hash::Hash;
use std::ops::Index;

use crate::error::{Result, SolverError};

/// An integral index used in the two-electron integrals of a basis set.
///
/// The index represents the four indices (x, y, z, w) used to calculate a two-electron integral:
///   int_{x,y,z,w} = int_{xy|zw} = (x y | z w)
///
/// Since two-electron integrals are symmetric in (xy), in (zw) and under (xy) <-> (zw), this struct
/// stores its indices in canonical order: x >= y, z >= w and xy >= zw.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) struct IntegralIndex(usize, usize, usize, usize);

#[inline(always)]
const fn pair(i: usize, j: usize) -> usize {
    i * (i + 1) / 2 + j
}

impl IntegralIndex {
    /// Creates a new integral index with the given indices.
    pub(crate) const fn new(index: (usize, usize, usize, usize)) -> Self {
        let (i, j, k, l) = Self::correct_order(index);
        Self(i, j, k, l)
    }

    /// Returns the indices in canonical order.
    #[inline(always)]
    const fn correct_order(
        (i, j, k, l): (usize, usize, usize, usize),
    ) -> (usize, usize, usize, usize) {
        let (i, j) = if i >= j { (i, j) } else { (j, i) };
        let (k, l) = if k >= l { (k, l) } else { (l, k) };

        if pair(i, j) >= pair(k, l) {
            (i, j, k, l)
        } else {
            (k, l, i, j)
        }
    }

    /// Position in the packed storage.
    pub(crate) const fn linear(&self) -> usize {
        let &Self(i, j, k, l) = self;
        let ij = pair(i, j);
        let kl = pair(k, l);
        pair(ij, kl)
    }
}

impl std::fmt::Display for IntegralIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let &Self(i, j, k, l) = self;
        write!(f, "({} {}|{} {})", i, j, k, l)
    }
}

/// The electron repulsion integrals (chemists' notation) over all SO functions,
/// with only the symmetry-unique values stored.
#[derive(Clone, Debug, PartialEq)]
pub struct ElectronTensor {
    data: Vec<f64>,
    /// side length
    size: usize,
}

fn packed_len(size: usize) -> usize {
    let pairs = size * (size + 1) / 2;
    pairs * (pairs + 1) / 2
}

impl ElectronTensor {
    pub fn zeros(size: usize) -> Self {
        Self {
            data: vec![0.0; packed_len(size)],
            size,
        }
    }

    /// Builds the tensor from the unique integrals given in any of their eight
    /// equivalent orders.
    pub fn from_unique(
        size: usize,
        integrals: impl IntoIterator<Item = ([usize; 4], f64)>,
    ) -> Result<Self> {
        let mut tensor = Self::zeros(size);
        for ([i, j, k, l], value) in integrals {
            if [i, j, k, l].iter().any(|&x| x >= size) {
                return Err(SolverError::configuration(format!(
                    "integral ({i} {j}|{k} {l}) is outside a basis of {size} functions"
                )));
            }
            let index = IntegralIndex::new((i, j, k, l));
            log::trace!("ERI {index} = {value:<1.8}");
            tensor.data[index.linear()] = value;
        }
        Ok(tensor)
    }

    /// Evaluates `func` once for every unique integral.
    pub fn from_fn(size: usize, func: impl Fn(usize, usize, usize, usize) -> f64 + Sync) -> Self {
        let mut to_compute = Vec::with_capacity(packed_len(size));
        for i in 0..size {
            for j in 0..=i {
                for k in 0..=i {
                    let l_max = if k == i { j } else { k };
                    for l in 0..=l_max {
                        to_compute.push(IntegralIndex(i, j, k, l));
                    }
                }
            }
        }

        let mut data = vec![0.0; packed_len(size)];

        #[cfg(feature = "rayon")]
        {
            use rayon::iter::{ParallelBridge, ParallelIterator};

            to_compute
                .chunks(512)
                .par_bridge()
                .map(|indices| {
                    indices
                        .iter()
                        .map(|index @ &IntegralIndex(x, y, z, w)| (index.linear(), func(x, y, z, w)))
                        .collect::<Vec<_>>()
                })
                .collect::<Vec<_>>() // iterators are lazy - we collect to evaluate all elements
                .into_iter()
                .flatten()
                .for_each(|(index, integral)| data[index] = integral);
        }

        #[cfg(not(feature = "rayon"))]
        to_compute
            .into_iter()
            .for_each(|index @ IntegralIndex(x, y, z, w)| {
                data[index.linear()] = func(x, y, z, w);
            });

        Self { data, size }
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Index<(usize, usize, usize, usize)> for ElectronTensor {
    type Output = f64;

    fn index(&self, index: (usize, usize, usize, usize)) -> &Self::Output {
        &self.data[IntegralIndex::new(index).linear()]
    }
}
