use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

/// A dense four-index tensor in row-major order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor4 {
    dims: [usize; 4],
    data: Vec<f64>,
}

impl Tensor4 {
    pub fn zeros(dims: [usize; 4]) -> Self {
        Self {
            dims,
            data: vec![0.0; dims.iter().product()],
        }
    }

    pub fn from_fn(
        dims: [usize; 4],
        mut func: impl FnMut(usize, usize, usize, usize) -> f64,
    ) -> Self {
        let mut tensor = Self::zeros(dims);
        for (i, j, k, l) in itertools::iproduct!(0..dims[0], 0..dims[1], 0..dims[2], 0..dims[3]) {
            tensor[(i, j, k, l)] = func(i, j, k, l);
        }
        tensor
    }

    pub fn dims(&self) -> [usize; 4] {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    #[inline(always)]
    pub fn linear(&self, (i, j, k, l): (usize, usize, usize, usize)) -> usize {
        let [_, n1, n2, n3] = self.dims;
        ((i * n1 + j) * n2 + k) * n3 + l
    }

    pub fn copy_from(&mut self, other: &Self) {
        assert_eq!(self.dims, other.dims, "tensor shape mismatch in copy");
        self.data.copy_from_slice(&other.data);
    }

    pub fn fill(&mut self, value: f64) {
        self.data.fill(value);
    }

    pub fn scale_mut(&mut self, factor: f64) {
        self.data.iter_mut().for_each(|v| *v *= factor);
    }

    /// `self += alpha * other`
    pub fn axpy(&mut self, alpha: f64, other: &Self) {
        self.data
            .iter_mut()
            .zip(&other.data)
            .for_each(|(a, b)| *a += alpha * b);
    }

    pub fn dot(&self, other: &Self) -> f64 {
        self.data.iter().zip(&other.data).map(|(a, b)| a * b).sum()
    }

    pub fn sum_of_squares(&self) -> f64 {
        self.dot(self)
    }

    pub fn rms(&self) -> f64 {
        super::utils::rms(&self.data)
    }
}

impl Index<(usize, usize, usize, usize)> for Tensor4 {
    type Output = f64;

    fn index(&self, index: (usize, usize, usize, usize)) -> &Self::Output {
        &self.data[self.linear(index)]
    }
}

impl IndexMut<(usize, usize, usize, usize)> for Tensor4 {
    fn index_mut(&mut self, index: (usize, usize, usize, usize)) -> &mut Self::Output {
        let linear = self.linear(index);
        &mut self.data[linear]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_major_layout() {
        let t = Tensor4::from_fn([2, 3, 4, 5], |i, j, k, l| (1000 * i + 100 * j + 10 * k + l) as f64);
        assert_eq!(t[(1, 2, 3, 4)], 1234.0);
        assert_eq!(t.as_slice()[t.linear((1, 0, 0, 0))], 1000.0);
        assert_eq!(t.len(), 120);
    }

    #[test]
    fn empty_tensor_has_zero_rms() {
        let t = Tensor4::zeros([0, 2, 2, 2]);
        assert!(t.is_empty());
        assert_eq!(t.rms(), 0.0);
    }
}
