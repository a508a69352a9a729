use nalgebra::{DMatrix, DVector, SymmetricEigen};

#[inline(always)]
/// Create a symmetric, square matrix. Function is only run for upper triangle of the matrix
pub(crate) fn symmetric_matrix(
    n: usize,
    mut func: impl FnMut(usize, usize) -> f64,
) -> DMatrix<f64> {
    let m = DMatrix::from_fn(n, n, |i, j| if i <= j { func(i, j) } else { 0.0 });
    DMatrix::from_fn(n, n, |i, j| if i <= j { m[(i, j)] } else { m[(j, i)] })
}

pub(crate) fn eigs(matrix: DMatrix<f64>) -> (DMatrix<f64>, DVector<f64>) {
    let eigs = SymmetricEigen::new(matrix);
    (eigs.eigenvectors, eigs.eigenvalues)
}

/// Eigenpairs of a symmetric matrix, sorted by ascending eigenvalue.
pub(crate) fn sorted_eigs(matrix: DMatrix<f64>) -> (DMatrix<f64>, DVector<f64>) {
    let n = matrix.nrows();
    if n == 0 {
        return (DMatrix::zeros(0, 0), DVector::zeros(0));
    }

    let (eigenvectors, eigenvalues) = eigs(matrix);

    let mut val_vec_pairs = eigenvalues
        .into_iter()
        .zip(eigenvectors.column_iter())
        .collect::<Vec<_>>();

    val_vec_pairs.sort_unstable_by(|(a, _), (b, _)| a.total_cmp(b));

    let (values, vectors): (Vec<_>, Vec<_>) = val_vec_pairs.into_iter().unzip();

    (
        DMatrix::from_columns(&vectors),
        DVector::from_column_slice(&values),
    )
}

/// Root mean square of a slice, zero for an empty slice.
pub(crate) fn rms(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    (values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt()
}

/// `(A + A^T) / 2`
pub(crate) fn symmetrize(matrix: &DMatrix<f64>) -> DMatrix<f64> {
    (matrix + matrix.transpose()) * 0.5
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    use super::*;

    #[test]
    fn sorted_eigs_are_ascending() {
        let matrix = DMatrix::from_row_slice(3, 3, &[2.0, 0.1, 0.0, 0.1, -1.0, 0.2, 0.0, 0.2, 0.5]);
        let (vectors, values) = sorted_eigs(matrix.clone());

        assert!(values[0] <= values[1] && values[1] <= values[2]);
        for k in 0..3 {
            let residual = &matrix * vectors.column(k) - vectors.column(k) * values[k];
            assert!(residual.norm() < 1e-10);
        }
    }

    #[test]
    fn symmetric_matrix_mirrors_upper_triangle() {
        let m = symmetric_matrix(3, |i, j| (10 * i + j) as f64);
        assert_relative_eq!(m[(2, 0)], m[(0, 2)]);
        assert_relative_eq!(m[(1, 2)], 12.0);
        assert_relative_eq!(m[(2, 1)], 12.0);
    }

    #[test]
    fn rms_of_empty_slice_is_zero() {
        assert_eq!(rms(&[]), 0.0);
        assert_relative_eq!(rms(&[3.0, 4.0]), (12.5f64).sqrt());
    }
}
