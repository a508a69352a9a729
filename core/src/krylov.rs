//! Matrix-free Krylov solvers for the Newton equations and the stability check.

use nalgebra::{DMatrix, DVector};

use crate::error::Result;
use crate::linalg::utils;

/// Smallest preconditioner or correction denominator used as is.
const DENOMINATOR_FLOOR: f64 = 1e-8;
/// Corrections keeping less than this fraction of their norm after
/// orthogonalization are treated as linearly dependent.
const LINEAR_DEPENDENCE: f64 = 1e-4;

/// A linear map that is only available through its action on a vector.
pub trait LinearOperator {
    fn dim(&self) -> usize;

    fn apply(&mut self, vector: &DVector<f64>) -> Result<DVector<f64>>;
}

#[derive(Clone, Debug)]
pub struct CgOutcome {
    pub solution: DVector<f64>,
    pub iterations: usize,
    pub residual_norm: f64,
    pub converged: bool,
    /// The iteration stopped on a direction with non-positive curvature.
    pub negative_curvature: bool,
}

fn precondition(residual: &DVector<f64>, diagonal: &DVector<f64>) -> DVector<f64> {
    residual.zip_map(diagonal, |r, d| {
        if d.abs() > DENOMINATOR_FLOOR {
            r / d
        } else {
            r
        }
    })
}

/// Preconditioned conjugate gradients for `A x = rhs`, starting from zero.
///
/// Stops when the RMS residual drops below `tolerance` or a search direction
/// has non-positive curvature. If that happens on the very first direction the
/// preconditioned right-hand side is returned instead.
pub fn conjugate_gradient<Op: LinearOperator + ?Sized>(
    op: &mut Op,
    rhs: &DVector<f64>,
    diagonal: &DVector<f64>,
    max_iterations: usize,
    tolerance: f64,
) -> Result<CgOutcome> {
    let mut x = DVector::zeros(rhs.len());
    let mut r = rhs.clone();
    let mut z = precondition(&r, diagonal);
    let mut p = z.clone();
    let mut rz = r.dot(&z);
    let mut residual_norm = utils::rms(r.as_slice());

    let mut outcome = CgOutcome {
        solution: x.clone(),
        iterations: 0,
        residual_norm,
        converged: residual_norm < tolerance,
        negative_curvature: false,
    };
    if outcome.converged {
        return Ok(outcome);
    }

    for iteration in 1..=max_iterations {
        let ap = op.apply(&p)?;
        let curvature = p.dot(&ap);
        if curvature <= 0.0 || !curvature.is_finite() {
            log::debug!("CG: curvature {curvature:.3e} at iteration {iteration}");
            outcome.negative_curvature = true;
            if iteration == 1 {
                x = z;
            }
            break;
        }

        let alpha = rz / curvature;
        x.axpy(alpha, &p, 1.0);
        r.axpy(-alpha, &ap, 1.0);
        residual_norm = utils::rms(r.as_slice());
        outcome.iterations = iteration;
        log::trace!("CG iteration {iteration}: residual {residual_norm:.3e}");

        if residual_norm < tolerance {
            outcome.converged = true;
            break;
        }

        z = precondition(&r, diagonal);
        let rz_next = r.dot(&z);
        let beta = rz_next / rz;
        rz = rz_next;
        p = &z + &p * beta;
    }

    outcome.solution = x;
    outcome.residual_norm = residual_norm;
    Ok(outcome)
}

#[derive(Clone, Debug)]
pub struct DavidsonOutcome {
    /// Lowest eigenvalues, ascending.
    pub eigenvalues: Vec<f64>,
    pub iterations: usize,
    pub converged: bool,
}

/// Lowest eigenvalues of the symmetric part of `op` by Davidson-Liu iteration.
///
/// The subspace matrix is symmetrized, so for a non-symmetric operator the
/// result converges to the eigenvalues of `(A + A^T) / 2` once the subspace
/// spans the space.
pub fn davidson<Op: LinearOperator + ?Sized>(
    op: &mut Op,
    diagonal: &DVector<f64>,
    nroots: usize,
    max_iterations: usize,
    tolerance: f64,
    max_space: usize,
) -> Result<DavidsonOutcome> {
    let n = op.dim();
    let nroots = nroots.min(n);
    if nroots == 0 {
        return Ok(DavidsonOutcome {
            eigenvalues: Vec::new(),
            iterations: 0,
            converged: true,
        });
    }
    let max_space = max_space.max(2 * nroots).min(n);

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| diagonal[a].total_cmp(&diagonal[b]));
    let mut basis: Vec<DVector<f64>> = order[..nroots]
        .iter()
        .map(|&i| DVector::from_fn(n, |k, _| if k == i { 1.0 } else { 0.0 }))
        .collect();
    let mut sigma: Vec<DVector<f64>> = Vec::new();

    let mut eigenvalues = Vec::new();
    for iteration in 1..=max_iterations {
        for vector in &basis[sigma.len()..] {
            sigma.push(op.apply(vector)?);
        }

        let k = basis.len();
        let projected = utils::symmetric_matrix(k, |i, j| {
            0.5 * (basis[i].dot(&sigma[j]) + basis[j].dot(&sigma[i]))
        });
        let (vectors, values) = utils::sorted_eigs(projected);
        eigenvalues = values.iter().take(nroots).copied().collect();

        let mut ritz = Vec::with_capacity(nroots);
        let mut corrections = Vec::new();
        let mut max_residual = 0.0f64;
        for root in 0..nroots {
            let y: Vec<f64> = vectors.column(root).iter().copied().collect();
            let theta = values[root];
            let x = combine(&basis, &y);
            let ax = combine(&sigma, &y);
            let residual = &ax - &x * theta;
            let norm = residual.norm();
            max_residual = max_residual.max(norm);
            if norm > tolerance {
                corrections.push(residual.zip_map(diagonal, |r, d| {
                    let denominator = theta - d;
                    if denominator.abs() > DENOMINATOR_FLOOR {
                        r / denominator
                    } else {
                        r
                    }
                }));
            }
            ritz.push((x, ax));
        }

        log::debug!("Davidson iteration {iteration}: subspace {k}, residual {max_residual:.3e}");
        if max_residual < tolerance || k >= n {
            return Ok(DavidsonOutcome {
                eigenvalues,
                iterations: iteration,
                converged: true,
            });
        }

        if k + corrections.len() > max_space {
            let (x, ax): (Vec<_>, Vec<_>) = ritz.into_iter().unzip();
            basis = x;
            sigma = ax;
        }

        let before = basis.len();
        for mut correction in corrections {
            let scale = correction.norm();
            if scale == 0.0 {
                continue;
            }
            correction /= scale;
            // twice for numerical orthogonality
            for _ in 0..2 {
                for v in &basis {
                    let overlap = v.dot(&correction);
                    correction.axpy(-overlap, v, 1.0);
                }
            }
            let norm = correction.norm();
            if norm > LINEAR_DEPENDENCE && basis.len() < n {
                basis.push(correction / norm);
            }
        }
        if basis.len() == before {
            return Ok(DavidsonOutcome {
                eigenvalues,
                iterations: iteration,
                converged: max_residual < tolerance,
            });
        }
    }

    Ok(DavidsonOutcome {
        eigenvalues,
        iterations: max_iterations,
        converged: false,
    })
}

fn combine(vectors: &[DVector<f64>], coefficients: &[f64]) -> DVector<f64> {
    let n = vectors.first().map_or(0, |v| v.len());
    vectors
        .iter()
        .zip(coefficients)
        .fold(DVector::zeros(n), |acc, (v, &c)| acc + v * c)
}

/// An explicit matrix, mostly useful to check the matrix-free paths.
impl LinearOperator for DMatrix<f64> {
    fn dim(&self) -> usize {
        self.nrows()
    }

    fn apply(&mut self, vector: &DVector<f64>) -> Result<DVector<f64>> {
        Ok(&*self * vector)
    }
}
