//! Truncated Newton steps over orbital rotations and cumulant amplitudes.

use nalgebra::{DMatrix, DVector};

use crate::checkpoint::{Persistence, ScopedFile};
use crate::config::DcftOptions;
use crate::convergence::Criterion;
use crate::error::Result;
use crate::hf::SpinChannel;
use crate::krylov::{conjugate_gradient, davidson, LinearOperator};
use crate::linalg::utils;
use crate::report::{IterationObserver, IterationRecord, Phase};
use crate::step::FixedPointStep;

use super::driver::{tracker, ConvergenceState, Outcome};
use super::state::{DcftState, Snapshot};

const STABILITY_MAXITER: usize = 50;
const STABILITY_CONVERGENCE: f64 = 1e-5;

/// Jacobian of the residual vector by forward differences around a fixed point.
struct FiniteDifferenceJacobian<'s, 'a> {
    state: &'s mut DcftState<'a>,
    store: &'s mut dyn Persistence,
    base: Snapshot,
    residual: DVector<f64>,
    step: f64,
}

impl<'s, 'a> FiniteDifferenceJacobian<'s, 'a> {
    /// Expects `state` evaluated at the point of expansion.
    fn new(state: &'s mut DcftState<'a>, store: &'s mut dyn Persistence, step: f64) -> Self {
        Self {
            base: state.snapshot(),
            residual: state.residual_vector(),
            state,
            store,
            step,
        }
    }
}

impl LinearOperator for FiniteDifferenceJacobian<'_, '_> {
    fn dim(&self) -> usize {
        self.residual.len()
    }

    fn apply(&mut self, vector: &DVector<f64>) -> Result<DVector<f64>> {
        let norm = vector.norm();
        if norm == 0.0 {
            return Ok(DVector::zeros(vector.len()));
        }
        // scale so the displacement has length `step`
        let scale = self.step / norm;
        self.state.restore(&self.base);
        take_step(self.state, &(vector * scale));
        self.state.evaluate(self.store)?;
        let displaced = self.state.residual_vector();
        self.state.restore(&self.base);
        Ok((displaced - &self.residual) / scale)
    }
}

/// `M (M^T M)^(-1/2)`, the orthonormal matrix closest to `M`.
fn orthonormalize(m: DMatrix<f64>) -> DMatrix<f64> {
    let eigen = (m.transpose() * &m).symmetric_eigen();
    let inverse_root = eigen.eigenvalues.map(|w| 1.0 / w.sqrt());
    &m * &eigen.eigenvectors * DMatrix::from_diagonal(&inverse_root) * eigen.eigenvectors.transpose()
}

/// Rotates the orbitals by the leading occupied-virtual part of `x` and adds
/// the rest to the independent cumulant amplitudes.
fn take_step(state: &mut DcftState<'_>, x: &DVector<f64>) {
    let mut orbitals = state.orbitals().clone();
    let mut offset = 0;
    for spin in SpinChannel::BOTH {
        let channel = orbitals.spin_mut(spin);
        let nmopi = channel.nmopi();
        let noccpi = channel.noccpi().clone();
        let mut coefficients = channel.coefficients().clone();
        for (h, (&nocc, &nmo)) in noccpi.iter().zip(&nmopi).enumerate() {
            if nocc == 0 || nocc == nmo {
                continue;
            }
            let mut k = DMatrix::identity(nmo, nmo);
            for (i, a) in itertools::iproduct!(0..nocc, nocc..nmo) {
                k[(a, i)] = x[offset];
                k[(i, a)] = -x[offset];
                offset += 1;
            }
            let rotated = coefficients.block(h) * orthonormalize(k);
            *coefficients.block_mut(h) = rotated;
        }
        let energies = channel.energies().clone();
        channel.set_orbitals(coefficients, energies);
    }
    state.set_orbitals(&orbitals);

    let mut lambda = state.lambda().clone();
    for (case, index) in lambda.unique_indices() {
        let value = lambda.get(case, index) + x[offset];
        lambda.set(case, index, value);
        offset += 1;
    }
    state.set_lambda(&lambda);
}

/// Diagonal estimate of the Jacobian: orbital energy gaps and minus the
/// cumulant denominators.
fn preconditioner(state: &DcftState<'_>) -> DVector<f64> {
    let mut diagonal = Vec::new();
    let step = state.orbital_step();
    for spin in SpinChannel::BOTH {
        let channel = state.orbitals().spin(spin);
        let mo = step.mo_fock(spin);
        let nmopi = channel.nmopi();
        for (h, &nocc) in channel.noccpi().iter().enumerate() {
            let block = mo.block(h);
            for (i, a) in itertools::iproduct!(0..nocc, nocc..nmopi[h]) {
                diagonal.push(block[(a, a)] - block[(i, i)]);
            }
        }
    }
    let cumulant = state.cumulant_step();
    for (case, index) in state.lambda().unique_indices() {
        diagonal.push(-cumulant.denominator(case, index));
    }
    DVector::from_vec(diagonal)
}

pub fn run(
    state: &mut DcftState<'_>,
    options: &DcftOptions,
    file: &mut ScopedFile<'_>,
    observer: &mut dyn IterationObserver,
) -> Result<Outcome> {
    let mut tracker = tracker(options);
    let mut flags = ConvergenceState::default();
    state.evaluate(file.store_mut())?;

    let mut cycle = 0;
    loop {
        let gradient = state.orbital_step().residual_norm();
        let rms = state.cumulant_step().residual_norm();
        let energy = state.total_energy();
        tracker.record(Criterion::OrbitalGradient, gradient)?;
        tracker.record(Criterion::Cumulant, rms)?;
        tracker.record(Criterion::Energy, energy)?;
        flags.scf_done = tracker.is_converged(Criterion::OrbitalGradient);
        flags.lambda_done = tracker.is_converged(Criterion::Cumulant);
        flags.energy_converged = tracker.is_converged(Criterion::Energy);
        flags.orbital_residual = gradient;
        flags.cumulant_residual = rms;
        if flags.fully_converged() || cycle == options.maxiter {
            break;
        }
        cycle += 1;
        let mut record = IterationRecord::new(Phase::Newton, cycle, 0);

        let rhs = -state.residual_vector();
        let diagonal = preconditioner(state);
        let tolerance = options.qc_cg_convergence.min(0.01 * utils::rms(rhs.as_slice()));
        let before = state.orbitals().densities();
        let base = state.snapshot();
        let outcome = {
            let mut jacobian = FiniteDifferenceJacobian::new(state, file.store_mut(), options.qc_fd_step);
            conjugate_gradient(
                &mut jacobian,
                &rhs,
                &diagonal,
                options.qc_cg_maxiter,
                tolerance,
            )?
        };
        if outcome.negative_curvature {
            log::debug!("Newton step {cycle}: non-positive curvature after {} CG iterations", outcome.iterations);
        }

        state.restore(&base);
        take_step(state, &outcome.solution);
        state.evaluate(file.store_mut())?;

        let after = state.orbitals().densities();
        let change = (0.5 * (after.0.sub(&before.0).rms().powi(2) + after.1.sub(&before.1).rms().powi(2))).sqrt();
        tracker.record(Criterion::Density, change)?;
        flags.density_converged = tracker.is_converged(Criterion::Density);
        flags.density_residual = change;
        state.save(file)?;

        record.micro_iteration = outcome.iterations;
        record.energy = state.total_energy();
        record.delta_energy = record.energy - energy;
        record.orbital_residual = Some(gradient);
        record.cumulant_residual = Some(rms);
        record.density_residual = Some(change);
        observer.on_iteration(&record);
    }

    Ok(Outcome {
        convergence: flags,
        macro_iterations: cycle,
    })
}

/// Lowest eigenvalues of the symmetrized Jacobian at the current point. A
/// negative one means the solution is a saddle point.
pub fn stability_check(
    state: &mut DcftState<'_>,
    options: &DcftOptions,
    store: &mut dyn Persistence,
) -> Result<Vec<f64>> {
    state.evaluate(store)?;
    let diagonal = preconditioner(state);
    let base = state.snapshot();
    let outcome = {
        let mut jacobian = FiniteDifferenceJacobian::new(state, store, options.qc_fd_step);
        davidson(
            &mut jacobian,
            &diagonal,
            options.stability_nroots,
            STABILITY_MAXITER,
            STABILITY_CONVERGENCE,
            8 * options.stability_nroots,
        )?
    };
    state.restore(&base);
    state.evaluate(store)?;

    if !outcome.converged {
        log::warn!("stability analysis did not converge in {} iterations", outcome.iterations);
    }
    for (root, value) in outcome.eigenvalues.iter().enumerate() {
        if *value < 0.0 {
            log::warn!("negative Jacobian eigenvalue {value:.6e} (root {root}), the solution is not a minimum");
        } else {
            log::info!("Jacobian eigenvalue {value:.6e} (root {root})");
        }
    }
    Ok(outcome.eigenvalues)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::checkpoint::MemoryStore;
    use crate::dcft::state::tests::reference;
    use crate::hf::ScfDriver;

    #[test]
    fn orthonormalized_rotation_is_orthogonal() {
        let mut k = DMatrix::identity(3, 3);
        k[(2, 0)] = 0.3;
        k[(0, 2)] = -0.3;
        k[(1, 0)] = -0.1;
        k[(0, 1)] = 0.1;
        let u = orthonormalize(k);
        assert_relative_eq!(u.transpose() * &u, DMatrix::identity(3, 3), epsilon = 1e-12);
        assert!(u[(2, 0)] > 0.0 && u[(0, 2)] < 0.0);
    }

    #[test]
    fn small_rotation_is_first_order() {
        let mut k = DMatrix::identity(2, 2);
        k[(1, 0)] = 1e-4;
        k[(0, 1)] = -1e-4;
        let u = orthonormalize(k.clone());
        assert_relative_eq!(u, k, epsilon = 1e-8);
    }

    fn with_state(body: impl FnOnce(&mut DcftState, &mut MemoryStore)) {
        let (system, output) = reference();
        let options = DcftOptions::default();
        let driver = ScfDriver::new(&system, options.reference.clone()).unwrap();
        let mut store = MemoryStore::new();
        let mut state = DcftState::new(
            &system,
            driver.orthogonalizer(),
            driver.fock_builder(),
            &output,
            &options,
            &mut store,
        )
        .unwrap();
        state.evaluate(&mut store).unwrap();
        body(&mut state, &mut store);
    }

    #[test]
    fn jacobian_is_homogeneous() {
        with_state(|state, store| {
            let n = state.residual_vector().len();
            let mut jacobian = FiniteDifferenceJacobian::new(state, store, 1e-6);
            let v = DVector::from_fn(n, |k, _| ((k % 5) as f64 - 2.0) * 0.1);
            let once = jacobian.apply(&v).unwrap();
            let twice = jacobian.apply(&(&v * 2.0)).unwrap();
            assert_relative_eq!(twice, once * 2.0, epsilon = 1e-10);
            assert_eq!(jacobian.apply(&DVector::zeros(n)).unwrap().norm(), 0.0);
        });
    }

    #[test]
    fn newton_step_reduces_the_residual() {
        with_state(|state, store| {
            let residual = state.residual_vector();
            let diagonal = preconditioner(state);
            assert!(diagonal.iter().all(|&d| d > 0.0));

            let base = state.snapshot();
            let outcome = {
                let mut jacobian = FiniteDifferenceJacobian::new(state, store, 1e-6);
                conjugate_gradient(&mut jacobian, &(-&residual), &diagonal, 50, 1e-10).unwrap()
            };
            state.restore(&base);
            take_step(state, &outcome.solution);
            state.evaluate(store).unwrap();
            assert!(state.residual_vector().norm() < 0.5 * residual.norm());
        });
    }
}
